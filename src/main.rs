#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use pingdom_operator::pingdom;
use structopt::StructOpt;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pingdom-operator",
    about = "Keeps Pingdom HTTP checks in sync with annotated ingresses"
)]
struct Args {
    /// Namespace to watch; all namespaces when unset.
    #[structopt(long)]
    namespace: Option<String>,

    /// Base URL of the check service API.
    #[structopt(long, default_value = "https://api.pingdom.com/api/2.0")]
    pingdom_api_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let Args {
        namespace,
        pingdom_api_url,
    } = Args::from_args();

    let client = kube::Client::try_default().await?;
    let checks_api = pingdom::Client::from_env(pingdom_api_url)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut run = tokio::spawn(pingdom_operator::run(client, checks_api, namespace, stop_rx));

    tokio::select! {
        res = &mut run => return res?,
        _ = shutdown_signal() => info!("received shutdown signal"),
    }

    let _ = stop_tx.send(true);
    run.await?
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let term = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => futures::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term => {}
    }
}
