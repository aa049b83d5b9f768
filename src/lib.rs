#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Pingdom operator
//!
//! Keeps an external set of Pingdom HTTP checks in sync with the hosts
//! advertised by annotated ingresses. The ingress watch and the
//! `PingdomCheck` resource watch each feed one event queue consumed by a
//! single reconciler task; the ids of created checks are persisted in an
//! ingress annotation so a restarted process can recover the association
//! without asking the check service.

pub mod k8s;
pub mod operator;
pub mod pingdom;
mod store;

pub use self::store::Store;

use crate::k8s::check::{self, PingdomCheck};
use crate::k8s::{Ingress, ResourceClient, WatchEvent};
use crate::operator::{ClusterIngresses, Event, Operator};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info_span, warn, Instrument};

/// Pause before re-listing after a watch stream ends or fails.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Interval at which the ingress watch re-lists even without a failure.
/// A re-list replays every ingress as an add event; the bindings
/// annotation keeps replays idempotent.
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Runs the operator until `stop` signals shutdown.
///
/// Registration and readiness of the `PingdomCheck` kind happen first and
/// are fatal if they fail; the watch loops and the reconciler run until
/// stopped, re-listing after any stream failure.
pub async fn run(
    client: kube::Client,
    checks_api: pingdom::Client,
    namespace: Option<String>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let store = Arc::new(Store::new(tx.clone()));

    let check_specs =
        ResourceClient::<PingdomCheck>::new(client.clone(), check::kind_desc(namespace.clone()));
    check_specs.register().await?;
    check_specs.wait_ready().await?;

    let ingresses = ResourceClient::<Ingress>::new(client.clone(), k8s::ingress_kind(namespace));

    let specs_task = tokio::spawn({
        let store = store.clone();
        let stop = stop.clone();
        async move { watch_check_specs(check_specs, store, stop).await }
            .instrument(info_span!("pingdomchecks"))
    });

    let ingress_task = tokio::spawn({
        let tx = tx.clone();
        let stop = stop.clone();
        async move { watch_ingresses(ingresses, tx, stop).await }
            .instrument(info_span!("ingresses"))
    });

    let reconciler = Operator::new(checks_api, ClusterIngresses::new(client), store);
    let reconcile_task = tokio::spawn(reconciler.run(rx, stop).instrument(info_span!("reconcile")));

    drop(tx);

    let (specs, ingresses, _) = tokio::try_join!(specs_task, ingress_task, reconcile_task)?;
    specs?;
    ingresses?;
    Ok(())
}

/// Keeps the `PingdomCheck` watch alive, applying every notification to the
/// store (which forwards change events to the reconciler).
async fn watch_check_specs(
    client: ResourceClient<PingdomCheck>,
    store: Arc<Store>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let res = tokio::select! {
            _ = stop.changed() => return Ok(()),
            res = client.watch(|event| match event {
                WatchEvent::Added(check) | WatchEvent::Modified(check) => store.apply(check),
                WatchEvent::Deleted(check) => store.delete(check),
            }) => res,
        };
        match res {
            Ok(()) => debug!("watch stream closed"),
            Err(error) => warn!(?error, "watch failed"),
        }
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            _ = time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Keeps the ingress watch alive, forwarding typed events to the
/// reconciler and forcing a periodic re-list.
async fn watch_ingresses(
    client: ResourceClient<Ingress>,
    tx: mpsc::UnboundedSender<Event>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let res = tokio::select! {
            _ = stop.changed() => return Ok(()),
            res = client.watch(|event| {
                let event = match event {
                    WatchEvent::Added(ingress) => Event::IngressAdded(ingress),
                    WatchEvent::Modified(ingress) => Event::IngressUpdated(ingress),
                    WatchEvent::Deleted(ingress) => Event::IngressDeleted(ingress),
                };
                let _ = tx.send(event);
            }) => res,
            _ = time::sleep(RESYNC_INTERVAL) => {
                debug!("resync interval elapsed");
                Ok(())
            }
        };
        match res {
            Ok(()) => debug!("watch stream closed"),
            Err(error) => warn!(?error, "watch failed"),
        }
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            _ = time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
