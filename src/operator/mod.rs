//! The reconciliation event loop.
//!
//! All ingress and check-spec notifications are merged onto one channel and
//! handled on a single task, one event at a time, so the handlers need no
//! internal locking and external calls for one event finish before the next
//! event is looked at.

mod checks;

use self::checks::CheckIds;
use crate::k8s::check::PingdomCheckSpec;
use crate::k8s::{Ingress, ResourceExt};
use crate::pingdom::{CheckApi, CheckId};
use crate::store::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info_span, warn, Instrument};

/// Annotation whose presence opts an ingress into uptime checks; its value
/// names the `PingdomCheck` resource that configures them.
pub const CHECK_ANNOTATION: &str = "monitoring.rossfairbanks.com/pingdom";

/// Annotation holding the JSON map of host name to external check id.
pub const CHECKS_ANNOTATION: &str = "monitoring.rossfairbanks.com/pingdom_checks";

/// A reconciliation event, merged onto the operator's queue by one of the
/// watch tasks.
#[derive(Debug)]
pub enum Event {
    IngressAdded(Ingress),
    IngressUpdated(Ingress),
    IngressDeleted(Ingress),
    CheckSpecSet {
        namespace: String,
        name: String,
        spec: PingdomCheckSpec,
    },
    CheckSpecDeleted {
        namespace: String,
        name: String,
        spec: PingdomCheckSpec,
    },
}

/// Reads and writes ingresses on the API server so check bindings can be
/// persisted back onto the owning resource.
#[async_trait]
pub trait IngressApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress>;
    async fn replace(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;
}

#[async_trait]
impl<T: IngressApi + Send + Sync> IngressApi for Arc<T> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress> {
        (**self).get(namespace, name).await
    }

    async fn replace(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        (**self).replace(namespace, ingress).await
    }
}

/// `IngressApi` against the cluster.
pub struct ClusterIngresses(kube::Client);

impl ClusterIngresses {
    pub fn new(client: kube::Client) -> Self {
        Self(client)
    }
}

#[async_trait]
impl IngressApi for ClusterIngresses {
    async fn get(&self, namespace: &str, name: &str) -> Result<Ingress> {
        let api = Api::<Ingress>::namespaced(self.0.clone(), namespace);
        api.get(name)
            .await
            .with_context(|| format!("getting ingress {}/{}", namespace, name))
    }

    async fn replace(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        let name = ingress.name();
        let api = Api::<Ingress>::namespaced(self.0.clone(), namespace);
        api.replace(&name, &PostParams::default(), ingress)
            .await
            .with_context(|| format!("updating ingress {}/{}", namespace, name))
    }
}

/// Turns watch notifications into calls against the external check service.
pub struct Operator<C, I> {
    checks_api: C,
    ingresses: I,
    store: Arc<Store>,
    checks: CheckIds,

    /// Sequence number attached to every handled event for log correlation.
    events_handled: u64,
}

impl<C, I> Operator<C, I>
where
    C: CheckApi,
    I: IngressApi,
{
    pub fn new(checks_api: C, ingresses: I, store: Arc<Store>) -> Self {
        Self {
            checks_api,
            ingresses,
            store,
            checks: CheckIds::default(),
            events_handled: 0,
        }
    }

    /// Consumes events until the channel closes or `stop` signals shutdown.
    /// An event being handled when the signal arrives is finished first.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!("reconciler stopped");
                    return;
                }
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => return,
                },
            }
        }
    }

    async fn handle(&mut self, event: Event) {
        self.events_handled += 1;
        let seq = self.events_handled;
        match event {
            Event::IngressAdded(ingress) => {
                let span = info_span!("add_ingress", seq, ingress = %ingress.name());
                self.handle_add_ingress(ingress).instrument(span).await
            }
            Event::IngressUpdated(ingress) => {
                let _span = info_span!("update_ingress", seq, ingress = %ingress.name()).entered();
                self.handle_update_ingress(&ingress)
            }
            Event::IngressDeleted(ingress) => {
                let span = info_span!("delete_ingress", seq, ingress = %ingress.name());
                self.handle_delete_ingress(ingress).instrument(span).await
            }
            Event::CheckSpecSet {
                namespace,
                name,
                spec,
            } => {
                let span = info_span!("set_check_spec", seq, %namespace, %name);
                self.handle_set_check_spec(&name, &spec).instrument(span).await
            }
            Event::CheckSpecDeleted {
                namespace, name, ..
            } => {
                let span = info_span!("delete_check_spec", seq, %namespace, %name);
                self.handle_delete_check_spec(&name).instrument(span).await
            }
        }
    }

    /// Creates checks for the ingress's hosts if it opted in and has none
    /// bound yet.
    async fn handle_add_ingress(&mut self, ingress: Ingress) {
        let check_name = match check_annotation(&ingress) {
            Some(name) => name.to_string(),
            None => return,
        };
        if has_checks(&ingress) {
            debug!("checks already bound");
            return;
        }
        let hosts = ingress_hosts(&ingress);
        if hosts.is_empty() {
            return;
        }

        let namespace = ingress.namespace().unwrap_or_default();
        let spec = self.store.get(&namespace, &check_name).unwrap_or_default();

        if let Err(error) = self
            .create_checks(&ingress, &hosts, &check_name, &spec)
            .await
        {
            warn!(?error, "failed to bind checks");
        }
    }

    /// Deletes every check bound to the ingress.
    async fn handle_delete_ingress(&mut self, ingress: Ingress) {
        let check_name = match check_annotation(&ingress) {
            Some(name) => name.to_string(),
            None => return,
        };

        if let Err(error) = self.delete_checks(&ingress, &check_name).await {
            warn!(?error, "failed to delete checks");
        }
    }

    // TODO: remove checks when the marker annotation is dropped and rebind
    // when the host set changes.
    fn handle_update_ingress(&mut self, ingress: &Ingress) {
        if check_annotation(ingress).is_none() {
            return;
        }
        debug!("ingress update not yet handled");
    }

    /// Pushes a changed spec out to every check created under the name.
    async fn handle_set_check_spec(&mut self, name: &str, spec: &PingdomCheckSpec) {
        for id in self.checks.get(name).to_vec() {
            match self.checks_api.update(id, spec).await {
                Ok(()) => debug!(id, "updated check"),
                Err(error) => warn!(id, ?error, "failed to update check"),
            }
        }
    }

    /// Resets every check created under the name to the default spec. The
    /// checks themselves live and die with their ingress, not with the
    /// spec resource.
    async fn handle_delete_check_spec(&mut self, name: &str) {
        let default = PingdomCheckSpec::default();
        for id in self.checks.get(name).to_vec() {
            match self.checks_api.update(id, &default).await {
                Ok(()) => debug!(id, "reset check to defaults"),
                Err(error) => warn!(id, ?error, "failed to reset check"),
            }
        }
    }

    /// Creates a check per host and records the outcome on the ingress.
    ///
    /// Hosts whose create fails are skipped; whatever succeeded is written
    /// to the bindings annotation on a freshly fetched copy of the ingress
    /// so concurrent metadata changes are not clobbered.
    async fn create_checks(
        &mut self,
        ingress: &Ingress,
        hosts: &[String],
        check_name: &str,
        spec: &PingdomCheckSpec,
    ) -> Result<()> {
        let mut bound = BTreeMap::new();
        for host in hosts {
            match self.checks_api.create(host, spec).await {
                Ok(id) => {
                    self.checks.add(check_name, id);
                    bound.insert(host.clone(), id);
                    debug!(%host, id, "created check");
                }
                Err(error) => warn!(%host, ?error, "failed to create check"),
            }
        }

        let data = serde_json::to_string(&bound).context("encoding check bindings")?;

        let namespace = ingress.namespace().unwrap_or_default();
        let mut fresh = self.ingresses.get(&namespace, &ingress.name()).await?;
        fresh
            .annotations_mut()
            .insert(CHECKS_ANNOTATION.to_string(), data);
        self.ingresses.replace(&namespace, &fresh).await?;
        Ok(())
    }

    /// Deletes the checks recorded in the bindings annotation. Ids whose
    /// delete fails stay bound remotely and are only reported.
    async fn delete_checks(&mut self, ingress: &Ingress, check_name: &str) -> Result<()> {
        let data = match ingress.annotations().get(CHECKS_ANNOTATION) {
            Some(data) => data,
            None => return Ok(()),
        };
        let bound: BTreeMap<String, CheckId> =
            serde_json::from_str(data).context("decoding check bindings")?;

        for (host, id) in bound {
            match self.checks_api.delete(id).await {
                Ok(()) => {
                    self.checks.delete(check_name, id);
                    debug!(%host, id, "deleted check");
                }
                Err(error) => warn!(%host, id, ?error, "failed to delete check"),
            }
        }
        Ok(())
    }
}

/// Value of the marker annotation, if the ingress carries one.
fn check_annotation(ingress: &Ingress) -> Option<&str> {
    ingress.annotations().get(CHECK_ANNOTATION).map(String::as_str)
}

/// Whether checks were already bound to this ingress.
fn has_checks(ingress: &Ingress) -> bool {
    ingress
        .annotations()
        .get(CHECKS_ANNOTATION)
        .map(|data| !data.is_empty())
        .unwrap_or(false)
}

/// Host names advertised by the ingress rules, in declaration order.
/// Duplicates are preserved; rules without a host are skipped.
fn ingress_hosts(ingress: &Ingress) -> Vec<String> {
    ingress
        .spec
        .as_ref()
        .map(|spec| {
            spec.rules
                .iter()
                .filter_map(|rule| rule.host.clone())
                .filter(|host| !host.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
