use crate::k8s::check::{PingdomCheck, PingdomCheckSpec};
use crate::k8s::ResourceExt;
use crate::operator::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// In-memory index of the check specs declared by `PingdomCheck`
/// resources, keyed by `(namespace, name)`.
///
/// The watch task writes while the reconciler reads, so the map sits behind
/// a mutex held only for the duration of the access. Every mutation is
/// forwarded onto the reconciler's event channel from inside the same
/// critical section, so the channel observes mutations in order and never
/// sees one twice.
pub struct Store {
    data: Mutex<HashMap<(String, String), PingdomCheckSpec>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Store {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Looks up the spec declared by the named resource.
    pub fn get(&self, namespace: &str, name: &str) -> Option<PingdomCheckSpec> {
        self.data
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Inserts or replaces the spec declared by `check`.
    pub fn apply(&self, check: PingdomCheck) {
        let namespace = check.namespace().unwrap_or_default();
        let name = check.name();
        let mut data = self.data.lock();
        data.insert((namespace.clone(), name.clone()), check.spec.clone());
        let _ = self.events.send(Event::CheckSpecSet {
            namespace,
            name,
            spec: check.spec,
        });
    }

    /// Removes the spec declared by `check`.
    pub fn delete(&self, check: PingdomCheck) {
        let namespace = check.namespace().unwrap_or_default();
        let name = check.name();
        let mut data = self.data.lock();
        data.remove(&(namespace.clone(), name.clone()));
        let _ = self.events.send(Event::CheckSpecDeleted {
            namespace,
            name,
            spec: check.spec,
        });
    }
}
