use super::watch::KindDesc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "monitoring.rossfairbanks.com";
pub const VERSION: &str = "v1alpha1";

/// Check configuration applied to the ingresses whose marker annotation
/// names this resource.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "monitoring.rossfairbanks.com",
    version = "v1alpha1",
    kind = "PingdomCheck",
    plural = "pingdomchecks",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PingdomCheckSpec {
    /// How often the external service probes a host, in minutes.
    pub retry_interval_minutes: u32,
}

impl Default for PingdomCheckSpec {
    // Used when an ingress references a check name that does not (or no
    // longer does) resolve to a resource.
    fn default() -> Self {
        Self {
            retry_interval_minutes: 1,
        }
    }
}

/// Descriptor for the `PingdomCheck` kind, optionally scoped to one
/// namespace.
pub fn kind_desc(namespace: Option<String>) -> KindDesc {
    KindDesc {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        kind: "PingdomCheck".to_string(),
        plural: "pingdomchecks".to_string(),
        description: "Uptime check configuration for annotated ingresses".to_string(),
        namespace,
    }
}
