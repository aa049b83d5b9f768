//! Kubernetes plumbing: typed re-exports, kind descriptors, and the
//! list/watch client.

pub mod check;
pub mod watch;

pub use self::watch::{KindDesc, ResourceClient, WatchEvent};
pub use k8s_openapi::api::networking::v1::Ingress;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::api::ResourceExt;

/// Descriptor for the built-in ingress kind, optionally scoped to one
/// namespace.
pub fn ingress_kind(namespace: Option<String>) -> KindDesc {
    KindDesc {
        group: "networking.k8s.io".to_string(),
        version: "v1".to_string(),
        kind: "Ingress".to_string(),
        plural: "ingresses".to_string(),
        description: String::new(),
        namespace,
    }
}
