use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiext;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ObjectList, PostParams};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

/// Attempts made against the list endpoint before a freshly registered kind
/// is declared broken.
const READY_ATTEMPTS: u32 = 30;

/// Pause between readiness attempts.
const READY_DELAY: Duration = Duration::from_secs(3);

/// Identifies a watchable resource kind on the API server.
///
/// `namespace` scopes the list and watch endpoints to one namespace; `None`
/// covers the whole cluster.
#[derive(Clone, Debug)]
pub struct KindDesc {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub description: String,
    pub namespace: Option<String>,
}

impl KindDesc {
    /// Registered name of the kind, `{plural}.{group}`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }

    pub fn list_path(&self) -> String {
        format!(
            "/apis/{}/{}{}/{}",
            self.group,
            self.version,
            self.ns_segment(),
            self.plural
        )
    }

    pub fn watch_path(&self) -> String {
        format!(
            "/apis/{}/{}{}/watch/{}",
            self.group,
            self.version,
            self.ns_segment(),
            self.plural
        )
    }

    fn ns_segment(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) => format!("/namespaces/{}", ns),
            None => String::new(),
        }
    }

    /// Builds the definition object sent to the API server to register the
    /// kind. The kind is always namespace-scoped, matching how the operator
    /// addresses its instances.
    fn to_definition(&self) -> apiext::CustomResourceDefinition {
        apiext::CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(self.name()),
                ..Default::default()
            },
            spec: apiext::CustomResourceDefinitionSpec {
                group: self.group.clone(),
                names: apiext::CustomResourceDefinitionNames {
                    kind: self.kind.clone(),
                    plural: self.plural.clone(),
                    singular: Some(self.kind.to_ascii_lowercase()),
                    ..Default::default()
                },
                scope: "Namespaced".to_string(),
                versions: vec![apiext::CustomResourceDefinitionVersion {
                    name: self.version.clone(),
                    served: true,
                    storage: true,
                    schema: Some(apiext::CustomResourceValidation {
                        open_api_v3_schema: Some(apiext::JSONSchemaProps {
                            description: Some(self.description.clone()),
                            type_: Some("object".to_string()),
                            x_kubernetes_preserve_unknown_fields: Some(true),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        }
    }
}

/// A single record decoded from a watch stream.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

/// List/watch client for one resource kind.
///
/// Streams are not resumed internally; when [`ResourceClient::watch`]
/// returns, the caller decides whether to re-list and watch again.
pub struct ResourceClient<T> {
    client: kube::Client,
    desc: KindDesc,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ResourceClient<T>
where
    T: Clone + DeserializeOwned,
{
    pub fn new(client: kube::Client, desc: KindDesc) -> Self {
        Self {
            client,
            desc,
            _marker: PhantomData,
        }
    }

    /// Registers the kind with the API server. A kind that is already
    /// registered is success.
    pub async fn register(&self) -> Result<()> {
        let api = Api::<apiext::CustomResourceDefinition>::all(self.client.clone());
        match api
            .create(&PostParams::default(), &self.desc.to_definition())
            .await
        {
            Ok(_) => {
                info!(name = %self.desc.name(), "registered resource kind");
                Ok(())
            }
            Err(err) if already_exists(&err) => {
                debug!(name = %self.desc.name(), "resource kind already registered");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("registering {}", self.desc.name())),
        }
    }

    /// Polls the list endpoint until a freshly registered kind is served.
    ///
    /// Only "not found" is retried; any other failure, or an exhausted
    /// attempt budget, is fatal and the process is expected to be
    /// restarted.
    pub async fn wait_ready(&self) -> Result<()> {
        poll_ready(&self.desc, || async move { self.try_list().await.map(|_| ()) }).await
    }

    pub async fn list(&self) -> Result<ObjectList<T>> {
        self.try_list()
            .await
            .with_context(|| format!("listing {}", self.desc.plural))
    }

    /// Lists the kind, delivering every item as a synthetic added event,
    /// then decodes the watch stream into `handle` until the connection
    /// closes (`Ok`) or fails (`Err`).
    pub async fn watch<F>(&self, mut handle: F) -> Result<()>
    where
        F: FnMut(WatchEvent<T>),
    {
        let list = self.list().await?;
        debug!(kind = %self.desc.kind, items = list.items.len(), "listed");
        for item in list.items {
            handle(WatchEvent::Added(item));
        }

        let req = http::Request::get(self.desc.watch_path())
            .body(Vec::new())
            .context("building watch request")?;
        let body = self
            .client
            .request_text_stream(req)
            .await
            .with_context(|| format!("watching {}", self.desc.plural))?;
        decode_watch(body, handle).await
    }

    async fn try_list(&self) -> Result<ObjectList<T>, kube::Error> {
        let req = http::Request::get(self.desc.list_path())
            .body(Vec::new())
            .map_err(kube::Error::HttpError)?;
        self.client.request(req).await
    }
}

/// Decodes newline-delimited `{"type": ..., "object": ...}` records from a
/// watch response body, dispatching each to `handle`.
///
/// A malformed record is a terminal error, as are bytes left over from a
/// connection cut mid-record.
async fn decode_watch<T, S, E, F>(body: S, mut handle: F) -> Result<()>
where
    T: DeserializeOwned,
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(WatchEvent<T>),
{
    futures::pin_mut!(body);
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.try_next().await? {
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let record = line[..pos].strip_suffix(b"\r").unwrap_or(&line[..pos]);
            if record.is_empty() {
                continue;
            }
            let event = serde_json::from_slice(record).context("decoding watch record")?;
            handle(event);
        }
    }
    if buf.iter().any(|b| !b.is_ascii_whitespace()) {
        bail!("watch stream ended mid-record");
    }
    Ok(())
}

async fn poll_ready<A, Fut>(desc: &KindDesc, mut attempt: A) -> Result<()>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = Result<(), kube::Error>>,
{
    for tried in 1..=READY_ATTEMPTS {
        match attempt().await {
            Ok(()) => {
                debug!(name = %desc.name(), "list endpoint ready");
                return Ok(());
            }
            Err(err) if not_found(&err) => {
                debug!(name = %desc.name(), attempt = tried, "list endpoint not ready");
                time::sleep(READY_DELAY).await;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", desc.plural));
            }
        }
    }
    bail!(
        "{} did not become ready after {} attempts",
        desc.name(),
        READY_ATTEMPTS
    )
}

fn already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(rsp) if rsp.code == 409)
}

fn not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(rsp) if rsp.code == 404)
}
