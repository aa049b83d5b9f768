//! Client for the external uptime-check service.

use crate::k8s::check::PingdomCheckSpec;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::env;
use std::sync::Arc;

/// Identifier the external service assigns to a created check.
pub type CheckId = i64;

/// The create/update/delete surface the reconciler drives.
///
/// Failures are surfaced as errors and not retried here; retry policy, if
/// any, belongs to the caller.
#[async_trait]
pub trait CheckApi {
    /// Creates an HTTP check for the host and returns its id.
    async fn create(&self, host: &str, spec: &PingdomCheckSpec) -> Result<CheckId>;

    /// Applies `spec` to an existing check, leaving its other settings as
    /// they are on the remote side.
    async fn update(&self, id: CheckId, spec: &PingdomCheckSpec) -> Result<()>;

    /// Deletes the check.
    async fn delete(&self, id: CheckId) -> Result<()>;
}

#[async_trait]
impl<T: CheckApi + Send + Sync> CheckApi for Arc<T> {
    async fn create(&self, host: &str, spec: &PingdomCheckSpec) -> Result<CheckId> {
        (**self).create(host, spec).await
    }

    async fn update(&self, id: CheckId, spec: &PingdomCheckSpec) -> Result<()> {
        (**self).update(id, spec).await
    }

    async fn delete(&self, id: CheckId) -> Result<()> {
        (**self).delete(id).await
    }
}

/// REST client authenticated with account credentials and an application
/// key.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    api_key: String,
}

impl Client {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            user: user.into(),
            password: password.into(),
            api_key: api_key.into(),
        }
    }

    /// Builds a client from the `PINGDOM_USER`, `PINGDOM_PASSWORD` and
    /// `PINGDOM_API_KEY` environment variables.
    pub fn from_env(base_url: impl Into<String>) -> Result<Self> {
        let user = env::var("PINGDOM_USER").context("PINGDOM_USER must be set")?;
        let password = env::var("PINGDOM_PASSWORD").context("PINGDOM_PASSWORD must be set")?;
        let api_key = env::var("PINGDOM_API_KEY").context("PINGDOM_API_KEY must be set")?;
        Ok(Self::new(base_url, user, password, api_key))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let rsp = req
            .basic_auth(&self.user, Some(&self.password))
            .header("App-Key", &self.api_key)
            .send()
            .await?;
        if rsp.status().is_success() {
            return Ok(rsp);
        }
        let status = rsp.status();
        match rsp.json::<ErrorResponse>().await {
            Ok(body) => bail!(
                "{} ({}): {}",
                body.error.statusdesc,
                body.error.statuscode,
                body.error.errormessage
            ),
            Err(_) => bail!("check service returned {}", status),
        }
    }

    async fn read(&self, id: CheckId) -> Result<HttpCheck> {
        let rsp = self
            .send(self.http.get(format!("{}/checks/{}", self.base_url, id)))
            .await?;
        let body: CheckResponse = rsp.json().await.context("decoding check")?;
        Ok(body.check)
    }
}

#[async_trait]
impl CheckApi for Client {
    async fn create(&self, host: &str, spec: &PingdomCheckSpec) -> Result<CheckId> {
        let params = [
            ("name", host.to_string()),
            ("host", host.to_string()),
            ("type", "http".to_string()),
            ("resolution", spec.retry_interval_minutes.to_string()),
        ];
        let rsp = self
            .send(self.http.post(format!("{}/checks", self.base_url)).form(&params))
            .await
            .with_context(|| format!("creating check for {}", host))?;
        let body: CreatedResponse = rsp.json().await.context("decoding created check")?;
        Ok(body.check.id)
    }

    async fn update(&self, id: CheckId, spec: &PingdomCheckSpec) -> Result<()> {
        // Read the remote state first so settings other than the interval
        // round-trip unchanged.
        let current = self
            .read(id)
            .await
            .with_context(|| format!("reading check {}", id))?;
        self.send(
            self.http
                .put(format!("{}/checks/{}", self.base_url, id))
                .form(&update_params(current, spec)),
        )
        .await
        .with_context(|| format!("updating check {}", id))?;
        Ok(())
    }

    async fn delete(&self, id: CheckId) -> Result<()> {
        self.send(self.http.delete(format!("{}/checks/{}", self.base_url, id)))
            .await
            .with_context(|| format!("deleting check {}", id))?;
        Ok(())
    }
}

/// Form parameters for an update: the new interval plus the remote fields
/// the operator does not own, carried over as read.
fn update_params(current: HttpCheck, spec: &PingdomCheckSpec) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("name", current.name),
        ("host", current.hostname),
        ("resolution", spec.retry_interval_minutes.to_string()),
    ];
    if let Some(notify) = current.sendnotificationwhendown {
        params.push(("sendnotificationwhendown", notify.to_string()));
    }
    params
}

/// Fields of a remote check the operator reads or round-trips.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpCheck {
    pub id: CheckId,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub resolution: Option<u32>,
    #[serde(default)]
    pub sendnotificationwhendown: Option<i64>,
}

#[derive(Deserialize)]
struct CheckResponse {
    check: HttpCheck,
}

#[derive(Deserialize)]
struct CreatedCheck {
    id: CheckId,
}

#[derive(Deserialize)]
struct CreatedResponse {
    check: CreatedCheck,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    statuscode: u16,
    statusdesc: String,
    errormessage: String,
}
