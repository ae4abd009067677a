use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RegistryError;
use crate::registry::server::{
    AcquireRequest, DeleteRequest, IndexResponse, KeyQuery, PrefixQuery, ReleaseRequest,
    RenewRequest, SetRequest, SetResponse, WaitQuery, WireError,
};
use crate::registry::{KeyValue, Lease, Precondition, Registry, WatchEvent};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Slack added on top of a long-poll window before the HTTP request gives up.
const WAIT_GRACE: Duration = Duration::from_secs(5);

/// [`Registry`] backed by a registry server reached over HTTP.
///
/// Transport failures surface as [`RegistryError::Unavailable`] so callers
/// treat them as transient; errors reported by the server keep their kind.
#[derive(Clone)]
pub struct RemoteRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteRegistry {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<Q, T>(
        &self,
        path: &str,
        query: &Q,
        timeout: Duration,
    ) -> Result<T, RegistryError>
    where
        Q: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RegistryError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }

    async fn post_empty<B>(&self, path: &str, body: &B) -> Result<(), RegistryError>
    where
        B: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        check(response).await.map(|_| ())
    }
}

fn transport(e: reqwest::Error) -> RegistryError {
    tracing::debug!(error = %e, "Registry request failed");
    RegistryError::Unavailable(e.to_string())
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<WireError>(&body) {
        Ok(wire) => Err(wire.into()),
        Err(_) => Err(RegistryError::Unavailable(format!(
            "registry returned {status}: {body}"
        ))),
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RegistryError> {
    let response = check(response).await?;
    let bytes = response.bytes().await.map_err(transport)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl Registry for RemoteRegistry {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError> {
        let query = KeyQuery {
            key: key.to_string(),
        };
        self.get_json("/registry/key", &query, REQUEST_TIMEOUT).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let query = PrefixQuery {
            prefix: prefix.to_string(),
        };
        self.get_json("/registry/list", &query, REQUEST_TIMEOUT).await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
    ) -> Result<u64, RegistryError> {
        let req = SetRequest {
            key: key.to_string(),
            value: value.to_string(),
            precondition,
        };
        let resp: SetResponse = self.post_json("/registry/set", &req).await?;
        Ok(resp.version)
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), RegistryError> {
        let req = DeleteRequest {
            key: key.to_string(),
            precondition,
        };
        self.post_empty("/registry/delete", &req).await
    }

    async fn wait(
        &self,
        prefix: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, RegistryError> {
        let query = WaitQuery {
            prefix: prefix.to_string(),
            after,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.get_json("/registry/wait", &query, timeout + WAIT_GRACE)
            .await
    }

    async fn current_index(&self) -> Result<u64, RegistryError> {
        let response = self
            .client
            .get(self.url("/registry/index"))
            .send()
            .await
            .map_err(transport)?;
        let resp: IndexResponse = decode(response).await?;
        Ok(resp.index)
    }

    async fn acquire_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, RegistryError> {
        let req = AcquireRequest {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: ttl.as_millis() as u64,
        };
        self.post_json("/registry/lease/acquire", &req).await
    }

    async fn renew_lease(
        &self,
        lease: &Lease,
        ttl: Duration,
    ) -> Result<Option<Lease>, RegistryError> {
        let req = RenewRequest {
            lease: lease.clone(),
            ttl_ms: ttl.as_millis() as u64,
        };
        self.post_json("/registry/lease/renew", &req).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), RegistryError> {
        let req = ReleaseRequest {
            lease: lease.clone(),
        };
        self.post_empty("/registry/lease/release", &req).await
    }
}
