//! Consul KV client over the agent's HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kvconf_core::{BackendError, BackendResult, Kv, KvClient, KvConnector, Location};
use reqwest::{Client, ClientBuilder, RequestBuilder, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::model::{decode_pairs, to_consul_key};
use crate::settings::ConsulSettings;

/// Header carrying the KV index used by blocking queries.
const INDEX_HEADER: &str = "X-Consul-Index";

/// How long one blocking query may wait for a change.
const DEFAULT_WAIT: Duration = Duration::from_secs(5 * 60);

/// Consecutive failed blocking queries tolerated before a watch ends.
const WATCH_RETRIES: u32 = 3;

fn transport(err: reqwest::Error) -> BackendError {
    BackendError::Transport(err.to_string())
}

/// Opens [`ConsulClient`]s.
#[derive(Debug, Clone)]
pub struct ConsulConnector {
    wait: Duration,
}

impl Default for ConsulConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsulConnector {
    /// Creates a connector using five minute blocking queries.
    pub fn new() -> Self {
        Self { wait: DEFAULT_WAIT }
    }

    /// Sets the wait time of blocking queries used by watches.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

#[async_trait]
impl KvConnector for ConsulConnector {
    type Client = ConsulClient;

    async fn connect(&self, location: &Location, timeout: Duration) -> BackendResult<ConsulClient> {
        let settings = ConsulSettings::from_location(location)?;
        let mut builder = ClientBuilder::new();
        if !timeout.is_zero() {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(path) = &settings.ca_cert {
            let pem = tokio::fs::read(path).await?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| BackendError::connect(location.as_str(), e))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| BackendError::connect(location.as_str(), e))?;

        info!(address = %settings.address, scheme = %settings.scheme, "consul client created");
        Ok(ConsulClient {
            http,
            settings,
            wait: self.wait,
        })
    }
}

/// A connection to one Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: Client,
    settings: ConsulSettings,
    wait: Duration,
}

impl ConsulClient {
    /// Settings in use.
    pub fn settings(&self) -> &ConsulSettings {
        &self.settings
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.settings.username {
            Some(user) => req.basic_auth(user, self.settings.password.as_deref()),
            None => req,
        }
    }

    /// URL reading `key`, recursively for directory keys.
    fn read_url(&self, key: &str) -> BackendResult<Url> {
        let mut url = self.settings.kv_url(to_consul_key(key))?;
        if key.ends_with('/') {
            url.query_pairs_mut().append_pair("recurse", "true");
        }
        Ok(url)
    }

    /// Issues one read, returning the entries and the KV index.
    async fn read(&self, url: Url, timeout: Option<Duration>) -> BackendResult<(Vec<Kv>, u64)> {
        let mut req = self.authorize(self.http.get(url));
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let resp = req.send().await.map_err(transport)?;
        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        match resp.status() {
            StatusCode::NOT_FOUND => Ok((Vec::new(), index)),
            status if status.is_success() => {
                let body = resp.bytes().await.map_err(transport)?;
                Ok((decode_pairs(&body)?, index))
            }
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(BackendError::Transport(format!(
                    "consul returned HTTP {}: {}",
                    status.as_u16(),
                    text
                )))
            }
        }
    }
}

/// State of a blocking-query watch.
struct WatchState {
    client: ConsulClient,
    key: String,
    index: u64,
}

impl WatchState {
    /// Waits until the index of the watched key moves.
    async fn next_change(&mut self) -> BackendResult<()> {
        let mut failures = 0;
        loop {
            let mut url = self.client.read_url(&self.key)?;
            url.query_pairs_mut()
                .append_pair("index", &self.index.to_string())
                .append_pair("wait", &format!("{}s", self.client.wait.as_secs()));
            // Consul adds up to wait/16 of jitter.
            let timeout = self.client.wait + self.client.wait / 16 + Duration::from_secs(10);

            match self.client.read(url, Some(timeout)).await {
                Ok((_, index)) => {
                    failures = 0;
                    if index < self.index {
                        // The index went backwards; start over.
                        self.index = 0;
                        continue;
                    }
                    if index != self.index {
                        self.index = index;
                        return Ok(());
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures >= WATCH_RETRIES {
                        return Err(err);
                    }
                    warn!(key = %self.key, error = %err, attempt = failures, "blocking query failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[async_trait]
impl KvClient for ConsulClient {
    async fn get(&self, key: &str) -> BackendResult<Vec<Kv>> {
        let (kvs, _) = self.read(self.read_url(key)?, None).await?;
        debug!(key = %key, entries = kvs.len(), "read from consul");
        Ok(kvs)
    }

    async fn put(&self, kv: &Kv) -> BackendResult<()> {
        let url = self.settings.kv_url(to_consul_key(&kv.key))?;
        let resp = self
            .authorize(self.http.put(url))
            .body(kv.value.clone())
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Transport(format!(
                "consul rejected write of '{}': HTTP {} {}",
                kv.key,
                status.as_u16(),
                text
            )));
        }
        Ok(())
    }

    async fn watch(&self, key: &str) -> BackendResult<BoxStream<'static, BackendResult<()>>> {
        // The current index is the starting point: only later changes count.
        let (_, index) = self.read(self.read_url(key)?, None).await?;
        let state = WatchState {
            client: self.clone(),
            key: key.to_string(),
            index,
        };
        let stream = futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.next_change().await {
                Ok(()) => Some((Ok(()), Some(state))),
                Err(err) => Some((Err(err), None)),
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client(raw: &str) -> ConsulClient {
        ConsulConnector::new()
            .connect(&Location::parse(raw).unwrap(), Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_url() {
        let client = client("consul://127.0.0.1:8500/app/config").await;
        assert_eq!(
            client.read_url("/app/config").unwrap().as_str(),
            "http://127.0.0.1:8500/v1/kv/app/config"
        );
        assert_eq!(
            client.read_url("/app/config/data_source/").unwrap().as_str(),
            "http://127.0.0.1:8500/v1/kv/app/config/data_source/?recurse=true"
        );
    }

    #[tokio::test]
    async fn test_missing_ca_file_fails() {
        let location =
            Location::parse("consul://127.0.0.1:8500/app?cert=/definitely/not/here.pem").unwrap();
        let err = ConsulConnector::new()
            .connect(&location, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Io(_)));
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        // Port 9 (discard) is closed on test machines.
        let client = client("consul://127.0.0.1:9/app").await;
        let err = client.get("/app").await.unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }
}
