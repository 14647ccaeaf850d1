//! Generic backend for flat key/value stores.
//!
//! [`KvBackend`] turns any [`KvConnector`] into a [`Backend`]: it reads every
//! key the configuration's layout spreads over, bootstraps an empty store with
//! the default configuration, decodes stored entries and keeps one watch per
//! key running when asked to.
//!
//! ```rust,ignore
//! let store = ConfigStore::new();
//! store.add_backend("consul", KvBackend::new(ConsulConnector::new()));
//! store.init(Options::new().url("consul://127.0.0.1:8500/app/config")?.default_config(cfg)).await?;
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kvconf_core::{
    Backend, BackendError, BackendResult, Configuration, Kv, KvClient, KvConnector, LoadOptions,
    decode, marshal, prefix_keys,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Runs `fut`, bounded by `timeout` unless it is zero.
pub(crate) async fn with_timeout<F, R>(key: &str, timeout: Duration, fut: F) -> BackendResult<R>
where
    F: Future<Output = BackendResult<R>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| BackendError::Timeout {
            key: key.to_string(),
        })?
}

/// Reads every key in `keys` into one list of entries.
async fn read_keys<C: KvClient>(
    client: &C,
    keys: &[String],
    timeout: Duration,
) -> BackendResult<Vec<Kv>> {
    let mut kvs = Vec::new();
    for key in keys {
        kvs.extend(with_timeout(key, timeout, client.get(key)).await?);
    }
    Ok(kvs)
}

/// A [`Backend`] over a flat key/value store.
///
/// The client is opened on first use and owned by the backend. It is closed
/// after each load when watching is off, and rebuilt once when a read fails.
pub struct KvBackend<C: KvConnector> {
    connector: C,
    client: tokio::sync::Mutex<Option<Arc<C::Client>>>,
    watched: Mutex<HashSet<String>>,
}

impl<C: KvConnector> KvBackend<C> {
    /// Creates a backend connecting through `connector`.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            client: tokio::sync::Mutex::new(None),
            watched: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    async fn client<T>(&self, options: &LoadOptions<T>) -> BackendResult<Arc<C::Client>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(self.connect(options).await?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn reconnect<T>(&self, options: &LoadOptions<T>) -> BackendResult<Arc<C::Client>> {
        let mut slot = self.client.lock().await;
        // Watch tasks may still share the old client; it then closes when
        // the last of them drops it.
        if let Some(old) = slot.take().and_then(Arc::into_inner) {
            old.close().await;
        }
        let client = Arc::new(self.connect(options).await?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn connect<T>(&self, options: &LoadOptions<T>) -> BackendResult<C::Client> {
        let url = options.location.as_str();
        debug!(url = %url, "connecting to key/value store");
        with_timeout(url, options.timeout, self.connector.connect(&options.location, options.timeout))
            .await
    }

    async fn close_client(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }
    }

    async fn read_all<T>(&self, keys: &[String], options: &LoadOptions<T>) -> BackendResult<Vec<Kv>> {
        let client = self.client(options).await?;
        match read_keys(client.as_ref(), keys, options.timeout).await {
            Ok(kvs) => Ok(kvs),
            Err(err) => {
                warn!(
                    url = %options.location,
                    error = %err,
                    "failed to read configuration, rebuilding client and retrying once"
                );
                let client = self.reconnect(options).await?;
                read_keys(client.as_ref(), keys, options.timeout).await
            }
        }
    }

    async fn bootstrap<T: Configuration>(&self, root: &str, options: &LoadOptions<T>) -> BackendResult<()> {
        let entries = marshal(root, &options.default_config)?;
        let client = self.client(options).await?;
        let mut first_error = None;
        for kv in &entries {
            if let Err(err) = with_timeout(&kv.key, options.timeout, client.put(kv)).await {
                error!(key = %kv.key, error = %err, "failed to write default configuration");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(key = %root, entries = entries.len(), "wrote default configuration");
                Ok(())
            }
        }
    }

    /// Starts one watch task per key, once per location.
    async fn start_watches<T: Configuration>(
        &self,
        root: &str,
        keys: &[String],
        options: &LoadOptions<T>,
    ) -> BackendResult<()> {
        let location = options.location.as_str().to_string();
        if !self.watched.lock().insert(location.clone()) {
            return Ok(());
        }

        let client = self.client(options).await?;
        // Cancelling this token stops the tasks of this location only.
        let watches = options.shutdown.child_token();
        for key in keys {
            let stream = match with_timeout(key, options.timeout, client.watch(key)).await {
                Ok(stream) => stream,
                Err(err) => {
                    self.watched.lock().remove(&location);
                    watches.cancel();
                    return Err(err);
                }
            };
            debug!(key = %key, "watching key");

            let client = Arc::clone(&client);
            let keys = keys.to_vec();
            let root = root.to_string();
            let key = key.clone();
            let template = options.default_config.clone();
            let on_loaded = Arc::clone(&options.on_loaded);
            let timeout = options.timeout;
            let shutdown = watches.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                loop {
                    let item = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(())) => {}
                        Some(Err(err)) => {
                            error!(key = %key, error = %err, "watch failed");
                            break;
                        }
                        None => break,
                    }

                    let kvs = match read_keys(client.as_ref(), &keys, timeout).await {
                        Ok(kvs) if kvs.is_empty() => {
                            warn!(key = %root, "configuration removed from store, keeping current");
                            continue;
                        }
                        Ok(kvs) => kvs,
                        Err(err) => {
                            error!(key = %root, error = %err, "failed to read changed configuration");
                            continue;
                        }
                    };
                    match decode(&root, &kvs, &template) {
                        Ok(config) => {
                            debug!(key = %key, "configuration changed in store");
                            on_loaded(config);
                        }
                        Err(err) => {
                            error!(key = %root, error = %err, "failed to decode changed configuration");
                        }
                    }
                }
                debug!(key = %key, "watch stopped");
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<C, T> Backend<T> for KvBackend<C>
where
    C: KvConnector,
    T: Configuration,
{
    async fn load_config(&self, options: &LoadOptions<T>) -> BackendResult<()> {
        let root = options.location.path().to_string();
        let keys = prefix_keys(&root, &options.default_config);
        let kvs = self.read_all(&keys, options).await?;

        let config = if kvs.is_empty() {
            self.bootstrap(&root, options).await?;
            options.default_config.clone()
        } else {
            decode(&root, &kvs, &options.default_config)?
        };

        if options.watch {
            self.start_watches(&root, &keys, options).await?;
        } else {
            self.close_client().await;
        }

        (options.on_loaded)(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream::BoxStream;
    use kvconf_core::{CancellationToken, Location, async_trait};
    use kvconf_macros::KvLayout;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::memory::MemoryKv;
    use crate::{ConfigError, ConfigStore, Options};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, KvLayout)]
    #[serde(rename_all = "PascalCase")]
    struct AppConfig {
        addr: String,
        #[kv(key = "data_source/")]
        data_source: BTreeMap<String, String>,
    }

    fn app(cache: &str) -> AppConfig {
        AppConfig {
            addr: ":9090".into(),
            data_source: BTreeMap::from([("cache".to_string(), cache.to_string())]),
        }
    }

    const URL: &str = "memory://local/app/config";

    /// Wraps a [`MemoryKv`] and counts what the backend does with it.
    #[derive(Default)]
    struct Recorder {
        kv: MemoryKv,
        connects: AtomicUsize,
        failing_gets: AtomicUsize,
        watches: AtomicUsize,
        closes: AtomicUsize,
        hang: bool,
    }

    struct RecordingConnector(Arc<Recorder>);

    struct RecordingClient(Arc<Recorder>);

    #[async_trait]
    impl KvConnector for RecordingConnector {
        type Client = RecordingClient;

        async fn connect(&self, _: &Location, _: Duration) -> BackendResult<RecordingClient> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(RecordingClient(Arc::clone(&self.0)))
        }
    }

    #[async_trait]
    impl KvClient for RecordingClient {
        async fn get(&self, key: &str) -> BackendResult<Vec<Kv>> {
            if self.0.hang {
                futures::future::pending::<()>().await;
            }
            let failing = self.0.failing_gets.load(Ordering::SeqCst);
            if failing > 0 {
                self.0.failing_gets.store(failing - 1, Ordering::SeqCst);
                return Err(BackendError::Transport("connection reset".into()));
            }
            KvClient::get(&self.0.kv, key).await
        }

        async fn put(&self, kv: &Kv) -> BackendResult<()> {
            KvClient::put(&self.0.kv, kv).await
        }

        async fn watch(&self, key: &str) -> BackendResult<BoxStream<'static, BackendResult<()>>> {
            self.0.watches.fetch_add(1, Ordering::SeqCst);
            self.0.kv.watch(key).await
        }

        async fn close(&self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store_with(recorder: &Arc<Recorder>) -> ConfigStore<AppConfig> {
        let store = ConfigStore::new();
        store.add_backend("memory", KvBackend::new(RecordingConnector(Arc::clone(recorder))));
        store
    }

    fn options(url: &str) -> Options<AppConfig> {
        Options::new().url(url).unwrap().default_config(app("redisA"))
    }

    #[tokio::test]
    async fn test_bootstrap_empty_store() {
        let recorder = Arc::new(Recorder::default());
        let store = store_with(&recorder);
        store.init(options(URL).watch(false)).await.unwrap();

        assert_eq!(
            recorder.kv.entries(),
            vec![
                Kv::new("/app/config", r#"{"Addr":":9090"}"#),
                Kv::new("/app/config/data_source/cache", r#""redisA""#),
            ]
        );
        assert_eq!(store.get_config(), Some(app("redisA")));
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_after_bootstrapping_empty_map() {
        let recorder = Arc::new(Recorder::default());
        let empty = AppConfig {
            addr: ":9090".into(),
            data_source: BTreeMap::new(),
        };

        let store = store_with(&recorder);
        store
            .init(options(URL).default_config(empty.clone()).watch(false))
            .await
            .unwrap();
        assert_eq!(recorder.kv.entries(), vec![Kv::new("/app/config", r#"{"Addr":":9090"}"#)]);

        // A second process starts against the bootstrapped store.
        let store = store_with(&recorder);
        store.init(options(URL).watch(false)).await.unwrap();
        assert_eq!(store.get_config(), Some(empty));
    }

    #[tokio::test]
    async fn test_decode_stored_entries() {
        let recorder = Arc::new(Recorder::default());
        recorder.kv.put("/app/config", r#"{"Addr":":8080"}"#);
        recorder.kv.put("/app/config/data_source/cache", r#""redisB""#);
        recorder.kv.put("/app/config/data_source/db", "mysql://db");

        let store = store_with(&recorder);
        store.init(options(URL).watch(false)).await.unwrap();

        let loaded = store.get_config().unwrap();
        assert_eq!(loaded.addr, ":8080");
        assert_eq!(loaded.data_source["cache"], "redisB");
        assert_eq!(loaded.data_source["db"], "mysql://db");
    }

    #[tokio::test]
    async fn test_failed_read_is_retried_once() {
        let recorder = Arc::new(Recorder {
            failing_gets: AtomicUsize::new(1),
            ..Default::default()
        });
        let store = store_with(&recorder);
        store.init(options(URL).watch(false)).await.unwrap();
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 2);
        // The replaced client and the one used for the load.
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_config(), Some(app("redisA")));

        let recorder = Arc::new(Recorder {
            failing_gets: AtomicUsize::new(2),
            ..Default::default()
        });
        let store = store_with(&recorder);
        let err = store.init(options(URL).watch(false)).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Backend(BackendError::Transport(_))
        ));
        assert_eq!(store.get_config(), Some(app("redisA")));
    }

    #[tokio::test]
    async fn test_calls_are_bounded_by_timeout() {
        let recorder = Arc::new(Recorder {
            hang: true,
            ..Default::default()
        });
        let store = store_with(&recorder);
        let options = options(URL)
            .watch(false)
            .timeout(Duration::from_millis(20));
        let err = store.init(options).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Backend(BackendError::Timeout { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_reloads_on_change() {
        let recorder = Arc::new(Recorder::default());
        let store = store_with(&recorder);
        store.init(options(URL)).await.unwrap();
        // Root key and the data_source directory.
        assert_eq!(recorder.watches.load(Ordering::SeqCst), 2);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        store.set_typed_field_listener("DataSource.cache", move |old: String, new: String| {
            let _ = tx.send((old, new));
        });

        recorder.kv.put("/app/config/data_source/cache", r#""redisB""#);
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, ("redisA".to_string(), "redisB".to_string()));
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 0);

        store.close();
    }

    fn load_options(on_loaded: kvconf_core::OnLoaded<AppConfig>) -> LoadOptions<AppConfig> {
        LoadOptions {
            location: Location::parse(URL).unwrap(),
            timeout: Duration::from_secs(1),
            reload_delay: Duration::ZERO,
            watch: true,
            default_config: app("redisA"),
            on_loaded,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retried_read_keeps_watches_alive() {
        let recorder = Arc::new(Recorder::default());
        let backend = KvBackend::new(RecordingConnector(Arc::clone(&recorder)));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let options = load_options(Arc::new(move |config: AppConfig| {
            let _ = tx.send(config);
        }));

        backend.load_config(&options).await.unwrap();
        assert_eq!(rx.recv().await, Some(app("redisA")));

        recorder.failing_gets.store(1, Ordering::SeqCst);
        backend.load_config(&options).await.unwrap();
        assert_eq!(rx.recv().await, Some(app("redisA")));
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 0);

        recorder.kv.put("/app/config/data_source/cache", r#""redisB""#);
        let reloaded = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(reloaded, Some(app("redisB")));
        options.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_one_watch_per_location() {
        let recorder = Arc::new(Recorder::default());
        let backend = KvBackend::new(RecordingConnector(Arc::clone(&recorder)));
        let options = load_options(Arc::new(|_: AppConfig| {}));
        backend.load_config(&options).await.unwrap();
        backend.load_config(&options).await.unwrap();
        assert_eq!(recorder.watches.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        options.shutdown.cancel();
    }
}
