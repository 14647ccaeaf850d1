//! The configuration store.
//!
//! A [`ConfigStore`] owns one typed configuration instance, the snapshot of
//! the last reload, the field listeners and the registered backends. Backends
//! push every freshly loaded instance into [`ConfigStore::reload`], which
//! diffs it against the snapshot per listener path and calls the listeners
//! whose value changed.
//!
//! # Example
//!
//! ```rust,ignore
//! use kvconf_runtime::{ConfigStore, Options};
//!
//! let store = ConfigStore::new();
//! store.init(
//!     Options::new()
//!         .url("conf/service.yaml")?
//!         .default_config(ServiceConfig::default())
//!         .watch(true),
//! ).await?;
//!
//! store.set_field_listener("DataSource.cache", |change| {
//!     tracing::info!(old = %change.old, new = %change.new, "cache backend changed");
//! });
//! ```
//!
//! # Re-entrancy
//!
//! Listeners run while the store's lock is held, in path order. A listener
//! must not call back into the same store (register listeners, read the
//! configuration, reload): doing so deadlocks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use kvconf_core::{
    Backend, BoxedBackend, Configuration, FILE_SCHEME, FieldPath, LoadOptions, resolve,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::file::FileBackend;
use crate::options::Options;

/// Polling only runs for reload delays longer than this.
const MIN_RELOAD_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Change notifications
// =============================================================================

/// How a listened value changed between two reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The value resolved before and after, and differs.
    Modified,
    /// The value did not resolve before; `old` is a zero value of `new`'s shape.
    Appeared,
    /// The value no longer resolves; `new` is a zero value of `old`'s shape.
    Disappeared,
}

/// A change observed at a listener path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// The listener path.
    pub path: String,
    /// Previous value.
    pub old: Value,
    /// Current value.
    pub new: Value,
    /// What kind of change this is.
    pub kind: ChangeKind,
}

impl FieldChange {
    /// Deserializes the previous value.
    pub fn old_as<V: DeserializeOwned>(&self) -> serde_json::Result<V> {
        V::deserialize(&self.old)
    }

    /// Deserializes the current value.
    pub fn new_as<V: DeserializeOwned>(&self) -> serde_json::Result<V> {
        V::deserialize(&self.new)
    }
}

/// Callback invoked with a field change.
pub type OnChange = Arc<dyn Fn(&FieldChange) + Send + Sync>;

/// Returns the zero value of `value`'s shape.
///
/// Objects keep their members, each zeroed recursively; arrays become empty.
pub fn zero_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), zero_value(v)))
                .collect(),
        ),
        Value::Array(_) => Value::Array(Vec::new()),
        Value::String(_) => Value::String(String::new()),
        Value::Number(_) => Value::from(0),
        Value::Bool(_) => Value::Bool(false),
        Value::Null => Value::Null,
    }
}

struct Listener {
    path: FieldPath,
    callback: OnChange,
}

/// Computes the change seen by one listener, if any.
fn field_change(
    path: &str,
    compiled: &FieldPath,
    previous: Option<&Value>,
    current: &Value,
) -> Option<FieldChange> {
    // A previous snapshot that no longer resolves counts as absent.
    let old = previous.and_then(|prev| resolve(prev, compiled).ok().flatten());
    let new = match resolve(current, compiled) {
        Ok(new) => new,
        Err(err) => {
            warn!(path = %path, error = %err, "cannot resolve listener path");
            return None;
        }
    };

    let (old, new, kind) = match (old, new) {
        (Some(old), Some(new)) if old == new => return None,
        (Some(old), Some(new)) => (old.clone(), new.clone(), ChangeKind::Modified),
        (Some(old), None) => (old.clone(), zero_value(old), ChangeKind::Disappeared),
        (None, Some(new)) => (zero_value(new), new.clone(), ChangeKind::Appeared),
        (None, None) => return None,
    };
    Some(FieldChange {
        path: path.to_string(),
        old,
        new,
        kind,
    })
}

// =============================================================================
// ConfigStore
// =============================================================================

struct StoreState<T> {
    instance: Option<T>,
    snapshot: Option<Value>,
    listeners: BTreeMap<String, Listener>,
    backends: HashMap<String, BoxedBackend<T>>,
}

struct Shared<T> {
    state: Mutex<StoreState<T>>,
    shutdown: CancellationToken,
}

/// A typed configuration kept in sync with a backend.
///
/// Cloning is cheap; clones share the same state.
pub struct ConfigStore<T: Configuration> {
    shared: Arc<Shared<T>>,
}

impl<T: Configuration> Clone for ConfigStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Configuration> Default for ConfigStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Configuration> fmt::Debug for ConfigStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ConfigStore")
            .field("loaded", &state.instance.is_some())
            .field("listeners", &state.listeners.keys().collect::<Vec<_>>())
            .field("backends", &state.backends.keys().collect::<Vec<_>>())
            .field("closed", &self.shared.shutdown.is_cancelled())
            .finish()
    }
}

impl<T: Configuration> ConfigStore<T> {
    /// Creates an unconfigured store with the file backend registered.
    pub fn new() -> Self {
        let mut backends: HashMap<String, BoxedBackend<T>> = HashMap::new();
        backends.insert(FILE_SCHEME.to_string(), Arc::new(FileBackend::new()));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState {
                    instance: None,
                    snapshot: None,
                    listeners: BTreeMap::new(),
                    backends,
                }),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Creates a store whose instance starts out as `config`.
    pub fn with_default(config: T) -> Self {
        let store = Self::new();
        store.shared.state.lock().instance = Some(config);
        store
    }

    fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Loads the configuration described by `options`.
    ///
    /// - A default configuration in `options` replaces the current instance;
    ///   otherwise the current instance is the default.
    /// - Without a location, the current instance is pushed through
    ///   [`reload`](Self::reload) once; without either, this fails with
    ///   [`ConfigError::NotSet`].
    /// - Otherwise the backend registered for the location's scheme loads the
    ///   configuration, and when the reload delay exceeds one second a task
    ///   polls the backend until [`close`](Self::close).
    pub async fn init(&self, options: Options<T>) -> ConfigResult<()> {
        let Options {
            location,
            default_config,
            timeout,
            reload_delay,
            watch,
        } = options;

        let default_config = {
            let mut state = self.shared.state.lock();
            match default_config {
                Some(config) => {
                    state.instance = Some(config.clone());
                    Some(config)
                }
                None => state.instance.clone(),
            }
        };

        let Some(location) = location else {
            let config = default_config.ok_or(ConfigError::NotSet)?;
            self.reload(config);
            return Ok(());
        };
        let default_config = default_config.ok_or(ConfigError::NotSet)?;

        let scheme = location.scheme().unwrap_or(FILE_SCHEME).to_string();
        let backend = self
            .shared
            .state
            .lock()
            .backends
            .get(&scheme)
            .cloned()
            .ok_or_else(|| ConfigError::invalid_backend_url(location.as_str()))?;

        let load_options = LoadOptions {
            location,
            timeout,
            reload_delay,
            watch,
            default_config,
            on_loaded: self.reload_hook(),
            shutdown: self.shared.shutdown.child_token(),
        };

        backend.load_config(&load_options).await?;
        info!(
            scheme = %scheme,
            url = %load_options.location,
            watch,
            "configuration loaded"
        );

        if reload_delay > MIN_RELOAD_DELAY {
            self.spawn_polling(backend, load_options);
        }
        Ok(())
    }

    /// Returns the hook handed to backends.
    ///
    /// The hook holds the store weakly, so background tasks never keep a
    /// dropped store alive.
    fn reload_hook(&self) -> kvconf_core::OnLoaded<T> {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        Arc::new(move |config: T| {
            if let Some(shared) = weak.upgrade() {
                ConfigStore::from_shared(shared).reload(config);
            }
        })
    }

    fn spawn_polling(&self, backend: BoxedBackend<T>, mut options: LoadOptions<T>) {
        let weak = Arc::downgrade(&self.shared);
        let shutdown = options.shutdown.clone();
        let delay = options.reload_delay;
        debug!(url = %options.location, ?delay, "starting configuration polling");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if let Some(current) = shared.state.lock().instance.clone() {
                    options.default_config = current;
                }
                drop(shared);

                if let Err(err) = backend.load_config(&options).await {
                    error!(url = %options.location, error = %err, "failed to reload configuration");
                }
            }
            debug!(url = %options.location, "configuration polling stopped");
        });
    }

    /// Registers `backend` for `scheme`, replacing any previous registration.
    pub fn add_backend<B>(&self, scheme: &str, backend: B)
    where
        B: Backend<T> + 'static,
    {
        self.shared
            .state
            .lock()
            .backends
            .insert(scheme.to_ascii_lowercase(), Arc::new(backend));
    }

    /// Returns `true` if a backend is registered for `scheme`.
    pub fn has_backend(&self, scheme: &str) -> bool {
        self.shared
            .state
            .lock()
            .backends
            .contains_key(&scheme.to_ascii_lowercase())
    }

    /// Listens for changes of the value at `path`, e.g. `Services[0].Hooks`.
    ///
    /// `""` listens to the whole configuration. A later registration for the
    /// same path replaces the earlier one.
    pub fn set_field_listener<F>(&self, path: &str, callback: F)
    where
        F: Fn(&FieldChange) + Send + Sync + 'static,
    {
        self.set_listener(path, Some(Arc::new(callback)));
    }

    /// Like [`set_field_listener`](Self::set_field_listener), with both sides
    /// deserialized into `V`.
    ///
    /// A synthesized side is `V::default()`. Changes that do not deserialize
    /// into `V` are logged and skipped.
    pub fn set_typed_field_listener<V, F>(&self, path: &str, callback: F)
    where
        V: DeserializeOwned + Default,
        F: Fn(V, V) + Send + Sync + 'static,
    {
        self.set_field_listener(path, move |change| {
            let old = match change.kind {
                ChangeKind::Appeared => Ok(V::default()),
                _ => change.old_as::<V>(),
            };
            let new = match change.kind {
                ChangeKind::Disappeared => Ok(V::default()),
                _ => change.new_as::<V>(),
            };
            match (old, new) {
                (Ok(old), Ok(new)) => callback(old, new),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(path = %change.path, error = %err, "field change has an unexpected type");
                }
            }
        });
    }

    /// Sets or, with `None`, removes the listener for `path`.
    pub fn set_listener(&self, path: &str, callback: Option<OnChange>) {
        let mut state = self.shared.state.lock();
        match callback {
            Some(callback) => {
                state.listeners.insert(
                    path.to_string(),
                    Listener {
                        path: FieldPath::compile(path),
                        callback,
                    },
                );
            }
            None => {
                state.listeners.remove(path);
            }
        }
    }

    /// Removes the listener for `path`, returning whether one was registered.
    pub fn remove_field_listener(&self, path: &str) -> bool {
        self.shared.state.lock().listeners.remove(path).is_some()
    }

    /// Returns a copy of the current configuration.
    pub fn get_config(&self) -> Option<T> {
        self.shared.state.lock().instance.clone()
    }

    /// Runs `f` on the current configuration without copying it.
    ///
    /// `f` runs under the store's lock and must not call back into the store.
    pub fn with_config<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.shared.state.lock().instance.as_ref().map(f)
    }

    /// Reads the value at `path` of the current configuration.
    pub fn get_field_value(&self, path: &str) -> ConfigResult<Option<Value>> {
        let value = {
            let state = self.shared.state.lock();
            match &state.instance {
                Some(instance) => serde_json::to_value(instance)?,
                None => return Ok(None),
            }
        };
        resolve(&value, &FieldPath::compile(path))
            .map(|v| v.cloned())
            .map_err(|source| ConfigError::Path {
                path: path.to_string(),
                source,
            })
    }

    /// Replaces the instance and notifies listeners whose value changed.
    ///
    /// This is the hook backends call; callers may also push a value directly.
    /// Reloading a value equal to the last snapshot notifies nobody.
    pub fn reload(&self, config: T) {
        let fresh = match serde_json::to_value(&config) {
            Ok(value) => Some(value),
            Err(err) => {
                error!(error = %err, "cannot snapshot configuration, listeners not notified");
                None
            }
        };

        let mut state = self.shared.state.lock();
        state.instance = Some(config);
        let Some(fresh) = fresh else {
            return;
        };
        if state.snapshot.as_ref() == Some(&fresh) {
            debug!("configuration unchanged");
            return;
        }

        let previous = state.snapshot.take();
        for (path, listener) in &state.listeners {
            if let Some(change) = field_change(path, &listener.path, previous.as_ref(), &fresh) {
                debug!(path = %path, kind = ?change.kind, "field changed");
                (listener.callback)(&change);
            }
        }
        state.snapshot = Some(fresh);
    }

    /// Stops polling and every watch started on behalf of this store.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kvconf_core::{BackendResult, async_trait};
    use kvconf_macros::KvLayout;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, KvLayout)]
    #[serde(rename_all = "PascalCase")]
    struct Service {
        name: String,
        hooks: Vec<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, KvLayout)]
    #[serde(rename_all = "PascalCase")]
    struct ServiceConfig {
        addr: String,
        #[kv(key = "data_source/")]
        data_source: BTreeMap<String, String>,
        services: Vec<Service>,
    }

    fn config(cache: &str) -> ServiceConfig {
        ServiceConfig {
            addr: ":9090".into(),
            data_source: BTreeMap::from([("cache".to_string(), cache.to_string())]),
            services: Vec::new(),
        }
    }

    fn service(name: &str) -> Service {
        Service {
            name: name.into(),
            hooks: vec!["http://hook".into()],
        }
    }

    type Calls = Arc<Mutex<Vec<FieldChange>>>;

    fn record(store: &ConfigStore<ServiceConfig>, path: &str) -> Calls {
        let calls: Calls = Arc::default();
        let sink = Arc::clone(&calls);
        store.set_field_listener(path, move |change| sink.lock().push(change.clone()));
        calls
    }

    #[test]
    fn test_zero_value() {
        assert_eq!(
            zero_value(&json!({"Name": "a", "Port": 80, "Tags": ["x"], "On": true, "Opt": null})),
            json!({"Name": "", "Port": 0, "Tags": [], "On": false, "Opt": null})
        );
        assert_eq!(zero_value(&json!(1.5)), json!(0));
    }

    #[tokio::test]
    async fn test_cache_change_scenario() {
        let store = ConfigStore::with_default(config("redisA"));
        store.init(Options::new()).await.unwrap();

        let calls = record(&store, "DataSource.cache");
        store.reload(config("redisB"));

        {
            let calls = calls.lock();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].old, json!("redisA"));
            assert_eq!(calls[0].new, json!("redisB"));
            assert_eq!(calls[0].kind, ChangeKind::Modified);
        }

        store.reload(config("redisB"));
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(store.get_config(), Some(config("redisB")));
    }

    #[tokio::test]
    async fn test_identical_reload_is_noop() {
        let store = ConfigStore::new();
        let whole = record(&store, "");
        let addr = record(&store, "Addr");

        store.reload(config("redisA"));
        assert_eq!(whole.lock().len(), 1);
        assert_eq!(addr.lock().len(), 1);

        store.reload(config("redisA"));
        assert_eq!(whole.lock().len(), 1);
        assert_eq!(addr.lock().len(), 1);
    }

    #[test]
    fn test_first_reload_reports_appeared() {
        let store = ConfigStore::new();
        let calls = record(&store, "Addr");

        store.reload(config("redisA"));
        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, ChangeKind::Appeared);
        assert_eq!(calls[0].old, json!(""));
        assert_eq!(calls[0].new, json!(":9090"));
    }

    #[test]
    fn test_sequence_element_appears_and_disappears() {
        let store = ConfigStore::new();
        let mut cfg = config("redisA");
        cfg.services = vec![service("a")];
        store.reload(cfg.clone());

        let calls = record(&store, "Services[1]");

        cfg.services.push(service("b"));
        store.reload(cfg.clone());
        {
            let calls = calls.lock();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].kind, ChangeKind::Appeared);
            assert_eq!(calls[0].old, json!({"Name": "", "Hooks": []}));
            assert_eq!(calls[0].new, json!({"Name": "b", "Hooks": ["http://hook"]}));
        }

        cfg.services.pop();
        store.reload(cfg);
        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].kind, ChangeKind::Disappeared);
        assert_eq!(calls[1].old, json!({"Name": "b", "Hooks": ["http://hook"]}));
        assert_eq!(calls[1].new, json!({"Name": "", "Hooks": []}));
    }

    #[test]
    fn test_unrelated_change_does_not_notify() {
        let store = ConfigStore::new();
        store.reload(config("redisA"));
        let calls = record(&store, "Addr");

        store.reload(config("redisB"));
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_unresolvable_path_is_skipped() {
        let store = ConfigStore::new();
        let bad = record(&store, "Addr.port");
        let good = record(&store, "DataSource.cache");

        store.reload(config("redisA"));
        assert!(bad.lock().is_empty());
        assert_eq!(good.lock().len(), 1);
    }

    #[test]
    fn test_typed_listener() {
        let store = ConfigStore::new();
        store.reload(config("redisA"));

        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        store.set_typed_field_listener("DataSource.cache", move |old: String, new: String| {
            sink.lock().push((old, new));
        });

        store.reload(config("redisB"));
        assert_eq!(
            *seen.lock(),
            vec![("redisA".to_string(), "redisB".to_string())]
        );
    }

    #[test]
    fn test_remove_listener() {
        let store = ConfigStore::new();
        let calls = record(&store, "DataSource.cache");
        store.set_listener("DataSource.cache", None);
        store.reload(config("redisA"));
        assert!(calls.lock().is_empty());

        let _calls = record(&store, "Addr");
        assert!(store.remove_field_listener("Addr"));
        assert!(!store.remove_field_listener("Addr"));
    }

    #[test]
    fn test_get_field_value() {
        let store = ConfigStore::new();
        assert_eq!(store.get_field_value("Addr").unwrap(), None);

        store.reload(config("redisA"));
        assert_eq!(
            store.get_field_value("DataSource.cache").unwrap(),
            Some(json!("redisA"))
        );
        assert_eq!(store.get_field_value("Services[3]").unwrap(), None);
        assert!(matches!(
            store.get_field_value("Addr.x"),
            Err(ConfigError::Path { .. })
        ));
        assert_eq!(store.with_config(|c| c.addr.clone()), Some(":9090".into()));
    }

    #[tokio::test]
    async fn test_init_errors() {
        let store: ConfigStore<ServiceConfig> = ConfigStore::new();
        assert!(matches!(
            store.init(Options::new()).await,
            Err(ConfigError::NotSet)
        ));

        let options = Options::new()
            .url("etcd://127.0.0.1:2379/app")
            .unwrap()
            .default_config(config("redisA"));
        let err = store.init(options).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "[etcd://127.0.0.1:2379/app] is not a valid backend url"
        );
    }

    #[tokio::test]
    async fn test_init_without_url_uses_existing_instance() {
        let store = ConfigStore::with_default(config("redisA"));
        let calls = record(&store, "");
        store.init(Options::new()).await.unwrap();
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(calls.lock()[0].kind, ChangeKind::Appeared);
    }

    struct CountingBackend {
        calls: Arc<AtomicUsize>,
        last_default: Arc<Mutex<Option<ServiceConfig>>>,
    }

    #[async_trait]
    impl Backend<ServiceConfig> for CountingBackend {
        async fn load_config(&self, options: &LoadOptions<ServiceConfig>) -> BackendResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_default.lock() = Some(options.default_config.clone());
            let mut cfg = options.default_config.clone();
            cfg.addr = format!(":{}", 9000 + n);
            (options.on_loaded)(cfg);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_until_close() {
        let calls = Arc::new(AtomicUsize::new(0));
        let last_default = Arc::default();
        let store = ConfigStore::new();
        store.add_backend(
            "Mock",
            CountingBackend {
                calls: Arc::clone(&calls),
                last_default: Arc::clone(&last_default),
            },
        );
        assert!(store.has_backend("mock"));

        let options = Options::new()
            .url("mock://local/app")
            .unwrap()
            .default_config(config("redisA"))
            .reload_delay(Duration::from_secs(2));
        store.init(options).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_config().unwrap().addr, ":9000");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(calls.load(Ordering::SeqCst) >= 3);
        // Each poll starts from the instance loaded by the previous one.
        assert_ne!(last_default.lock().as_ref().unwrap().addr, ":9090");

        store.close();
        assert!(store.is_closed());
        tokio::task::yield_now().await;
        let after_close = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reload_delay_does_not_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = ConfigStore::new();
        store.add_backend(
            "mock",
            CountingBackend {
                calls: Arc::clone(&calls),
                last_default: Arc::default(),
            },
        );
        let options = Options::new()
            .url("mock://local/app?ttl=-1")
            .unwrap()
            .default_config(config("redisA"));
        store.init(options).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
