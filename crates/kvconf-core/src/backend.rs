//! Contracts implemented by storage backends.
//!
//! A [`Backend`] loads the configuration from wherever a location points and
//! hands every freshly decoded instance to the store through
//! [`LoadOptions::on_loaded`]. Backends that can be notified of remote changes
//! keep a watch running and call the same hook again for each change.
//!
//! Flat key/value stores do not need to implement [`Backend`] themselves:
//! implementing [`KvConnector`] and [`KvClient`] is enough to plug into the
//! generic KV backend of `kvconf-runtime`, which takes care of the codec,
//! bootstrapping, retries and watches.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::codec::Kv;
use crate::error::BackendResult;
use crate::layout::Configuration;
use crate::location::Location;

/// Hook invoked with each freshly loaded configuration.
pub type OnLoaded<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Everything a backend needs for one load.
pub struct LoadOptions<T> {
    /// Where the configuration lives.
    pub location: Location,
    /// Upper bound for each individual read or write.
    pub timeout: Duration,
    /// Polling period of the store, zero when it does not poll.
    pub reload_delay: Duration,
    /// Whether the backend should keep watching for changes.
    pub watch: bool,
    /// The configuration to bootstrap an empty store with. Its layout also
    /// drives decoding.
    pub default_config: T,
    /// The store's reload hook.
    pub on_loaded: OnLoaded<T>,
    /// Cancelled when the owning store is closed; long-lived tasks stop on it.
    pub shutdown: CancellationToken,
}

impl<T: Clone> Clone for LoadOptions<T> {
    fn clone(&self) -> Self {
        Self {
            location: self.location.clone(),
            timeout: self.timeout,
            reload_delay: self.reload_delay,
            watch: self.watch,
            default_config: self.default_config.clone(),
            on_loaded: Arc::clone(&self.on_loaded),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T> fmt::Debug for LoadOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("location", &self.location.as_str())
            .field("timeout", &self.timeout)
            .field("reload_delay", &self.reload_delay)
            .field("watch", &self.watch)
            .finish_non_exhaustive()
    }
}

/// A configuration backend.
///
/// `load_config` is called once by `init` and again on every polling cycle.
/// A well-behaved backend:
///
/// - bootstraps the store of record with `default_config` when nothing is
///   stored yet, and still calls `on_loaded` with it;
/// - decodes stored data into a fresh instance and calls `on_loaded`;
/// - starts at most one watch per location when `watch` is set.
#[async_trait]
pub trait Backend<T: Configuration>: Send + Sync {
    /// Loads the configuration and reports it through `options.on_loaded`.
    async fn load_config(&self, options: &LoadOptions<T>) -> BackendResult<()>;
}

/// Boxed backend as stored by the configuration store.
pub type BoxedBackend<T> = Arc<dyn Backend<T>>;

/// Connection to a flat key/value store.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    /// Reads `key`. For a directory key (ending in `/`) every entry below it
    /// is returned as well.
    async fn get(&self, key: &str) -> BackendResult<Vec<Kv>>;

    /// Writes a single entry.
    async fn put(&self, kv: &Kv) -> BackendResult<()>;

    /// Subscribes to changes of `key` (and everything below a directory key).
    /// The stream yields one item per observed change.
    async fn watch(&self, key: &str) -> BackendResult<BoxStream<'static, BackendResult<()>>>;

    /// Releases the connection.
    async fn close(&self) {}
}

/// Opens [`KvClient`] connections.
#[async_trait]
pub trait KvConnector: Send + Sync + 'static {
    /// The client type produced.
    type Client: KvClient;

    /// Connects to the store named by `location`.
    async fn connect(&self, location: &Location, timeout: Duration)
    -> BackendResult<Self::Client>;
}
