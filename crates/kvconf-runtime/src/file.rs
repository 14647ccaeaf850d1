//! Local file backend.
//!
//! The file format follows the extension: `.json` is JSON, `.toml` is TOML and
//! everything else is YAML. A missing file is created from the default
//! configuration. File content is laid over the default configuration, so
//! members missing from the file keep their default values. With `watch` set,
//! content changes are picked up through `notify` and pushed to the store; a
//! change that fails to parse is logged and the store keeps its configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvconf_core::{Backend, BackendError, BackendResult, Configuration, LoadOptions};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info};

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
    Yaml,
}

impl FileFormat {
    /// Picks the format from the file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }

    /// Encodes `config`; JSON is indented with tabs.
    pub fn encode<T: Serialize>(self, config: &T, target: &Path) -> BackendResult<Vec<u8>> {
        let fail = |err: &dyn std::fmt::Display| BackendError::encode(target.display().to_string(), err);
        match self {
            Self::Json => {
                let mut buf = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
                let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
                config.serialize(&mut ser).map_err(|e| fail(&e))?;
                Ok(buf)
            }
            Self::Toml => toml::to_string_pretty(config)
                .map(String::into_bytes)
                .map_err(|e| fail(&e)),
            Self::Yaml => serde_yaml::to_string(config)
                .map(String::into_bytes)
                .map_err(|e| fail(&e)),
        }
    }

    /// Parses file content into the generic data model.
    pub fn parse(self, content: &str, source: &Path) -> BackendResult<Value> {
        let fail = |err: &dyn std::fmt::Display| BackendError::decode(source.display().to_string(), err);
        match self {
            Self::Json => serde_json::from_str(content).map_err(|e| fail(&e)),
            Self::Toml => toml::from_str(content).map_err(|e| fail(&e)),
            Self::Yaml => serde_yaml::from_str(content).map_err(|e| fail(&e)),
        }
    }

    /// Decodes file content over `base`: members the file leaves out keep
    /// the values they have in `base`.
    pub fn decode<T>(self, content: &str, source: &Path, base: &T) -> BackendResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let fail = |err: &dyn std::fmt::Display| BackendError::decode(source.display().to_string(), err);
        let mut merged = serde_json::to_value(base).map_err(|e| fail(&e))?;
        // An empty YAML document parses to null and leaves the defaults.
        match self.parse(content, source)? {
            Value::Null => {}
            parsed => overlay(&mut merged, parsed),
        }
        T::deserialize(merged).map_err(|e| fail(&e))
    }
}

/// Merges `top` into `base`. Objects merge member by member; anything else
/// replaces the base value.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base), Value::Object(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

fn read_file<T>(path: &Path, base: &T) -> BackendResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let content = std::fs::read_to_string(path)?;
    FileFormat::from_path(path).decode(&content, path, base)
}

/// Returns `true` for events that may have changed the file's content.
fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        kind => kind.is_modify() || kind.is_create(),
    }
}

/// Loads configuration files; see the [module documentation](self).
///
/// The backend owns its watchers, at most one per path; they are dropped
/// when the owning store is closed.
#[derive(Default)]
pub struct FileBackend {
    watchers: Arc<Mutex<HashMap<PathBuf, RecommendedWatcher>>>,
}

impl FileBackend {
    /// Creates a file backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `path` is being watched.
    pub fn is_watching(&self, path: &Path) -> bool {
        self.watchers.lock().contains_key(path)
    }

    fn watch<T: Configuration>(&self, path: &Path, options: &LoadOptions<T>) -> BackendResult<()> {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(path) {
            return Ok(());
        }

        let on_loaded = Arc::clone(&options.on_loaded);
        let shutdown = options.shutdown.clone();
        let base = options.default_config.clone();
        let watched = path.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_content_change(&event.kind) && !shutdown.is_cancelled() => {
                    match read_file(&watched, &base) {
                        Ok(config) => {
                            info!(path = %watched.display(), "configuration file changed, reloading");
                            on_loaded(config);
                        }
                        Err(err) => {
                            error!(
                                path = %watched.display(),
                                error = %err,
                                "failed to reload configuration file, keeping current configuration"
                            );
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => error!(path = %watched.display(), error = %err, "file watch error"),
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| BackendError::Watch(e.to_string()))?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| BackendError::Watch(e.to_string()))?;
        watchers.insert(path.to_path_buf(), watcher);
        drop(watchers);
        debug!(path = %path.display(), "watching configuration file");

        let watchers = Arc::clone(&self.watchers);
        let shutdown = options.shutdown.clone();
        let key = path.to_path_buf();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            watchers.lock().remove(&key);
            debug!(path = %key.display(), "stopped watching configuration file");
        });
        Ok(())
    }
}

#[async_trait]
impl<T: Configuration> Backend<T> for FileBackend {
    async fn load_config(&self, options: &LoadOptions<T>) -> BackendResult<()> {
        let path = PathBuf::from(options.location.file_path());
        let format = FileFormat::from_path(&path);

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let config = format.decode(&content, &path, &options.default_config)?;
                if options.watch {
                    self.watch(&path, options)?;
                }
                (options.on_loaded)(config);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(dir).await?;
                }
                let content = format.encode(&options.default_config, &path)?;
                tokio::fs::write(&path, content).await?;
                info!(path = %path.display(), "configuration file not found, wrote default");
                if options.watch {
                    self.watch(&path, options)?;
                }
                (options.on_loaded)(options.default_config.clone());
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kvconf_macros::KvLayout;
    use serde::Deserialize;

    use super::*;
    use crate::{ConfigError, ConfigStore, Options};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, KvLayout)]
    #[serde(rename_all = "PascalCase")]
    struct ServiceConfig {
        addr: String,
        data_source: BTreeMap<String, String>,
    }

    fn config(cache: &str) -> ServiceConfig {
        ServiceConfig {
            addr: ":9090".into(),
            data_source: BTreeMap::from([("cache".to_string(), cache.to_string())]),
        }
    }

    async fn init(store: &ConfigStore<ServiceConfig>, path: &Path, watch: bool) -> crate::ConfigResult<()> {
        let options = Options::new()
            .url(path.to_str().unwrap())?
            .default_config(config("redisA"))
            .watch(watch);
        store.init(options).await
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(FileFormat::from_path(Path::new("a/b.json")), FileFormat::Json);
        assert_eq!(FileFormat::from_path(Path::new("a/b.toml")), FileFormat::Toml);
        assert_eq!(FileFormat::from_path(Path::new("a/b.yaml")), FileFormat::Yaml);
        assert_eq!(FileFormat::from_path(Path::new("a/b")), FileFormat::Yaml);
    }

    #[test]
    fn test_metadata_events_are_ignored() {
        use notify::event::{CreateKind, DataChange, MetadataKind};
        assert!(!is_content_change(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(is_content_change(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(is_content_change(&EventKind::Create(CreateKind::File)));
        assert!(!is_content_change(&EventKind::Access(
            notify::event::AccessKind::Any
        )));
    }

    #[tokio::test]
    async fn test_missing_file_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/conf/service.json");

        let store = ConfigStore::new();
        init(&store, &path, false).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("{\n\t\"Addr\": \":9090\""));
        assert_eq!(store.get_config(), Some(config("redisA")));
    }

    #[tokio::test]
    async fn test_missing_yaml_file_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.yaml");

        let store = ConfigStore::new();
        init(&store, &path, false).await.unwrap();

        let written: ServiceConfig =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, config("redisA"));
    }

    #[tokio::test]
    async fn test_existing_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "Addr = \":8080\"\n\n[DataSource]\ncache = \"redisB\"\n").unwrap();

        let store = ConfigStore::new();
        init(&store, &path, false).await.unwrap();

        let loaded = store.get_config().unwrap();
        assert_eq!(loaded.addr, ":8080");
        assert_eq!(loaded.data_source["cache"], "redisB");
    }

    #[tokio::test]
    async fn test_missing_members_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.yaml");
        std::fs::write(&path, "Addr: \":8080\"\n").unwrap();

        let store = ConfigStore::new();
        init(&store, &path, false).await.unwrap();

        let loaded = store.get_config().unwrap();
        assert_eq!(loaded.addr, ":8080");
        assert_eq!(loaded.data_source["cache"], "redisA");

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "").unwrap();
        let store = ConfigStore::new();
        init(&store, &empty, false).await.unwrap();
        assert_eq!(store.get_config(), Some(config("redisA")));
    }

    #[test]
    fn test_overlay_merges_objects_and_replaces_the_rest() {
        let mut base = serde_json::json!({
            "Addr": ":9090",
            "DataSource": {"cache": "redisA", "db": "mysql"},
            "Tags": ["a", "b"],
        });
        overlay(
            &mut base,
            serde_json::json!({"DataSource": {"cache": "redisB"}, "Tags": ["c"], "Extra": 1}),
        );
        assert_eq!(
            base,
            serde_json::json!({
                "Addr": ":9090",
                "DataSource": {"cache": "redisB", "db": "mysql"},
                "Tags": ["c"],
                "Extra": 1,
            })
        );
    }

    #[tokio::test]
    async fn test_parse_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = ConfigStore::new();
        let fired = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&fired);
        store.set_field_listener("", move |_| *sink.lock() += 1);

        let err = init(&store, &path, false).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Backend(BackendError::Decode { .. })
        ));
        assert_eq!(*fired.lock(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, serde_json::to_string(&config("redisA")).unwrap()).unwrap();

        let store = ConfigStore::new();
        init(&store, &path, true).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        store.set_typed_field_listener("DataSource.cache", move |old: String, new: String| {
            let _ = tx.send((old, new));
        });

        std::fs::write(&path, serde_json::to_string(&config("redisB")).unwrap()).unwrap();
        let change = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, ("redisA".to_string(), "redisB".to_string()));

        store.close();
    }

    #[tokio::test]
    async fn test_close_drops_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.yaml");

        let backend = FileBackend::new();
        let shutdown = kvconf_core::CancellationToken::new();
        let options = LoadOptions {
            location: kvconf_core::Location::parse(path.to_str().unwrap()).unwrap(),
            timeout: Duration::ZERO,
            reload_delay: Duration::ZERO,
            watch: true,
            default_config: config("redisA"),
            on_loaded: Arc::new(|_: ServiceConfig| {}),
            shutdown: shutdown.clone(),
        };
        backend.load_config(&options).await.unwrap();
        backend.load_config(&options).await.unwrap();
        assert!(backend.is_watching(&path));

        shutdown.cancel();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!backend.is_watching(&path));
    }
}
