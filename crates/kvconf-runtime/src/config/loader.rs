//! Settings loader using figment.
//!
//! # Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Settings file (`toml-config` / `yaml-config` features)
//! 3. Environment variables (`KVCONF_*`)
//! 4. Programmatic overrides
//!
//! # Environment Variable Mapping
//!
//! Nested keys are separated by `__`:
//!
//! - `KVCONF_URL=consul://127.0.0.1:8500/app/config` → `url`
//! - `KVCONF_TIMEOUT_SECS=5` → `timeout_secs`
//! - `KVCONF_LOGGING__LEVEL=debug` → `logging.level`
//!
//! # Example
//!
//! ```rust,ignore
//! use kvconf_runtime::config::SettingsLoader;
//!
//! let settings = SettingsLoader::new().file("kvconf.toml").load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace};

use super::schema::Settings;
use crate::error::{ConfigError, ConfigResult};

/// Prefix of the environment variables read by the loader.
pub const ENV_PREFIX: &str = "KVCONF_";

/// Loads [`Settings`] from defaults, an optional file and the environment.
pub struct SettingsLoader {
    figment: Figment,
    load_env: bool,
    file: Option<PathBuf>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    /// Creates a loader reading defaults and environment variables.
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            load_env: true,
            file: None,
        }
    }

    /// Reads a settings file as well.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges settings programmatically; they take precedence over every other source.
    pub fn merge(mut self, settings: Settings) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(settings));
        self
    }

    /// Loads and returns the settings.
    pub fn load(self) -> ConfigResult<Settings> {
        let settings: Settings = self.build_figment()?.extract()?;
        debug!(
            url = settings.url.as_deref().unwrap_or(""),
            logging_level = %settings.logging.level,
            "settings loaded"
        );
        Ok(settings)
    }

    fn build_figment(self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigError::SettingsFileNotFound(path.clone()));
            }
            info!(path = %path.display(), "loading settings file");
            figment = Self::merge_file(figment, path)?;
        }

        if self.load_env {
            trace!("loading environment variables with {ENV_PREFIX} prefix");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }

        Ok(figment.merge(self.figment))
    }

    /// Merges a settings file, dispatching on its extension.
    fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            #[cfg(feature = "toml-config")]
            "toml" => Ok(figment.merge(Toml::file(path))),
            #[cfg(feature = "yaml-config")]
            "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
            _ => {
                let _ = figment;
                Err(ConfigError::Settings(format!(
                    "unsupported or disabled settings file format: .{ext}"
                )))
            }
        }
    }
}

/// Loads settings from defaults and `KVCONF_*` environment variables.
pub fn load_settings() -> ConfigResult<Settings> {
    SettingsLoader::new().load()
}
