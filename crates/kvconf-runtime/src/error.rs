//! Store error types.

use kvconf_core::{BackendError, LocationError, PathError};
use thiserror::Error;

/// Errors returned by the configuration store.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `init` was called without a location and no configuration is loaded.
    #[error("config not set")]
    NotSet,

    /// No backend is registered for the location's scheme.
    #[error("[{url}] is not a valid backend url")]
    InvalidBackendUrl {
        /// The rejected location.
        url: String,
    },

    /// The location could not be parsed.
    #[error("invalid location: {0}")]
    InvalidLocation(#[from] LocationError),

    /// The backend failed to load the configuration.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A listener path could not be resolved.
    #[error("path '{path}' cannot be resolved: {source}")]
    Path {
        /// The listener path.
        path: String,
        /// Underlying resolver error.
        source: PathError,
    },

    /// The configuration could not be serialized.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Engine settings could not be extracted.
    #[error("failed to load settings: {0}")]
    Settings(String),

    /// A settings file does not exist.
    #[error("settings file not found: {0}")]
    SettingsFileNotFound(std::path::PathBuf),
}

impl ConfigError {
    /// Creates an invalid backend url error.
    pub fn invalid_backend_url(url: impl Into<String>) -> Self {
        Self::InvalidBackendUrl { url: url.into() }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Settings(err.to_string())
    }
}

/// Result type for store operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
