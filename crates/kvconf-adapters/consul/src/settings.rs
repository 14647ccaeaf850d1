//! Connection settings derived from a `consul://` location.
//!
//! | Part | Example | Meaning |
//! |------|---------|---------|
//! | host | `127.0.0.1:8500` | Agent address; only the first host is used |
//! | user info | `user:pass@` | HTTP basic auth |
//! | `scheme` | `https` | Talk HTTPS to the agent |
//! | `cert` | `/etc/consul/ca.pem` | PEM CA bundle added to the trusted roots; implies HTTPS |
//! | `datacenter` | `dc1` | Datacenter to query |

use std::path::PathBuf;

use kvconf_core::{BackendError, BackendResult, Location};
use url::Url;

/// Resolved settings for one Consul agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulSettings {
    /// `host:port` of the agent.
    pub address: String,
    /// `http` or `https`.
    pub scheme: String,
    /// CA bundle to trust.
    pub ca_cert: Option<PathBuf>,
    /// Datacenter passed as `dc`.
    pub datacenter: Option<String>,
    /// Basic auth user.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
}

impl ConsulSettings {
    /// Reads the settings from a location.
    pub fn from_location(location: &Location) -> BackendResult<Self> {
        let address = location
            .hosts()
            .first()
            .cloned()
            .ok_or_else(|| BackendError::connect(location.as_str(), "no consul address"))?;

        let ca_cert = location
            .query_param("cert")
            .filter(|c| !c.is_empty())
            .map(PathBuf::from);
        let scheme = if ca_cert.is_some() || location.query_param("scheme") == Some("https") {
            "https"
        } else {
            "http"
        };

        Ok(Self {
            address,
            scheme: scheme.to_string(),
            ca_cert,
            datacenter: location
                .query_param("datacenter")
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            username: location.username().map(str::to_string),
            password: location.password().map(str::to_string),
        })
    }

    /// Returns the URL of `key` in the KV API.
    pub fn kv_url(&self, key: &str) -> BackendResult<Url> {
        let base = format!("{}://{}/v1/kv/", self.scheme, self.address);
        let mut url =
            Url::parse(&base).map_err(|e| BackendError::connect(base.as_str(), e))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::connect(base.as_str(), "address cannot be a base"))?;
            segments.pop_if_empty();
            segments.extend(key.split('/'));
        }
        if let Some(dc) = &self.datacenter {
            url.query_pairs_mut().append_pair("dc", dc);
        }
        Ok(url)
    }
}
