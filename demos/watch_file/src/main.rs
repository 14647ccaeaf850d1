//! Watch File Example
//!
//! Loads a service configuration from a file (or any registered store),
//! writes the defaults if the file does not exist, and logs every change to
//! the watched fields until interrupted.
//!
//! ```text
//! ServiceConfig                      conf/service.yaml
//! ├── Addr          ── listener ──▶  Addr: ":8080"
//! ├── LogLevel      ── listener ──▶  LogLevel: info
//! ├── DataSource    ── listener ──▶  DataSource: {cache: redis}
//! └── Services[0]   ── listener ──▶  Services: [{Name: api, ...}]
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --package watch-file -- conf/service.yaml --watch
//! cargo run --package watch-file -- "consul://127.0.0.1:8500/services/demo?ttl=30"
//! ```
//!
//! Edit the file while it runs to see the listeners fire.

use std::collections::BTreeMap;

use anyhow::Result;
use clap::Parser;
use kvconf::prelude::*;
use kvconf::runtime::LoggingBuilder;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Watches a configuration and logs field changes")]
struct Args {
    /// Configuration location: a file path or a store URL.
    #[arg(default_value = "conf/service.yaml")]
    url: String,

    /// Watch for changes. Store URLs watch unless `watch=false` or a short
    /// `ttl` is given; files only when asked.
    #[arg(long)]
    watch: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, KvLayout)]
#[serde(rename_all = "PascalCase")]
struct Hooks {
    url: String,
    key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, KvLayout)]
#[serde(rename_all = "PascalCase")]
struct Service {
    name: String,
    url: String,
    hooks: Hooks,
}

#[derive(Debug, Clone, Serialize, Deserialize, KvLayout)]
#[serde(rename_all = "PascalCase")]
struct ServiceConfig {
    addr: String,
    log_level: String,
    #[kv(key = "data_source/")]
    data_source: BTreeMap<String, String>,
    #[kv(key = "services/")]
    services: Vec<Service>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            addr: ":8080".into(),
            log_level: "info".into(),
            data_source: BTreeMap::from([("cache".into(), "redis://127.0.0.1:6379".into())]),
            services: vec![Service {
                name: "api".into(),
                url: "http://127.0.0.1:9000".into(),
                hooks: Hooks::default(),
            }],
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    LoggingBuilder::new().with_level(tracing::Level::INFO).init();
    let args = Args::parse();

    let store = ConfigStore::new();
    kvconf::register_remote_backends(&store);

    store.set_typed_field_listener("Addr", |old: String, new: String| {
        info!(%old, %new, "listen address changed");
    });
    store.set_typed_field_listener("LogLevel", |old: String, new: String| {
        info!(%old, %new, "log level changed");
    });
    store.set_field_listener("DataSource", |change| {
        info!(kind = ?change.kind, new = %change.new, "data sources changed");
    });
    store.set_field_listener("Services[0]", |change| match change.kind {
        ChangeKind::Disappeared => info!("first service removed"),
        _ => info!(service = %change.new, "first service updated"),
    });

    let mut options = Options::new()
        .url(&args.url)?
        .default_config(ServiceConfig::default());
    if args.watch {
        options = options.watch(true);
    }
    store.init(options).await?;

    if let Some(config) = store.get_config() {
        info!(?config, "configuration loaded");
    }

    tokio::signal::ctrl_c().await?;
    store.close();
    info!("bye");
    Ok(())
}
