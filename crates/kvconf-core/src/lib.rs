//! # kvconf Core
//!
//! The engine-independent half of kvconf: everything needed to map a typed
//! configuration object onto a flat key/value store and to address parts of
//! it by path.
//!
//! ## Building Blocks
//!
//! - **Layout**: [`KvLayout`] describes a type's shape and the routing key of
//!   each field, usually via `#[derive(KvLayout)]` from `kvconf-macros`
//! - **Path Resolver**: [`FieldPath`] and [`resolve`] walk dotted/bracketed
//!   paths such as `Services[0].Hooks`
//! - **KV Codec**: [`marshal`], [`decode`], [`unmarshal`] and [`prefix_keys`]
//!   convert between objects and [`Kv`] entries
//! - **Location**: [`Location`] parses `scheme://host[,host]/path?query` URLs
//! - **Backend Contract**: [`Backend`], [`KvClient`] and [`KvConnector`]
//!
//! ## Data Model
//!
//! Values pass through `serde_json::Value`. Records and maps are objects,
//! sequences are arrays; the layout decides how each part is spread over keys:
//!
//! ```text
//! ServiceConfig at "/dir/test"
//! ├── Addr, LogLevel         → "/dir/test"                {"Addr":..,"LogLevel":..}
//! ├── DataSource ("data_source/") → "/dir/test/data_source/<key>"
//! └── Services ("/services/a")    → "/services/a"          [..]
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use kvconf_core::{KvLayout, marshal, unmarshal};
//!
//! let kvs = marshal("/dir/test", &config)?;
//! let mut fresh = ServiceConfig::default();
//! unmarshal("/dir/test", &kvs, &mut fresh)?;
//! assert_eq!(fresh, config);
//! ```

// Lets `#[derive(KvLayout)]` refer to `::kvconf_core` inside this crate's own tests.
extern crate self as kvconf_core;

pub mod backend;
pub mod codec;
pub mod error;
pub mod layout;
pub mod location;
pub mod path;

pub use backend::{Backend, BoxedBackend, KvClient, KvConnector, LoadOptions, OnLoaded};
pub use codec::{Kv, decode, document, marshal, marshal_value, prefix_keys, sort_kvs, unmarshal};
pub use error::{
    BackendError, BackendResult, CodecError, CodecResult, LocationError, PathError, PathResult,
};
pub use layout::{Configuration, FieldLayout, KvLayout, Layout, Shape};
pub use location::{FILE_SCHEME, Location, TlsFiles};
pub use path::{FieldPath, get_field_value, resolve};

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

/// Prelude for common imports.
pub mod prelude {
    pub use super::backend::{Backend, KvClient, KvConnector, LoadOptions};
    pub use super::codec::{Kv, marshal, unmarshal};
    pub use super::layout::{Configuration, KvLayout};
    pub use super::path::FieldPath;
}
