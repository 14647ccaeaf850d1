//! Procedural macros for kvconf.
//!
//! This crate provides:
//!
//! - `#[derive(KvLayout)]` - Describes a configuration type to the KV codec
//!
//! # KvLayout Derive Macro
//!
//! ```rust,ignore
//! use kvconf_macros::KvLayout;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize, KvLayout)]
//! #[serde(rename_all = "PascalCase")]
//! pub struct ServiceConfig {
//!     pub addr: String,
//!     #[kv(key = "data_source/")]
//!     pub data_source: HashMap<String, String>,
//!     #[kv(key = "/services/test/a")]
//!     pub services: Vec<Service>,
//! }
//! ```

mod layout;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derives `kvconf_core::KvLayout`.
///
/// For **structs** with named fields, this generates a record layout listing
/// every serialized field with its serde name, routing key and shape.
///
/// For **enums** and unit structs, this generates a scalar layout: the value
/// is always stored as one JSON fragment.
///
/// # Field Attributes
///
/// - `#[kv(key = "...")]` - Routing key. Without `/` the field stays inline;
///   `"/abs/key"` routes to an absolute key; `"rel/key"` routes below the
///   parent's key. A trailing `/` makes it a directory key, exploding maps
///   and sequences into one entry per element.
/// - `#[kv(shape = "map" | "sequence" | "record" | "scalar")]` - Overrides the
///   shape inferred from the field type.
///
/// # Container Attributes
///
/// - `#[kv(crate = "...")]` - Path of the core crate in generated code. By
///   default it is `kvconf::core` for crates depending on `kvconf`, and
///   `kvconf_core` otherwise.
///
/// Serde's `rename`, `rename_all`, `skip` and `skip_serializing` are honoured
/// so names match the serialized form. `flatten` is not supported.
#[proc_macro_derive(KvLayout, attributes(kv))]
pub fn derive_kv_layout(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match layout::derive_kv_layout(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}
