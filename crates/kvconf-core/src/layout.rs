//! Structural description of configuration types.
//!
//! The codec never inspects Rust types directly. Instead each configuration
//! type describes itself through [`KvLayout`]: its overall [`Shape`] and, for
//! records, the serialized name, routing key and shape of every field. Values
//! themselves travel through the codec as `serde_json::Value`.
//!
//! Records normally get their layout from `#[derive(KvLayout)]`:
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize, Clone, KvLayout)]
//! pub struct ServiceConfig {
//!     pub addr: String,
//!     #[kv(key = "data_source/")]
//!     pub data_source: HashMap<String, String>,
//!     #[kv(key = "/services/test/a")]
//!     pub services: Vec<Service>,
//! }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Shape of a value in the flat key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Named fields, each with its own routing.
    Record,
    /// String-keyed map; explodes into one entry per key under a directory key.
    Map,
    /// Ordered sequence; explodes into one entry per index under a directory key.
    Sequence,
    /// Anything stored as a single JSON value.
    Scalar,
}

impl Shape {
    /// Returns the shape name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Map => "map",
            Self::Sequence => "sequence",
            Self::Scalar => "scalar",
        }
    }
}

/// Layout of a single record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    /// Serialized field name.
    pub name: String,
    /// Routing key, if the field carries one.
    pub key: Option<String>,
    /// Declared shape of the field type.
    pub shape: Shape,
}

impl FieldLayout {
    /// Creates a field layout.
    pub fn new(name: impl Into<String>, key: Option<&str>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            key: key.map(str::to_string),
            shape,
        }
    }

    /// Returns the routing key when the field is routed out of its parent.
    ///
    /// Keys without any `/` keep the field inline.
    pub fn routed_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|k| k.contains('/'))
    }

    /// Resolves the full key of a routed field below `root_dir`.
    pub fn resolve_key(&self, root_dir: &str) -> Option<String> {
        self.routed_key().map(|k| {
            if k.starts_with('/') {
                k.to_string()
            } else {
                format!("{root_dir}{k}")
            }
        })
    }
}

/// Layout of a whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Top-level shape.
    pub shape: Shape,
    /// Field layouts, in declaration order. Empty unless `shape` is `Record`.
    pub fields: Vec<FieldLayout>,
}

impl Layout {
    /// Layout of a record with the given fields.
    pub fn record(fields: Vec<FieldLayout>) -> Self {
        Self {
            shape: Shape::Record,
            fields,
        }
    }

    /// Layout of a string-keyed map.
    pub fn map() -> Self {
        Self {
            shape: Shape::Map,
            fields: Vec::new(),
        }
    }

    /// Layout of a sequence.
    pub fn sequence() -> Self {
        Self {
            shape: Shape::Sequence,
            fields: Vec::new(),
        }
    }

    /// Layout of a scalar.
    pub fn scalar() -> Self {
        Self {
            shape: Shape::Scalar,
            fields: Vec::new(),
        }
    }
}

/// Types that can describe their structure to the codec.
pub trait KvLayout {
    /// Returns the layout of this value.
    ///
    /// Derived implementations ignore `self`; dynamic values such as
    /// `serde_json::Value` inspect it.
    fn kv_layout(&self) -> Layout;
}

/// Bound satisfied by every configuration object a store can manage.
pub trait Configuration:
    KvLayout + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

impl<T> Configuration for T where
    T: KvLayout + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

macro_rules! scalar_layout {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KvLayout for $ty {
                fn kv_layout(&self) -> Layout {
                    Layout::scalar()
                }
            }
        )*
    };
}

scalar_layout!(
    String, bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
);

impl<T> KvLayout for Vec<T> {
    fn kv_layout(&self) -> Layout {
        Layout::sequence()
    }
}

impl<T> KvLayout for VecDeque<T> {
    fn kv_layout(&self) -> Layout {
        Layout::sequence()
    }
}

impl<V, S> KvLayout for HashMap<String, V, S> {
    fn kv_layout(&self) -> Layout {
        Layout::map()
    }
}

impl<V> KvLayout for BTreeMap<String, V> {
    fn kv_layout(&self) -> Layout {
        Layout::map()
    }
}

impl<T: KvLayout> KvLayout for Option<T> {
    fn kv_layout(&self) -> Layout {
        match self {
            Some(inner) => inner.kv_layout(),
            None => Layout::scalar(),
        }
    }
}

impl<T: KvLayout + ?Sized> KvLayout for Box<T> {
    fn kv_layout(&self) -> Layout {
        (**self).kv_layout()
    }
}

impl<T: KvLayout + ?Sized> KvLayout for Arc<T> {
    fn kv_layout(&self) -> Layout {
        (**self).kv_layout()
    }
}

impl KvLayout for Value {
    fn kv_layout(&self) -> Layout {
        match self {
            Value::Object(_) | Value::Null => Layout::map(),
            Value::Array(_) => Layout::sequence(),
            _ => Layout::scalar(),
        }
    }
}
