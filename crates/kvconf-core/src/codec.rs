//! Conversion between configuration objects and flat key/value entries.
//!
//! A configuration object is laid out over a flat key space according to the
//! routing keys of its fields (see [`FieldLayout`]):
//!
//! | routing key | stored at |
//! |-------------|-----------|
//! | none, or no `/` | inline: JSON member of the object stored at the root key |
//! | `/abs/key` | the absolute key, independent of the root |
//! | `rel/key` | `root_dir + "rel/key"` |
//!
//! A key ending in `/` is a *directory key*. Maps and sequences routed to a
//! directory key explode into one entry per map key or index. When the root
//! key itself is a directory, inline fields explode into one entry each at
//! `root + name` instead of being merged into a single object.
//!
//! # Sequence ordering
//!
//! Exploded sequences are reassembled by sorting entries lexicographically by
//! key. Indices are written without padding, so `"10"` sorts before `"2"`:
//! order is only preserved for sequences of at most ten elements. This matches
//! the layout existing stores already hold and is kept as is.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CodecError, CodecResult};
use crate::layout::{KvLayout, Layout, Shape};

/// A single flat key/value entry. `value` holds a JSON fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Kv {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl Kv {
    /// Creates an entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Sorts entries lexicographically by key.
pub fn sort_kvs(kvs: &mut [Kv]) {
    kvs.sort_by(|a, b| a.key.cmp(&b.key));
}

fn is_dir(key: &str) -> bool {
    key.ends_with('/')
}

fn dir_of(key: &str) -> String {
    if is_dir(key) {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

fn simple(key: impl Into<String>, value: &Value) -> CodecResult<Vec<Kv>> {
    Ok(vec![Kv::new(key, serde_json::to_string(value)?)])
}

fn explode(key: &str, shape: Shape, value: &Value) -> CodecResult<Vec<Kv>> {
    match (shape, value) {
        (Shape::Map, Value::Object(map)) => map
            .iter()
            .map(|(k, v)| Ok(Kv::new(format!("{key}{k}"), serde_json::to_string(v)?)))
            .collect(),
        (Shape::Sequence, Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| Ok(Kv::new(format!("{key}{i}"), serde_json::to_string(v)?)))
            .collect(),
        (Shape::Map | Shape::Sequence, Value::Null) => Ok(Vec::new()),
        _ => simple(key, value),
    }
}

/// Lays a routed field out at `key`.
fn marshal_routed(key: &str, shape: Shape, value: &Value) -> CodecResult<Vec<Kv>> {
    if is_dir(key) {
        explode(key, shape, value)
    } else {
        simple(key, value)
    }
}

/// Converts `target` into flat entries rooted at `key`.
///
/// Records with a non-directory root produce the inline object first, then
/// every routed field in declaration order.
pub fn marshal<T>(key: &str, target: &T) -> CodecResult<Vec<Kv>>
where
    T: KvLayout + Serialize + ?Sized,
{
    let layout = target.kv_layout();
    let value = serde_json::to_value(target)?;
    marshal_value(key, &layout, &value)
}

/// Converts an already-serialized value laid out as `layout`.
pub fn marshal_value(key: &str, layout: &Layout, value: &Value) -> CodecResult<Vec<Kv>> {
    let root_is_dir = is_dir(key);
    match (layout.shape, value) {
        (Shape::Record, Value::Object(object)) => {
            let root_dir = dir_of(key);
            let mut inline = Map::new();
            let mut kvs = Vec::new();
            for field in &layout.fields {
                // Fields serde chose not to serialize produce nothing.
                let Some(data) = object.get(&field.name) else {
                    continue;
                };
                if let Some(field_key) = field.resolve_key(&root_dir) {
                    kvs.extend(marshal_routed(&field_key, field.shape, data)?);
                } else if root_is_dir {
                    kvs.extend(simple(format!("{key}{}", field.name), data)?);
                } else {
                    inline.insert(field.name.clone(), data.clone());
                }
            }
            if !inline.is_empty() {
                kvs.insert(0, Kv::new(key, serde_json::to_string(&inline)?));
            }
            Ok(kvs)
        }
        (Shape::Map | Shape::Sequence, _) if root_is_dir => explode(key, layout.shape, value),
        _ => simple(key, value),
    }
}

/// A key known to the layout and the field it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyKind {
    /// Serialized field name; empty for the root key itself.
    pub field: String,
    pub shape: Shape,
}

/// Maps every key a layout reads from to the field it feeds.
pub(crate) fn keys_kind(key: &str, layout: &Layout) -> BTreeMap<String, KeyKind> {
    let mut keys = BTreeMap::new();
    keys.insert(
        key.to_string(),
        KeyKind {
            field: String::new(),
            shape: layout.shape,
        },
    );
    if layout.shape == Shape::Record {
        let root_dir = dir_of(key);
        for field in &layout.fields {
            if let Some(field_key) = field.resolve_key(&root_dir) {
                keys.insert(
                    field_key,
                    KeyKind {
                        field: field.name.clone(),
                        shape: field.shape,
                    },
                );
            }
        }
    }
    keys
}

/// Lists the keys that must be read or watched to materialize `target`.
///
/// The root key comes first. For a directory root, routed keys inside the
/// root's subtree are covered by reading the root itself and are omitted.
pub fn prefix_keys<T>(key: &str, target: &T) -> Vec<String>
where
    T: KvLayout + ?Sized,
{
    let keys = keys_kind(key, &target.kv_layout());
    let mut ret = vec![key.to_string()];
    ret.extend(
        keys.into_keys()
            .filter(|k| k != key && !(is_dir(key) && k.starts_with(key))),
    );
    ret
}

/// Parses a stored value, treating anything that is not JSON as a raw string.
fn parse_entry(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Entries collected for one exploded child.
struct Bucket<'a> {
    field: String,
    shape: Shape,
    kvs: Vec<&'a Kv>,
}

/// Joins exploded child entries back into a single value.
fn join_children(shape: Shape, mut kvs: Vec<&Kv>) -> Value {
    match shape {
        Shape::Map | Shape::Record => {
            let mut object = Map::new();
            for kv in kvs {
                let child = kv.key.rsplit('/').next().unwrap_or_default();
                object.insert(child.to_string(), parse_entry(&kv.value));
            }
            Value::Object(object)
        }
        Shape::Sequence => {
            kvs.sort_by(|a, b| a.key.cmp(&b.key));
            Value::Array(kvs.into_iter().map(|kv| parse_entry(&kv.value)).collect())
        }
        Shape::Scalar => Value::Object(Map::new()),
    }
}

fn add_to_bucket<'a>(
    buckets: &mut BTreeMap<String, Bucket<'a>>,
    dir: &str,
    kind: &KeyKind,
    kv: &'a Kv,
) {
    buckets
        .entry(dir.to_string())
        .or_insert_with(|| Bucket {
            field: kind.field.clone(),
            shape: kind.shape,
            kvs: Vec::new(),
        })
        .kvs
        .push(kv);
}

fn record_document(key: &str, layout: &Layout, kvs: &[Kv]) -> CodecResult<Value> {
    let root_dir = dir_of(key);
    let keys = keys_kind(key, layout);
    let mut parts = Map::new();
    let mut buckets: BTreeMap<String, Bucket<'_>> = BTreeMap::new();
    let mut wholesale = Map::new();

    for kv in kvs {
        if kv.value.is_empty() {
            continue;
        }
        let value = parse_entry(&kv.value);

        if kv.key == key {
            match value {
                Value::Object(object) => parts.extend(object),
                _ => {
                    return Err(CodecError::RootNotObject {
                        key: key.to_string(),
                    });
                }
            }
            continue;
        }

        // A routed field's own key replaces that field wholesale.
        if let Some(kind) = keys.get(&kv.key) {
            wholesale.insert(kind.field.clone(), value);
            continue;
        }

        if !kv.key.contains('/') {
            parts.insert(kv.key.clone(), value);
            continue;
        }

        if let Some(rel) = kv.key.strip_prefix(&root_dir) {
            match rel.rfind('/') {
                None => {
                    parts.insert(rel.to_string(), value);
                }
                Some(index) => {
                    let child_dir = format!("{root_dir}{}", &rel[..=index]);
                    if let Some(kind) = keys.get(&child_dir) {
                        add_to_bucket(&mut buckets, &child_dir, kind, kv);
                    }
                }
            }
            continue;
        }

        if let Some(index) = kv.key.rfind('/') {
            let child_dir = &kv.key[..=index];
            if let Some(kind) = keys.get(child_dir) {
                add_to_bucket(&mut buckets, child_dir, kind, kv);
            }
        }
    }

    for bucket in buckets.into_values() {
        parts.insert(bucket.field, join_children(bucket.shape, bucket.kvs));
    }
    parts.extend(wholesale);

    // Empty collections routed to a directory are stored as no entries at all.
    for (dir, kind) in &keys {
        if kind.field.is_empty() || !is_dir(dir) || parts.contains_key(&kind.field) {
            continue;
        }
        if let Some(empty) = empty_collection(kind.shape) {
            parts.insert(kind.field.clone(), empty);
        }
    }
    Ok(Value::Object(parts))
}

fn empty_collection(shape: Shape) -> Option<Value> {
    match shape {
        Shape::Map | Shape::Record => Some(Value::Object(Map::new())),
        Shape::Sequence => Some(Value::Array(Vec::new())),
        Shape::Scalar => None,
    }
}

/// Children of a directory root that sit directly below it.
fn direct_children<'a>(key: &'a str, kvs: &'a [Kv]) -> impl Iterator<Item = (&'a str, &'a Kv)> {
    kvs.iter().filter_map(move |kv| {
        let rel = kv.key.strip_prefix(key).unwrap_or(&kv.key);
        (!rel.is_empty() && !rel.contains('/')).then_some((rel, kv))
    })
}

/// Reconstructs the JSON document described by `kvs` for a value laid out as
/// `layout` at `key`.
pub fn document(key: &str, layout: &Layout, kvs: &[Kv]) -> CodecResult<Value> {
    if kvs.is_empty() {
        return Err(CodecError::Empty);
    }
    match layout.shape {
        Shape::Record => record_document(key, layout, kvs),
        Shape::Map if is_dir(key) => Ok(Value::Object(
            direct_children(key, kvs)
                .map(|(child, kv)| (child.to_string(), parse_entry(&kv.value)))
                .collect(),
        )),
        Shape::Sequence if is_dir(key) => {
            let mut children: Vec<&Kv> = direct_children(key, kvs).map(|(_, kv)| kv).collect();
            children.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(Value::Array(
                children.into_iter().map(|kv| parse_entry(&kv.value)).collect(),
            ))
        }
        _ => {
            let entry = kvs.iter().find(|kv| kv.key == key).unwrap_or(&kvs[0]);
            Ok(parse_entry(&entry.value))
        }
    }
}

/// Decodes `kvs` into a fresh instance, using `template` only for its layout.
pub fn decode<T>(key: &str, kvs: &[Kv], template: &T) -> CodecResult<T>
where
    T: KvLayout + DeserializeOwned,
{
    let doc = document(key, &template.kv_layout(), kvs)?;
    Ok(T::deserialize(doc)?)
}

/// Decodes `kvs` into `target`.
///
/// The candidate is decoded into a fresh instance first; `target` is only
/// replaced on success.
pub fn unmarshal<T>(key: &str, kvs: &[Kv], target: &mut T) -> CodecResult<()>
where
    T: KvLayout + DeserializeOwned,
{
    *target = decode(key, kvs, target)?;
    Ok(())
}
