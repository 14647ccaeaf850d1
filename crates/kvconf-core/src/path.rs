//! Dotted/bracketed field paths over the JSON data model.
//!
//! A path such as `Services[0].Hooks` compiles to the segments
//! `["Services", "0", "Hooks"]` and is walked against a `serde_json::Value`:
//! objects are looked up by key, arrays by index. Records and maps are both
//! objects in the data model, so a segment addresses either.
//!
//! ```rust,ignore
//! let value = json!({"Services": [{"Name": "x"}]});
//! let path = FieldPath::compile("Services[0].Name");
//! assert_eq!(resolve(&value, &path)?, Some(&json!("x")));
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{PathError, PathResult};

/// A compiled field path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Compiles a path string into segments.
    ///
    /// Segments are separated by `.`; each may be followed by any number of
    /// `[index]` suffixes. The empty path addresses the whole value.
    pub fn compile(src: &str) -> Self {
        let mut segments = Vec::new();
        if src.is_empty() {
            return Self { segments };
        }

        let mut current = String::new();
        let mut chars = src.chars().peekable();
        // Set right after `]`, where a separator is optional.
        let mut after_bracket = false;

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !after_bracket {
                        segments.push(std::mem::take(&mut current));
                    }
                    after_bracket = false;
                }
                '[' => {
                    if !after_bracket {
                        segments.push(std::mem::take(&mut current));
                    }
                    let mut index = String::new();
                    for inner in chars.by_ref() {
                        if inner == ']' {
                            break;
                        }
                        index.push(inner);
                    }
                    segments.push(index);
                    after_bracket = true;
                }
                _ => {
                    after_bracket = false;
                    current.push(c);
                }
            }
        }

        if !current.is_empty() {
            segments.push(current);
        }
        Self { segments }
    }

    /// Returns the compiled segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns `true` if this path addresses the whole value.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl From<&str> for FieldPath {
    fn from(src: &str) -> Self {
        Self::compile(src)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) && i > 0 {
                write!(f, "[{segment}]")?;
            } else if i > 0 {
                write!(f, ".{segment}")?;
            } else {
                write!(f, "{segment}")?;
            }
        }
        Ok(())
    }
}

/// Walks `value` along `path`.
///
/// Returns `Ok(None)` when the path legitimately does not resolve: a missing
/// key, an index past the end of a sequence, or a `null` (absent optional)
/// that still has segments below it.
pub fn resolve<'a>(value: &'a Value, path: &FieldPath) -> PathResult<Option<&'a Value>> {
    let mut current = value;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => next,
                None => return Ok(None),
            },
            Value::Array(items) => {
                let index: usize = segment.parse().map_err(|_| PathError::NotAnIndex {
                    segment: segment.clone(),
                })?;
                match items.get(index) {
                    Some(next) => next,
                    None => return Ok(None),
                }
            }
            Value::Null => return Ok(None),
            other => {
                return Err(PathError::Unsupported {
                    segment: segment.clone(),
                    kind: kind_name(other),
                });
            }
        };
    }
    Ok(Some(current))
}

/// Compiles `path` and resolves it against `value`.
pub fn get_field_value<'a>(value: &'a Value, path: &str) -> PathResult<Option<&'a Value>> {
    resolve(value, &FieldPath::compile(path))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segments(src: &str) -> Vec<String> {
        FieldPath::compile(src).segments().to_vec()
    }

    #[test]
    fn test_compile_grammar() {
        assert!(segments("").is_empty());
        assert_eq!(segments("Addr"), vec!["Addr"]);
        assert_eq!(segments("DataSource.cache"), vec!["DataSource", "cache"]);
        assert_eq!(
            segments("Services[0].Hooks"),
            vec!["Services", "0", "Hooks"]
        );
        assert_eq!(segments("Matrix[1][2]"), vec!["Matrix", "1", "2"]);
        assert_eq!(segments("a[3][4].b.c"), vec!["a", "3", "4", "b", "c"]);
    }

    #[test]
    fn test_compile_unterminated_bracket() {
        assert_eq!(segments("Services[1"), vec!["Services", "1"]);
    }

    #[test]
    fn test_display_round_trips() {
        let path = FieldPath::compile("Services[0].Hooks");
        assert_eq!(path.to_string(), "Services[0].Hooks");
        assert_eq!(FieldPath::compile(&path.to_string()), path);
    }

    #[test]
    fn test_resolve_nested() {
        let value = json!({"Services": [{"Name": "x"}]});
        assert_eq!(
            get_field_value(&value, "Services[0].Name").unwrap(),
            Some(&json!("x"))
        );
        assert_eq!(get_field_value(&value, "").unwrap(), Some(&value));
    }

    #[test]
    fn test_resolve_out_of_range_is_absent() {
        let value = json!({"Services": [{"Name": "x"}]});
        assert_eq!(get_field_value(&value, "Services[5].Name").unwrap(), None);
    }

    #[test]
    fn test_resolve_missing_key_is_absent() {
        let value = json!({"DataSource": {"sql": "mysql://"}});
        assert_eq!(get_field_value(&value, "DataSource.cache").unwrap(), None);
        assert_eq!(get_field_value(&value, "Nope.deeper").unwrap(), None);
    }

    #[test]
    fn test_resolve_through_null() {
        let value = json!({"Tls": null});
        assert_eq!(get_field_value(&value, "Tls.cert").unwrap(), None);
        assert_eq!(get_field_value(&value, "Tls").unwrap(), Some(&Value::Null));
    }

    #[test]
    fn test_resolve_errors() {
        let value = json!({"Addr": ":9090", "Services": []});
        assert_eq!(
            get_field_value(&value, "Addr.port"),
            Err(PathError::Unsupported {
                segment: "port".into(),
                kind: "string",
            })
        );
        assert_eq!(
            get_field_value(&value, "Services.first"),
            Err(PathError::NotAnIndex {
                segment: "first".into(),
            })
        );
    }
}
