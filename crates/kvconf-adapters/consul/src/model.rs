//! Consul KV API payloads.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kvconf_core::{BackendError, BackendResult, Kv};
use serde::Deserialize;

/// One entry of a `GET /v1/kv/<key>` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    /// Key without a leading `/`.
    pub key: String,
    /// Base64 encoded value; `null` for folder entries.
    #[serde(default)]
    pub value: Option<String>,
    /// Raft index of the last modification.
    #[serde(default)]
    pub modify_index: u64,
    /// Opaque user flags.
    #[serde(default)]
    pub flags: u64,
}

impl KvPair {
    /// Converts to a codec entry, re-rooting the key at `/`.
    ///
    /// Folder entries carry no value and yield `None`.
    pub fn into_kv(self) -> BackendResult<Option<Kv>> {
        let Some(encoded) = self.value else {
            return Ok(None);
        };
        let raw = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| BackendError::decode(self.key.as_str(), e))?;
        let value = String::from_utf8(raw).map_err(|e| BackendError::decode(self.key.as_str(), e))?;
        Ok(Some(Kv::new(to_codec_key(&self.key), value)))
    }
}

/// Consul keys have no leading `/`; codec keys always do.
pub fn to_codec_key(key: &str) -> String {
    format!("/{}", key.trim_start_matches('/'))
}

/// Strips the leading `/` of a codec key.
pub fn to_consul_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

/// Decodes a response body into entries.
pub fn decode_pairs(body: &[u8]) -> BackendResult<Vec<Kv>> {
    let pairs: Vec<KvPair> =
        serde_json::from_slice(body).map_err(|e| BackendError::decode("consul response", e))?;
    let mut kvs = Vec::with_capacity(pairs.len());
    for pair in pairs {
        if let Some(kv) = pair.into_kv()? {
            kvs.push(kv);
        }
    }
    Ok(kvs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pairs() {
        let body = br#"[
            {"Key": "app/config/data_source/", "Value": null, "ModifyIndex": 10, "Flags": 0},
            {"Key": "app/config/data_source/cache", "Value": "InJlZGlzQSI=", "ModifyIndex": 12, "Flags": 0, "LockIndex": 0, "CreateIndex": 12}
        ]"#;
        let kvs = decode_pairs(body).unwrap();
        assert_eq!(
            kvs,
            vec![Kv::new("/app/config/data_source/cache", r#""redisA""#)]
        );
    }

    #[test]
    fn test_bad_base64() {
        let body = br#"[{"Key": "a", "Value": "!!!"}]"#;
        assert!(matches!(
            decode_pairs(body),
            Err(BackendError::Decode { .. })
        ));
    }

    #[test]
    fn test_key_conversion() {
        assert_eq!(to_codec_key("app/config"), "/app/config");
        assert_eq!(to_codec_key("/app/config"), "/app/config");
        assert_eq!(to_consul_key("/app/config/"), "app/config/");
    }
}
