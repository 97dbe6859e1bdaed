//! Asset metadata document served next to the asset payload.

use std::collections::HashMap;

use serde_json::Value;

/// SHA-1 digests are 20 bytes; longer arrays are truncated.
const SHA1_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata root must be an object")]
    NotAnObject,
}

/// Parsed metadata. Members of the wrong JSON type are ignored and left at their default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Kept as served; the format is server-defined.
    pub creation_date: String,
    pub content_type: String,
    pub sha1: Vec<u8>,
    pub temporary: bool,
    /// Access method name → URI.
    pub methods: HashMap<String, String>,
}

impl AssetMetadata {
    pub fn from_json(text: &str) -> Result<Self, MetadataError> {
        let root: Value = serde_json::from_str(text)?;
        let obj = root.as_object().ok_or(MetadataError::NotAnObject)?;
        let text_of = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };

        let sha1 = obj
            .get("sha1")
            .and_then(Value::as_array)
            .map(|bytes| {
                bytes
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|b| u8::try_from(b).ok())
                    .take(SHA1_LEN)
                    .collect()
            })
            .unwrap_or_default();

        let methods = obj
            .get("methods")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|uri| (k.clone(), uri.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id: text_of("id"),
            name: text_of("name"),
            description: text_of("description"),
            creation_date: text_of("creation_date"),
            content_type: text_of("type"),
            sha1,
            temporary: obj.get("temporary").and_then(Value::as_bool).unwrap_or(false),
            methods,
        })
    }

    /// Lowercase hex of the digest.
    pub fn sha1_hex(&self) -> String {
        self.sha1.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
