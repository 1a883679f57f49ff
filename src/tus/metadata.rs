//! `Upload-Metadata` header codec
//!
//! The header is a comma-separated list of `key base64value` pairs. Keys are
//! unique and contain neither spaces nor commas; the value may be omitted.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::types::TusError;

/// Client metadata attached to an upload at creation.
///
/// Serializes as the header form so registry records stay readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadMetadata(BTreeMap<String, Option<Vec<u8>>>);

impl UploadMetadata {
    /// Parse an `Upload-Metadata` header value
    pub fn parse(header: &str) -> Result<Self, TusError> {
        let mut entries = BTreeMap::new();

        for pair in header.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let mut parts = pair.split(' ').filter(|p| !p.is_empty());
            let key = parts
                .next()
                .ok_or_else(|| TusError::BadRequest("empty metadata pair".to_string()))?;

            let value = match parts.next() {
                Some(encoded) => Some(STANDARD.decode(encoded).map_err(|e| {
                    TusError::BadRequest(format!("metadata value for {key} is not base64: {e}"))
                })?),
                None => None,
            };

            if parts.next().is_some() {
                return Err(TusError::BadRequest(format!(
                    "metadata pair for {key} has too many parts"
                )));
            }

            if entries.insert(key.to_string(), value).is_some() {
                return Err(TusError::BadRequest(format!("duplicate metadata key: {key}")));
            }
        }

        Ok(Self(entries))
    }

    /// Render back to header form, keys in sorted order
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| match value {
                Some(bytes) => format!("{} {}", key, STANDARD.encode(bytes)),
                None => key.clone(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Raw value for a key. `Some(&[])` for keys sent without a value.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0
            .get(key)
            .map(|value| value.as_deref().unwrap_or_default())
    }

    /// Value for a key, if present and valid UTF-8
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<Vec<u8>>) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl TryFrom<String> for UploadMetadata {
    type Error = TusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UploadMetadata> for String {
    fn from(metadata: UploadMetadata) -> Self {
        metadata.encode()
    }
}
