use crate::error::{AppError, Result};
use crate::observability::mask_sensitive;
use sha2::{Digest, Sha256};
use std::fmt;
use tonic::metadata::MetadataMap;

/// Primary idempotency header.
pub const KEY_HEADER: &str = "Idempotency-Key";
/// Alias accepted when the primary header is absent or blank.
pub const X_KEY_HEADER: &str = "X-Idempotency-Key";

// Metadata keys are stored lowercased.
pub(crate) const KEY_METADATA: &str = "idempotency-key";
pub(crate) const X_KEY_METADATA: &str = "x-idempotency-key";

/// Default upper bound on key length, in code points.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 255;

/// Client-supplied token identifying one logical operation across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Builds a key, rejecting values that are blank once whitespace is trimmed.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().chars().count() == 0 {
            return Err(AppError::MissingKey);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the key, used where backends need bounded key lengths.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Form of the key that is safe to write to logs.
    pub fn masked(&self) -> String {
        mask_sensitive(&self.0, 3)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pulls the idempotency key out of incoming call metadata.
#[derive(Debug, Clone)]
pub struct KeyExtractor {
    max_length: usize,
}

impl Default for KeyExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_KEY_LENGTH)
    }
}

impl KeyExtractor {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Returns the primary header's value when usable, else the alias's.
    pub fn extract(&self, metadata: &MetadataMap) -> Result<IdempotencyKey> {
        let value = header_value(metadata, KEY_METADATA)
            .or_else(|| header_value(metadata, X_KEY_METADATA))
            .ok_or(AppError::MissingKey)?;

        let length = value.chars().count();
        if length > self.max_length {
            return Err(AppError::InvalidKey(format!(
                "key is {} characters long, limit is {}",
                length, self.max_length
            )));
        }

        IdempotencyKey::new(value)
    }
}

fn header_value(metadata: &MetadataMap, name: &str) -> Option<String> {
    let raw = metadata.get(name)?;
    let value = std::str::from_utf8(raw.as_encoded_bytes()).ok()?;
    if value.trim().chars().count() == 0 {
        return None;
    }
    Some(value.to_string())
}
