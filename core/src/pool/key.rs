use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PoolError;

/// Identity of a pooled resource, derived deterministically from request parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

impl From<&str> for PoolKey {
    fn from(key: &str) -> Self { Self(key.to_owned()) }
}

impl From<String> for PoolKey {
    fn from(key: String) -> Self { Self(key) }
}

/// Hash the canonical json form of `params` into a key.
///
/// Objects are serialized with sorted keys, so two structurally equal parameter sets map to
/// the same key regardless of field order.
pub fn hash_json_key(params: &impl Serialize) -> Result<PoolKey, PoolError> {
    // `Value` keeps object keys in a sorted map
    let canonical = serde_json::to_vec(&serde_json::to_value(params)?)?;
    let digest = Sha256::digest(&canonical);
    Ok(PoolKey(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)))
}
