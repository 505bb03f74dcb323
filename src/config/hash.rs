//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of the desired resources. The
//! hash is recorded in every plan so an apply can tell which configuration a
//! plan was computed from.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash over resources keyed by `<group>.<name>`.
    ///
    /// Object keys are serialized in sorted order, so the hash does not
    /// depend on the order fields were written in.
    #[must_use]
    pub fn hash_resources(&self, resources: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in resources {
            hasher.update(self.hash_resource(key, value).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource.
    #[must_use]
    pub fn hash_resource(&self, key: &str, value: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let value = json!({"name": "nightly", "tasks": [1, 2]});
        assert_eq!(
            hasher.hash_resource("jobs.foo", &value),
            hasher.hash_resource("jobs.foo", &value)
        );
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let hasher = ConfigHasher::new();
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(hasher.hash_resource("k", &a), hasher.hash_resource("k", &b));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = ConfigHasher::new();
        let value = json!({"name": "x"});
        assert_ne!(
            hasher.hash_resource("jobs.a", &value),
            hasher.hash_resource("jobs.b", &value)
        );
    }

    #[test]
    fn test_resources_hash_tracks_every_resource() {
        let hasher = ConfigHasher::new();
        let mut resources = BTreeMap::new();
        resources.insert(String::from("jobs.a"), json!({"name": "a"}));
        let one = hasher.hash_resources(&resources);

        resources.insert(String::from("jobs.b"), json!({"name": "b"}));
        assert_ne!(hasher.hash_resources(&resources), one);
        assert_ne!(hasher.hash_resources(&BTreeMap::new()), one);
    }
}
