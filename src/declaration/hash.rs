//! Declaration fingerprints.
//!
//! A deterministic SHA-256 over the resolved declarations. Maps are
//! ordered, so identical inputs always produce identical fingerprints.

use sha2::{Digest, Sha256};

use super::document::{Declarations, Resource};

/// Hasher for resolved declarations.
#[derive(Debug, Default)]
pub struct DeclarationHasher;

impl DeclarationHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Fingerprints the whole declaration set.
    #[must_use]
    pub fn hash_declarations(&self, declarations: &Declarations) -> String {
        let mut hasher = Sha256::new();

        for resource in &declarations.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        for output in &declarations.outputs {
            hasher.update(output.name.as_bytes());
            hasher.update(canonical(&output.value).as_bytes());
            hasher.update(if output.sensitive { [1u8] } else { [0u8] });
        }

        hex::encode(hasher.finalize())
    }

    /// Fingerprints a single resource.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource.address.as_bytes());
        hasher.update(canonical(&resource.attributes).as_bytes());
        for dep in &resource.depends_on {
            hasher.update(dep.as_bytes());
        }
        hasher.update(if resource.lifecycle.create_before_destroy {
            [1u8]
        } else {
            [0u8]
        });
        hex::encode(hasher.finalize())
    }
}

fn canonical<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{DeclarationLoader, Source};

    fn load(content: &str) -> Declarations {
        DeclarationLoader::new()
            .load_sources(&[Source {
                name: String::from("test.yaml"),
                content: content.to_string(),
            }])
            .expect("load")
    }

    #[test]
    fn test_hash_is_deterministic() {
        let doc = "resources:\n  - kind: bucket\n    name: a\n    attributes:\n      bucket_name: a\n      acl: private\n";
        let hasher = DeclarationHasher::new();
        assert_eq!(
            hasher.hash_declarations(&load(doc)),
            hasher.hash_declarations(&load(doc))
        );
    }

    #[test]
    fn test_attribute_order_does_not_matter() {
        let a = "resources:\n  - kind: bucket\n    name: a\n    attributes:\n      bucket_name: a\n      acl: private\n";
        let b = "resources:\n  - kind: bucket\n    name: a\n    attributes:\n      acl: private\n      bucket_name: a\n";
        let hasher = DeclarationHasher::new();
        assert_eq!(hasher.hash_declarations(&load(a)), hasher.hash_declarations(&load(b)));
    }

    #[test]
    fn test_change_alters_hash() {
        let a = "resources:\n  - kind: bucket\n    name: a\n    attributes:\n      acl: private\n";
        let b = "resources:\n  - kind: bucket\n    name: a\n    attributes:\n      acl: public-read\n";
        let hasher = DeclarationHasher::new();
        let hash = hasher.hash_declarations(&load(a));
        assert_ne!(hash, hasher.hash_declarations(&load(b)));
        assert_eq!(hash.len(), 64);
    }
}
