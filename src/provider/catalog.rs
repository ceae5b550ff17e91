//! Resource catalog.
//!
//! Per kind: which attributes are required, which force a replacement when
//! they change, which can be updated in place, and which the provider
//! computes.

/// Schema for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSchema {
    /// Kind name as used in addresses.
    pub kind: &'static str,
    /// Attributes that must be configured.
    pub required: &'static [&'static str],
    /// Attributes whose change requires a new instance.
    pub force_new: &'static [&'static str],
    /// Attributes that can change in place.
    pub updatable: &'static [&'static str],
    /// Attributes reported by the provider.
    pub computed: &'static [&'static str],
}

/// Every supported kind.
pub const CATALOG: &[KindSchema] = &[
    KindSchema {
        kind: "bucket",
        required: &["bucket_name"],
        force_new: &["bucket_name", "region"],
        updatable: &["acl", "website_index", "website_error", "versioning", "tags"],
        computed: &["id", "arn", "domain_name", "website_endpoint"],
    },
    KindSchema {
        kind: "bucket_object",
        required: &["bucket", "key"],
        force_new: &["bucket", "key"],
        updatable: &["content", "content_type", "acl", "cache_control"],
        computed: &["id", "etag", "url"],
    },
    KindSchema {
        kind: "bucket_policy",
        required: &["bucket", "policy"],
        force_new: &["bucket"],
        updatable: &["policy"],
        computed: &["id"],
    },
    KindSchema {
        kind: "distribution",
        required: &["origin_domain"],
        force_new: &["origin_id"],
        updatable: &[
            "origin_domain",
            "default_root_object",
            "enabled",
            "price_class",
            "aliases",
            "viewer_protocol_policy",
            "comment",
        ],
        computed: &["id", "arn", "domain_name", "status"],
    },
    KindSchema {
        kind: "network",
        required: &["cidr_block"],
        force_new: &["cidr_block"],
        updatable: &["dns_support", "tags"],
        computed: &["id", "arn", "default_security_group"],
    },
    KindSchema {
        kind: "subnet",
        required: &["network_id", "cidr_block"],
        force_new: &["network_id", "cidr_block", "availability_zone"],
        updatable: &["public_ip_on_launch", "tags"],
        computed: &["id", "arn"],
    },
    KindSchema {
        kind: "launch_template",
        required: &["image_id", "instance_type"],
        force_new: &["template_name"],
        updatable: &["image_id", "instance_type", "user_data", "security_groups", "tags"],
        computed: &["id", "latest_version"],
    },
    KindSchema {
        kind: "load_balancer",
        required: &["subnet_ids"],
        force_new: &["lb_name", "internal"],
        updatable: &[
            "subnet_ids",
            "security_groups",
            "listener_port",
            "health_check_path",
            "tags",
        ],
        computed: &["id", "arn", "dns_name"],
    },
    KindSchema {
        kind: "scaling_group",
        required: &["launch_template_id", "subnet_ids", "min_size", "max_size"],
        force_new: &["group_name"],
        updatable: &[
            "launch_template_id",
            "launch_template_version",
            "subnet_ids",
            "min_size",
            "max_size",
            "desired_capacity",
            "load_balancer_ids",
            "tags",
        ],
        computed: &["id", "arn"],
    },
];

/// Computed attributes that the provider recomputes on every update.
const VOLATILE_COMPUTED: &[&str] = &["etag", "status", "latest_version"];

/// Looks up the schema for a kind.
#[must_use]
pub fn schema_for(kind: &str) -> Option<&'static KindSchema> {
    CATALOG.iter().find(|s| s.kind == kind)
}

impl KindSchema {
    /// Returns true if the attribute can be changed in place.
    #[must_use]
    pub fn is_updatable(&self, attribute: &str) -> bool {
        self.updatable.contains(&attribute)
    }

    /// Returns true if changing the attribute requires a new instance.
    ///
    /// Attributes the catalog does not list are treated as force-new.
    #[must_use]
    pub fn forces_replacement(&self, attribute: &str) -> bool {
        !self.is_updatable(attribute)
    }

    /// Returns true if the provider computes the attribute.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        self.computed.contains(&attribute)
    }

    /// Returns true if the attribute may appear in a declaration.
    #[must_use]
    pub fn is_configurable(&self, attribute: &str) -> bool {
        self.force_new.contains(&attribute)
            || self.updatable.contains(&attribute)
            || self.required.contains(&attribute)
    }

    /// Returns true if the attribute may be referenced.
    #[must_use]
    pub fn is_known(&self, attribute: &str) -> bool {
        self.is_configurable(attribute) || self.is_computed(attribute)
    }

    /// Returns true if a computed attribute may change on an in-place update.
    #[must_use]
    pub fn may_change_on_update(&self, attribute: &str) -> bool {
        self.is_computed(attribute) && VOLATILE_COMPUTED.contains(&attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_required_attribute_is_configurable() {
        for schema in CATALOG {
            for attr in schema.required {
                assert!(
                    schema.is_configurable(attr) && (schema.force_new.contains(attr) || schema.updatable.contains(attr)),
                    "{}.{attr} is required but neither force_new nor updatable",
                    schema.kind
                );
            }
            assert!(schema.is_computed("id"), "{} lacks a computed id", schema.kind);
        }
    }

    #[test]
    fn test_lookup_and_classification() {
        let bucket = schema_for("bucket").expect("bucket schema");
        assert!(bucket.forces_replacement("bucket_name"));
        assert!(bucket.is_updatable("acl"));
        assert!(bucket.is_known("domain_name"));
        assert!(!bucket.is_configurable("domain_name"));
        assert!(!bucket.may_change_on_update("id"));
        assert!(!bucket.may_change_on_update("domain_name"));
        let object = schema_for("bucket_object").expect("object schema");
        assert!(object.may_change_on_update("etag"));
        assert!(schema_for("mainframe").is_none());
    }
}
