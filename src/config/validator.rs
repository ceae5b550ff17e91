//! Validation of settings and declarations.
//!
//! Settings are checked with the `validator` derive rules plus cross-field
//! rules. Declarations are checked against the resource catalog: known
//! kinds, required attributes present, no computed attributes configured,
//! and every referenced attribute known on its target kind.

use crate::declaration::{Declarations, Expr, Resource};
use crate::error::{ConfigError, DeclarationError, Result, StackformError};
use crate::provider::schema_for;
use serde_json::Value;
use tracing::debug;
use validator::Validate;

use super::spec::{Settings, StateBackend};

/// Validator for settings and declarations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path or resource address that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates settings.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn validate_settings(&self, settings: &Settings) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        if let Err(errors) = settings.validate() {
            for (field, message) in flatten_errors(&errors) {
                result.errors.push(ValidationError { field, message });
            }
        }

        if !is_valid_name(&settings.project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    settings.project.name
                ),
            });
        }

        if settings.state.backend == StateBackend::S3
            && settings.state.bucket.as_deref().is_none_or(str::is_empty)
        {
            result.errors.push(ValidationError {
                field: String::from("state.bucket"),
                message: String::from("S3 bucket name is required when using S3 backend"),
            });
        }

        if settings.state.backend == StateBackend::Local && settings.state.bucket.is_some() {
            result
                .warnings
                .push(String::from("state.bucket is ignored by the local backend"));
        }

        if result.errors.is_empty() {
            debug!("Settings validation passed");
            Ok(result)
        } else {
            let first = &result.errors[0];
            Err(StackformError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }))
        }
    }

    /// Validates declarations against the resource catalog.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn validate_declarations(&self, declarations: &Declarations) -> Result<ValidationResult> {
        let result = self.check_declarations(declarations);

        if result.errors.is_empty() {
            debug!(
                "Declaration validation passed ({} resources)",
                declarations.resources.len()
            );
            Ok(result)
        } else {
            let first = &result.errors[0];
            Err(StackformError::Declaration(DeclarationError::InvalidResource {
                address: first.field.clone(),
                message: first.message.clone(),
            }))
        }
    }

    /// Collects every declaration problem without failing.
    #[must_use]
    pub fn check_declarations(&self, declarations: &Declarations) -> ValidationResult {
        let mut result = ValidationResult::default();

        if declarations.is_empty() {
            result.warnings.push(String::from("No resources declared"));
        }

        for resource in &declarations.resources {
            Self::validate_resource(resource, declarations, &mut result);
        }
        Self::check_dual_exposure(declarations, &mut result);

        result
    }

    fn validate_resource(resource: &Resource, declarations: &Declarations, result: &mut ValidationResult) {
        let Some(schema) = schema_for(&resource.kind) else {
            result.errors.push(ValidationError {
                field: resource.address.clone(),
                message: format!("Unknown resource kind '{}'", resource.kind),
            });
            return;
        };

        for required in schema.required {
            if !resource.attributes.contains_key(*required) {
                result.errors.push(ValidationError {
                    field: resource.address.clone(),
                    message: format!("Missing required attribute '{required}'"),
                });
            }
        }

        for name in resource.attributes.keys() {
            if schema.is_computed(name) && !schema.is_configurable(name) {
                result.errors.push(ValidationError {
                    field: format!("{}.{name}", resource.address),
                    message: format!("'{name}' is computed by the provider and cannot be set"),
                });
            } else if !schema.is_configurable(name) {
                result.errors.push(ValidationError {
                    field: format!("{}.{name}", resource.address),
                    message: format!("Unknown attribute '{name}' for kind '{}'", resource.kind),
                });
            }
        }

        for (name, expr) in &resource.attributes {
            for reference in expr.attribute_refs() {
                let Some(target) = declarations.get(&reference.address()) else {
                    continue;
                };
                let known = schema_for(&target.kind).is_some_and(|s| s.is_known(&reference.attribute));
                if !known {
                    result.errors.push(ValidationError {
                        field: format!("{}.{name}", resource.address),
                        message: format!(
                            "Reference to unknown attribute '{reference}' ({} has no '{}')",
                            target.kind, reference.attribute
                        ),
                    });
                }
            }
        }
    }

    /// Warns when a public-read bucket also sits behind a distribution.
    fn check_dual_exposure(declarations: &Declarations, result: &mut ValidationResult) {
        for distribution in declarations.resources.iter().filter(|r| r.kind == "distribution") {
            let Some(origin) = distribution.attributes.get("origin_domain") else {
                continue;
            };
            for reference in origin.attribute_refs() {
                let Some(bucket) = declarations.get(&reference.address()) else {
                    continue;
                };
                let public = bucket.kind == "bucket"
                    && matches!(
                        bucket.attributes.get("acl"),
                        Some(Expr::Literal(Value::String(acl))) if acl == "public-read"
                    );
                if public {
                    result.warnings.push(format!(
                        "{} is public-read and also the origin of {}; content is reachable both directly and through the distribution",
                        bucket.address, distribution.address
                    ));
                }
            }
        }
    }
}

fn flatten_errors(errors: &validator::ValidationErrors) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into("", errors, &mut out);
    out.sort();
    out
}

fn flatten_into(prefix: &str, errors: &validator::ValidationErrors, out: &mut Vec<(String, String)>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            validator::ValidationErrorsKind::Field(list) => {
                for error in list {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| format!("failed '{}' check", error.code), ToString::to_string);
                    out.push((path.clone(), format!("{path}: {message}")));
                }
            }
            validator::ValidationErrorsKind::Struct(inner) => flatten_into(&path, inner, out),
            validator::ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    flatten_into(&format!("{path}[{index}]"), inner, out);
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
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
            .expect("declarations should load")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("static-site"));
        assert!(is_valid_name("site-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Site")); // uppercase
        assert!(!is_valid_name("123-site")); // starts with number
        assert!(!is_valid_name("static_site")); // underscore
        assert!(!is_valid_name("site-")); // ends with hyphen
        assert!(!is_valid_name("static--site")); // consecutive hyphens
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let mut settings = Settings::new("site", "dev");
        settings.state.backend = StateBackend::S3;

        let result = ConfigValidator::new().validate_settings(&settings);
        assert!(matches!(
            result,
            Err(StackformError::Config(ConfigError::ValidationError { field: Some(ref f), .. })) if f == "state.bucket"
        ));
    }

    #[test]
    fn test_out_of_range_parallelism_names_field() {
        let mut settings = Settings::new("site", "dev");
        settings.apply.parallelism = 100;

        let result = ConfigValidator::new().validate_settings(&settings);
        assert!(matches!(
            result,
            Err(StackformError::Config(ConfigError::ValidationError { field: Some(ref f), .. })) if f == "apply.parallelism"
        ));
    }

    #[test]
    fn test_unknown_kind_and_missing_required() {
        let declarations = load(
            "resources:\n  - kind: mainframe\n    name: m\n  - kind: bucket\n    name: b\n    attributes:\n      acl: private\n",
        );
        let result = ConfigValidator::new().check_declarations(&declarations);
        assert_eq!(result.error_count(), 2);
        assert!(result.errors[0].message.contains("mainframe"));
        assert!(result.errors[1].message.contains("bucket_name"));
    }

    #[test]
    fn test_computed_attribute_cannot_be_set() {
        let declarations =
            load("resources:\n  - kind: bucket\n    name: b\n    attributes:\n      bucket_name: b\n      arn: x\n");
        let result = ConfigValidator::new().validate_declarations(&declarations);
        assert!(matches!(
            result,
            Err(StackformError::Declaration(DeclarationError::InvalidResource { ref address, .. })) if address == "bucket.b.arn"
        ));
    }

    #[test]
    fn test_reference_to_unknown_attribute() {
        let declarations = load(
            "resources:\n  - kind: bucket\n    name: b\n    attributes:\n      bucket_name: b\n  - kind: bucket_policy\n    name: p\n    attributes:\n      bucket: ${bucket.b.colour}\n      policy: '{}'\n",
        );
        let result = ConfigValidator::new().check_declarations(&declarations);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("bucket.b.colour"));
    }

    #[test]
    fn test_dual_exposure_warns() {
        let declarations = load(
            "resources:\n  - kind: bucket\n    name: site\n    attributes:\n      bucket_name: site\n      acl: public-read\n  - kind: distribution\n    name: cdn\n    attributes:\n      origin_domain: ${bucket.site.domain_name}\n",
        );
        let result = ConfigValidator::new()
            .validate_declarations(&declarations)
            .expect("warnings are not errors");
        assert_eq!(result.warning_count(), 1);
        assert!(result.warnings[0].contains("bucket.site"));
    }
}
