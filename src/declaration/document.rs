//! Declaration document types.
//!
//! Raw documents map one-to-one onto the YAML files users write. The loader
//! turns them into the resolved [`Declarations`] graph that the planner
//! consumes: variables substituted, references typed, order recorded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::expr::Expr;

/// A single declaration file as written by the user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclarationDocument {
    /// Input variables.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,
    /// Resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Named outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDecl>,
}

/// A declared input variable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableDecl {
    /// Expected type of the value.
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    /// Value used when nothing overrides it.
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Variable types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// A string.
    String,
    /// An integer or floating point number.
    Number,
    /// `true` or `false`.
    Bool,
    /// A sequence of values.
    List,
    /// A string-keyed map of values.
    Map,
    /// Any value.
    #[default]
    Any,
}

/// A declared resource, before resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    /// Catalog kind, e.g. `bucket`.
    pub kind: String,
    /// Name, unique within the kind.
    pub name: String,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: serde_yaml::Mapping,
    /// Explicit dependency addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle options.
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

/// Lifecycle options for a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lifecycle {
    /// Create the replacement before destroying the old instance.
    #[serde(default)]
    pub create_before_destroy: bool,
}

/// A declared output, before resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDecl {
    /// Expression to evaluate after apply.
    pub value: serde_yaml::Value,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Mask the value in listings.
    #[serde(default)]
    pub sensitive: bool,
}

/// A resolved resource.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    /// `kind.name`.
    pub address: String,
    /// Catalog kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Position in declaration order.
    #[serde(skip)]
    pub index: usize,
    /// Desired attributes with variables substituted.
    pub attributes: BTreeMap<String, Expr>,
    /// Explicit dependencies.
    pub depends_on: Vec<String>,
    /// Lifecycle options.
    pub lifecycle: Lifecycle,
}

/// A resolved output.
#[derive(Debug, Clone, Serialize)]
pub struct Output {
    /// Output name.
    pub name: String,
    /// Value expression over resource attributes.
    pub value: Expr,
    /// Human-readable description.
    pub description: Option<String>,
    /// Mask the value in listings.
    pub sensitive: bool,
}

/// The resolved resource graph for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Declarations {
    /// Resources in declaration order.
    pub resources: Vec<Resource>,
    /// Resolved variable values.
    pub variables: BTreeMap<String, Value>,
    /// Outputs sorted by name.
    pub outputs: Vec<Output>,
}

/// Formats a resource address.
#[must_use]
pub fn address(kind: &str, name: &str) -> String {
    format!("{kind}.{name}")
}

impl Resource {
    /// Returns every address this resource depends on, implicit and explicit.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self
            .attributes
            .values()
            .flat_map(Expr::attribute_refs)
            .map(super::expr::AttributeRef::address)
            .collect();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }
}

impl Declarations {
    /// Looks up a resource by address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.address == address)
    }

    /// Returns true if no resources are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns all resource addresses in declaration order.
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.address.as_str()).collect()
    }
}

impl VariableType {
    /// Returns true if `value` is acceptable for this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
        }
    }
}

/// Returns the type name of a JSON value, as used in variable errors.
#[must_use]
pub const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        };
        write!(f, "{s}")
    }
}
