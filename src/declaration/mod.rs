//! Declaration module for Stackform.
//!
//! This module turns declaration documents into the resolved resource graph:
//! - Parsing YAML documents into typed resources, variables and outputs
//! - Parsing `${...}` interpolations into references
//! - Resolving variables with their override precedence
//! - Fingerprinting the result for change tracking

mod document;
mod expr;
mod hash;
mod loader;
mod variables;

pub use document::{
    address, type_name, DeclarationDocument, Declarations, Lifecycle, Output, OutputDecl, Resource,
    ResourceDecl, VariableDecl, VariableType,
};
pub use expr::{
    is_identifier, parse_template, render, yaml_to_json, AttributeRef, Expr, Reference, Resolved,
    TemplatePart,
};
pub use hash::DeclarationHasher;
pub use loader::{collect_files, DeclarationLoader, Source};
pub use variables::{resolve_variables, VariableOverrides, VAR_ENV_PREFIX};
