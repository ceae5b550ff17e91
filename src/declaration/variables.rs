//! Variable resolution.
//!
//! Values are layered with increasing precedence: declared default,
//! variable file, `STACKFORM_VAR_<name>` environment variables, then
//! `--var name=value` flags. Each variable is resolved once per run.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ConfigError, DeclarationError, Result, StackformError};

use super::document::{type_name, VariableDecl, VariableType};
use super::expr::yaml_to_json;

/// Prefix of environment variables that set declaration variables.
pub const VAR_ENV_PREFIX: &str = "STACKFORM_VAR_";

/// Variable values supplied from outside the declarations.
#[derive(Debug, Clone, Default)]
pub struct VariableOverrides {
    /// Typed values from the variable file.
    file: BTreeMap<String, Value>,
    /// Raw strings from the environment.
    env: BTreeMap<String, String>,
    /// Raw strings from `--var` flags.
    cli: BTreeMap<String, String>,
}

impl VariableOverrides {
    /// Creates an empty set of overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML variable file (a flat map of name to value).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a YAML map.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading variable file: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackformError::Config(ConfigError::ParseError {
                message: format!("Failed to read variable file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let parsed: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(&content)
            .map_err(|e| {
                let location = e.location().map_or_else(
                    || path.display().to_string(),
                    |l| format!("{}:{}:{}", path.display(), l.line(), l.column()),
                );
                DeclarationError::parse(format!("Invalid variable file: {e}"), location)
            })?;

        for (name, value) in parsed.unwrap_or_default() {
            let value = yaml_to_json(&value).map_err(|m| {
                DeclarationError::parse(m, format!("{}: {name}", path.display()))
            })?;
            self.file.insert(name, value);
        }
        Ok(self)
    }

    /// Sets typed values as if they came from a variable file.
    #[must_use]
    pub fn with_file_values(mut self, values: BTreeMap<String, Value>) -> Self {
        self.file.extend(values);
        self
    }

    /// Collects `STACKFORM_VAR_<name>` variables from the process environment.
    #[must_use]
    pub fn with_process_env(self) -> Self {
        self.with_env(std::env::vars())
    }

    /// Collects `STACKFORM_VAR_<name>` entries from the given pairs.
    #[must_use]
    pub fn with_env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(VAR_ENV_PREFIX)
                && !name.is_empty()
            {
                self.env.insert(name.to_string(), value);
            }
        }
        self
    }

    /// Adds a `name=value` assignment from the command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the assignment has no `=` or an empty name.
    pub fn with_assignment(mut self, assignment: &str) -> Result<Self> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            ConfigError::validation(
                format!("Invalid variable assignment '{assignment}', expected name=value"),
                "--var",
            )
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::validation("Variable name cannot be empty", "--var").into());
        }
        self.cli.insert(name.to_string(), value.to_string());
        Ok(self)
    }
}

/// Resolves every declared variable to a typed value.
///
/// # Errors
///
/// Returns an error if a variable has no value, a value has the wrong type,
/// or a `--var` flag names an undeclared variable.
pub fn resolve_variables(
    declared: &BTreeMap<String, VariableDecl>,
    overrides: &VariableOverrides,
) -> Result<BTreeMap<String, Value>> {
    for name in overrides.cli.keys() {
        if !declared.contains_key(name) {
            return Err(DeclarationError::undefined(format!("var.{name}"), "--var").into());
        }
    }
    for name in overrides.file.keys() {
        if !declared.contains_key(name) {
            warn!("Variable file sets undeclared variable '{name}'");
        }
    }
    for name in overrides.env.keys() {
        if !declared.contains_key(name) {
            debug!("Ignoring {VAR_ENV_PREFIX}{name}: not declared");
        }
    }

    let mut resolved = BTreeMap::new();
    for (name, decl) in declared {
        let mut value = match &decl.default {
            Some(default) => Some(
                yaml_to_json(default)
                    .map_err(|m| DeclarationError::parse(m, format!("variable {name} default")))?,
            ),
            None => None,
        };

        if let Some(v) = overrides.file.get(name) {
            value = Some(v.clone());
        }
        if let Some(raw) = overrides.env.get(name) {
            value = Some(coerce(name, raw, decl.var_type)?);
        }
        if let Some(raw) = overrides.cli.get(name) {
            value = Some(coerce(name, raw, decl.var_type)?);
        }

        let value = value.ok_or_else(|| DeclarationError::MissingVariable { name: name.clone() })?;

        if !decl.var_type.accepts(&value) {
            return Err(DeclarationError::VariableType {
                name: name.clone(),
                expected: decl.var_type.to_string(),
                found: type_name(&value).to_string(),
            }
            .into());
        }

        debug!("Resolved variable '{name}'");
        resolved.insert(name.clone(), value);
    }

    Ok(resolved)
}

/// Converts a raw string override to the declared type.
fn coerce(name: &str, raw: &str, var_type: VariableType) -> Result<Value> {
    let mismatch = || DeclarationError::VariableType {
        name: name.to_string(),
        expected: var_type.to_string(),
        found: String::from("string"),
    };

    let value = match var_type {
        VariableType::String | VariableType::Any => Value::String(raw.to_string()),
        VariableType::Number => {
            let trimmed = raw.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Value::from(i)
            } else {
                let f = trimmed.parse::<f64>().map_err(|_| mismatch())?;
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(mismatch)?
            }
        }
        VariableType::Bool => match raw.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(mismatch().into()),
        },
        VariableType::List | VariableType::Map => {
            let parsed: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|_| mismatch())?;
            yaml_to_json(&parsed).map_err(|_| mismatch())?
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(var_type: VariableType, default: Option<&str>) -> VariableDecl {
        VariableDecl {
            var_type,
            default: default.map(|d| serde_yaml::from_str(d).expect("yaml default")),
            description: None,
        }
    }

    #[test]
    fn test_precedence_order() {
        let mut declared = BTreeMap::new();
        declared.insert(String::from("env"), decl(VariableType::String, Some("dev")));
        declared.insert(String::from("size"), decl(VariableType::Number, Some("1")));
        declared.insert(String::from("public"), decl(VariableType::Bool, Some("false")));

        let mut file = BTreeMap::new();
        file.insert(String::from("env"), json!("staging"));
        file.insert(String::from("size"), json!(2));

        let overrides = VariableOverrides::new()
            .with_file_values(file)
            .with_env(vec![
                (String::from("STACKFORM_VAR_size"), String::from("3")),
                (String::from("STACKFORM_VAR_public"), String::from("true")),
                (String::from("UNRELATED"), String::from("x")),
            ])
            .with_assignment("env=prod")
            .expect("assignment");

        let resolved = resolve_variables(&declared, &overrides).expect("resolve");
        assert_eq!(resolved["env"], json!("prod"));
        assert_eq!(resolved["size"], json!(3));
        assert_eq!(resolved["public"], json!(true));
    }

    #[test]
    fn test_missing_value_is_error() {
        let mut declared = BTreeMap::new();
        declared.insert(String::from("domain"), decl(VariableType::String, None));

        let err = resolve_variables(&declared, &VariableOverrides::new()).expect_err("missing");
        assert!(matches!(
            err,
            StackformError::Declaration(DeclarationError::MissingVariable { ref name }) if name == "domain"
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let mut declared = BTreeMap::new();
        declared.insert(String::from("count"), decl(VariableType::Number, Some("\"two\"")));
        let err = resolve_variables(&declared, &VariableOverrides::new()).expect_err("mismatch");
        assert!(matches!(
            err,
            StackformError::Declaration(DeclarationError::VariableType { .. })
        ));

        let overrides = VariableOverrides::new()
            .with_assignment("count=many")
            .expect("assignment");
        let mut declared = BTreeMap::new();
        declared.insert(String::from("count"), decl(VariableType::Number, Some("1")));
        assert!(resolve_variables(&declared, &overrides).is_err());
    }

    #[test]
    fn test_undeclared_cli_variable_rejected() {
        let overrides = VariableOverrides::new()
            .with_assignment("nope=1")
            .expect("assignment");
        let err = resolve_variables(&BTreeMap::new(), &overrides).expect_err("undeclared");
        assert!(matches!(
            err,
            StackformError::Declaration(DeclarationError::UndefinedReference { .. })
        ));
    }

    #[test]
    fn test_list_from_string() {
        let mut declared = BTreeMap::new();
        declared.insert(String::from("zones"), decl(VariableType::List, None));
        let overrides = VariableOverrides::new()
            .with_assignment("zones=[a, b]")
            .expect("assignment");
        let resolved = resolve_variables(&declared, &overrides).expect("resolve");
        assert_eq!(resolved["zones"], json!(["a", "b"]));
    }

    #[test]
    fn test_variable_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("vars.yaml");
        std::fs::write(&path, "domain: example.org\nreplicas: 4\n").expect("write");

        let mut declared = BTreeMap::new();
        declared.insert(String::from("domain"), decl(VariableType::String, None));
        declared.insert(String::from("replicas"), decl(VariableType::Number, Some("2")));

        let overrides = VariableOverrides::new().with_file(&path).expect("load file");
        let resolved = resolve_variables(&declared, &overrides).expect("resolve");
        assert_eq!(resolved["domain"], json!("example.org"));
        assert_eq!(resolved["replicas"], json!(4));
    }
}
