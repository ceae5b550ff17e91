//! Declaration loader.
//!
//! Reads declaration documents from files or directories, merges them,
//! resolves variables and checks that every reference points at something
//! that exists. Loading never talks to the provider.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, DeclarationError, Result, StackformError};

use super::document::{
    address, DeclarationDocument, Declarations, Output, OutputDecl, Resource, ResourceDecl,
    VariableDecl,
};
use super::expr::{is_identifier, Expr};
use super::variables::{resolve_variables, VariableOverrides};

/// Loader for declaration documents.
#[derive(Debug, Default)]
pub struct DeclarationLoader {
    /// Variable values supplied from outside the declarations.
    overrides: VariableOverrides,
}

/// A named source document.
#[derive(Debug, Clone)]
pub struct Source {
    /// Where the document came from, used in error locations.
    pub name: String,
    /// Raw YAML content.
    pub content: String,
}

impl DeclarationLoader {
    /// Creates a loader with no variable overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the variable overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: VariableOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Loads declarations from files and directories.
    ///
    /// Directories contribute every `*.yaml`/`*.yml` file they contain,
    /// sorted by file name.
    ///
    /// # Errors
    ///
    /// Returns an error if a path is missing, a file cannot be read, or the
    /// documents are invalid.
    pub fn load_paths(&self, paths: &[PathBuf]) -> Result<Declarations> {
        let files = collect_files(paths)?;
        info!("Loading {} declaration file(s)", files.len());

        let mut sources = Vec::with_capacity(files.len());
        for file in files {
            let content = std::fs::read_to_string(&file)?;
            sources.push(Source {
                name: file.display().to_string(),
                content,
            });
        }

        self.load_sources(&sources)
    }

    /// Loads declarations from in-memory sources.
    ///
    /// # Errors
    ///
    /// Returns an error if the documents are invalid.
    pub fn load_sources(&self, sources: &[Source]) -> Result<Declarations> {
        let mut documents = Vec::with_capacity(sources.len());
        for source in sources {
            documents.push((source.name.as_str(), parse_document(source)?));
        }

        let mut variable_decls: BTreeMap<String, VariableDecl> = BTreeMap::new();
        let mut resource_decls: Vec<(&str, &ResourceDecl)> = Vec::new();
        let mut output_decls: BTreeMap<&str, (&str, &OutputDecl)> = BTreeMap::new();

        for (source, document) in &documents {
            for (name, decl) in &document.variables {
                if variable_decls.insert(name.clone(), decl.clone()).is_some() {
                    return Err(duplicate("variable", name));
                }
            }
            for decl in &document.resources {
                resource_decls.push((*source, decl));
            }
            for (name, decl) in &document.outputs {
                if output_decls.insert(name.as_str(), (*source, decl)).is_some() {
                    return Err(duplicate("output", name));
                }
            }
        }

        let variables = resolve_variables(&variable_decls, &self.overrides)?;

        let mut known: HashSet<String> = HashSet::new();
        let mut resources = Vec::with_capacity(resource_decls.len());
        for (index, (source, decl)) in resource_decls.into_iter().enumerate() {
            let resource = resolve_resource(source, index, decl, &variables)?;
            if !known.insert(resource.address.clone()) {
                return Err(duplicate("resource", &resource.address));
            }
            resources.push(resource);
        }

        for resource in &resources {
            check_resource_references(resource, &known)?;
        }

        let mut outputs = Vec::with_capacity(output_decls.len());
        for (name, (source, decl)) in output_decls {
            let location = format!("{source}: output.{name}");
            let value = Expr::from_yaml(&decl.value)
                .map_err(|m| DeclarationError::parse(m, &location))?
                .substitute_variables(&variables)
                .map_err(|var| DeclarationError::undefined(format!("var.{var}"), &location))?;

            for reference in value.attribute_refs() {
                if !known.contains(&reference.address()) {
                    return Err(DeclarationError::undefined(reference.to_string(), &location).into());
                }
            }

            outputs.push(Output {
                name: name.to_string(),
                value,
                description: decl.description.clone(),
                sensitive: decl.sensitive,
            });
        }

        debug!(
            "Loaded {} resources, {} variables, {} outputs",
            resources.len(),
            variables.len(),
            outputs.len()
        );

        Ok(Declarations {
            resources,
            variables,
            outputs,
        })
    }
}

/// Expands files and directories into the ordered list of documents.
///
/// # Errors
///
/// Returns an error if a path does not exist or a directory cannot be read.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_yaml(p))
                .collect();
            entries.sort();
            files.extend(entries);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(StackformError::Config(ConfigError::FileNotFound {
                path: path.clone(),
            }));
        }
    }

    Ok(files)
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
}

fn parse_document(source: &Source) -> Result<DeclarationDocument> {
    if source.content.trim().is_empty() {
        return Ok(DeclarationDocument::default());
    }

    let document: Option<DeclarationDocument> =
        serde_yaml::from_str(&source.content).map_err(|e| {
            let location = e.location().map_or_else(
                || source.name.clone(),
                |l| format!("{}:{}:{}", source.name, l.line(), l.column()),
            );
            DeclarationError::parse(e.to_string(), location)
        })?;

    Ok(document.unwrap_or_default())
}

fn resolve_resource(
    source: &str,
    index: usize,
    decl: &ResourceDecl,
    variables: &BTreeMap<String, serde_json::Value>,
) -> Result<Resource> {
    if !is_identifier(&decl.kind) || !is_identifier(&decl.name) {
        return Err(DeclarationError::parse(
            format!(
                "invalid resource identity kind='{}' name='{}'",
                decl.kind, decl.name
            ),
            source,
        )
        .into());
    }

    let addr = address(&decl.kind, &decl.name);
    let mut attributes = BTreeMap::new();

    for (key, value) in &decl.attributes {
        let key = key.as_str().ok_or_else(|| {
            DeclarationError::parse(
                format!("attribute names must be strings, found {key:?}"),
                format!("{source}: {addr}"),
            )
        })?;
        let location = format!("{source}: {addr}.{key}");
        let expr = Expr::from_yaml(value)
            .map_err(|m| DeclarationError::parse(m, &location))?
            .substitute_variables(variables)
            .map_err(|var| DeclarationError::undefined(format!("var.{var}"), &location))?;
        attributes.insert(key.to_string(), expr);
    }

    Ok(Resource {
        address: addr,
        kind: decl.kind.clone(),
        name: decl.name.clone(),
        index,
        attributes,
        depends_on: decl.depends_on.clone(),
        lifecycle: decl.lifecycle,
    })
}

fn check_resource_references(resource: &Resource, known: &HashSet<String>) -> Result<()> {
    for (key, expr) in &resource.attributes {
        for reference in expr.attribute_refs() {
            if !known.contains(&reference.address()) {
                return Err(DeclarationError::undefined(
                    reference.to_string(),
                    format!("{}.{key}", resource.address),
                )
                .into());
            }
        }
    }

    for dep in &resource.depends_on {
        if !known.contains(dep) {
            return Err(DeclarationError::undefined(
                dep.clone(),
                format!("{}.depends_on", resource.address),
            )
            .into());
        }
    }

    Ok(())
}

fn duplicate(kind: &str, name: &str) -> StackformError {
    DeclarationError::Duplicate {
        kind: kind.to_string(),
        name: name.to_string(),
    }
    .into()
}
