//! Attribute expressions.
//!
//! Declaration values are parsed into a small typed AST so that the planner
//! can find references without string matching. Strings may contain
//! `${var.NAME}` or `${KIND.NAME.ATTR}` interpolations; `$${` yields a
//! literal `${`.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A reference appearing inside an interpolation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Reference {
    /// `${var.NAME}`.
    Variable(String),
    /// `${KIND.NAME.ATTR}`.
    Attribute(AttributeRef),
}

/// A reference to an attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AttributeRef {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Attribute name.
    pub attribute: String,
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TemplatePart {
    /// Literal text.
    Text(String),
    /// An interpolated reference, rendered as a string.
    Interpolation(Reference),
}

/// A declaration value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    /// A fully known value.
    Literal(Value),
    /// A list of expressions.
    List(Vec<Expr>),
    /// A map of expressions.
    Map(BTreeMap<String, Expr>),
    /// A whole-value reference; keeps the referenced value's type.
    Reference(Reference),
    /// A string with at least one interpolation mixed with text.
    Template(Vec<TemplatePart>),
}

/// The value of an expression at plan or apply time.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The value is known.
    Known(Value),
    /// The value is only known after apply.
    Unknown,
}

impl AttributeRef {
    /// Returns the address of the referenced resource.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.name, self.attribute)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variable(name) => write!(f, "var.{name}"),
            Self::Attribute(attr) => write!(f, "{attr}"),
        }
    }
}

impl Expr {
    /// Builds an expression from a YAML value, parsing interpolations.
    ///
    /// # Errors
    ///
    /// Returns a message describing malformed interpolation syntax or a YAML
    /// construct that has no expression equivalent.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self, String> {
        match value {
            serde_yaml::Value::String(s) => parse_template(s),
            serde_yaml::Value::Sequence(items) => items
                .iter()
                .map(Self::from_yaml)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = BTreeMap::new();
                for (key, item) in mapping {
                    let key = key
                        .as_str()
                        .ok_or_else(|| format!("map keys must be strings, found {key:?}"))?;
                    map.insert(key.to_string(), Self::from_yaml(item)?);
                }
                Ok(Self::Map(map))
            }
            other => yaml_to_json(other).map(Self::Literal),
        }
    }

    /// Replaces every variable reference with its resolved value.
    ///
    /// # Errors
    ///
    /// Returns the name of the first variable that has no value.
    pub fn substitute_variables(&self, variables: &BTreeMap<String, Value>) -> Result<Self, String> {
        match self {
            Self::Literal(_) | Self::Reference(Reference::Attribute(_)) => Ok(self.clone()),
            Self::Reference(Reference::Variable(name)) => variables
                .get(name)
                .map(|v| Self::Literal(v.clone()))
                .ok_or_else(|| name.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.substitute_variables(variables))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Self::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), item.substitute_variables(variables)?);
                }
                Ok(Self::Map(out))
            }
            Self::Template(parts) => {
                let mut out: Vec<TemplatePart> = Vec::with_capacity(parts.len());
                for part in parts {
                    let part = match part {
                        TemplatePart::Interpolation(Reference::Variable(name)) => {
                            let value = variables.get(name).ok_or_else(|| name.clone())?;
                            TemplatePart::Text(render(value))
                        }
                        other => other.clone(),
                    };
                    push_part(&mut out, part);
                }
                Ok(collapse(out))
            }
        }
    }

    /// Returns every reference in the expression, in source order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    /// Returns every resource attribute reference in the expression.
    #[must_use]
    pub fn attribute_refs(&self) -> Vec<&AttributeRef> {
        self.references()
            .into_iter()
            .filter_map(|r| match r {
                Reference::Attribute(attr) => Some(attr),
                Reference::Variable(_) => None,
            })
            .collect()
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            Self::Map(map) => map.values().for_each(|i| i.collect_references(out)),
            Self::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Interpolation(r) = part {
                        out.push(r);
                    }
                }
            }
        }
    }

    /// Evaluates the expression.
    ///
    /// `lookup` resolves resource attribute references; a `None` answer
    /// means the reference cannot be resolved. Any unknown input makes the
    /// whole value unknown.
    ///
    /// # Errors
    ///
    /// Returns the first reference that could not be resolved.
    pub fn evaluate<F>(&self, lookup: &F) -> Result<Resolved, Reference>
    where
        F: Fn(&AttributeRef) -> Option<Resolved>,
    {
        match self {
            Self::Literal(value) => Ok(Resolved::Known(value.clone())),
            Self::Reference(reference) => resolve_reference(reference, lookup),
            Self::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut unknown = false;
                for item in items {
                    match item.evaluate(lookup)? {
                        Resolved::Known(v) => values.push(v),
                        Resolved::Unknown => unknown = true,
                    }
                }
                Ok(if unknown {
                    Resolved::Unknown
                } else {
                    Resolved::Known(Value::Array(values))
                })
            }
            Self::Map(map) => {
                let mut values = Map::new();
                let mut unknown = false;
                for (key, item) in map {
                    match item.evaluate(lookup)? {
                        Resolved::Known(v) => {
                            values.insert(key.clone(), v);
                        }
                        Resolved::Unknown => unknown = true,
                    }
                }
                Ok(if unknown {
                    Resolved::Unknown
                } else {
                    Resolved::Known(Value::Object(values))
                })
            }
            Self::Template(parts) => {
                let mut text = String::new();
                let mut unknown = false;
                for part in parts {
                    match part {
                        TemplatePart::Text(s) => text.push_str(s),
                        TemplatePart::Interpolation(r) => match resolve_reference(r, lookup)? {
                            Resolved::Known(v) => text.push_str(&render(&v)),
                            Resolved::Unknown => unknown = true,
                        },
                    }
                }
                Ok(if unknown {
                    Resolved::Unknown
                } else {
                    Resolved::Known(Value::String(text))
                })
            }
        }
    }
}

fn resolve_reference<F>(reference: &Reference, lookup: &F) -> Result<Resolved, Reference>
where
    F: Fn(&AttributeRef) -> Option<Resolved>,
{
    match reference {
        Reference::Attribute(attr) => lookup(attr).ok_or_else(|| reference.clone()),
        Reference::Variable(_) => Err(reference.clone()),
    }
}

/// Parses a string that may contain interpolations.
///
/// # Errors
///
/// Returns a message for an unterminated or malformed interpolation.
pub fn parse_template(input: &str) -> Result<Expr, String> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        text.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$${") {
            text.push_str("${");
            rest = after;
        } else if let Some(body) = tail.strip_prefix("${") {
            let end = body
                .find('}')
                .ok_or_else(|| format!("unterminated interpolation in \"{input}\""))?;
            let reference = parse_reference(body[..end].trim())?;
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            parts.push(TemplatePart::Interpolation(reference));
            rest = &body[end + 1..];
        } else {
            text.push('$');
            rest = &tail[1..];
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }

    Ok(collapse(parts))
}

fn parse_reference(body: &str) -> Result<Reference, String> {
    let segments: Vec<&str> = body.split('.').collect();
    if segments.iter().any(|s| !is_identifier(s)) {
        return Err(format!("invalid reference \"${{{body}}}\""));
    }

    match segments.as_slice() {
        ["var", name] => Ok(Reference::Variable((*name).to_string())),
        [kind, name, attribute] if *kind != "var" => Ok(Reference::Attribute(AttributeRef {
            kind: (*kind).to_string(),
            name: (*name).to_string(),
            attribute: (*attribute).to_string(),
        })),
        _ => Err(format!(
            "invalid reference \"${{{body}}}\": expected var.NAME or KIND.NAME.ATTR"
        )),
    }
}

/// Returns true if `s` is a valid kind, name or attribute identifier.
#[must_use]
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Renders a value the way it appears inside an interpolated string.
#[must_use]
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn push_part(parts: &mut Vec<TemplatePart>, part: TemplatePart) {
    if let TemplatePart::Text(next) = &part
        && let Some(TemplatePart::Text(prev)) = parts.last_mut()
    {
        prev.push_str(next);
        return;
    }
    parts.push(part);
}

fn collapse(mut parts: Vec<TemplatePart>) -> Expr {
    if parts.len() > 1 {
        return Expr::Template(parts);
    }
    match parts.pop() {
        None => Expr::Literal(Value::String(String::new())),
        Some(TemplatePart::Text(s)) => Expr::Literal(Value::String(s)),
        Some(TemplatePart::Interpolation(r)) => Expr::Reference(r),
    }
}

/// Converts a YAML value to JSON.
///
/// # Errors
///
/// Returns a message for tagged values, non-string keys and non-finite
/// numbers.
pub fn yaml_to_json(value: &serde_yaml::Value) -> Result<Value, String> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(Number::from(i))
            } else if let Some(u) = n.as_u64() {
                Value::Number(Number::from(u))
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| format!("unsupported number {n}"))?
            }
        }
        serde_yaml::Value::String(s) => Value::String(s.clone()),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .iter()
                .map(yaml_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, item) in mapping {
                let key = key
                    .as_str()
                    .ok_or_else(|| format!("map keys must be strings, found {key:?}"))?;
                map.insert(key.to_string(), yaml_to_json(item)?);
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => {
            return Err(format!("YAML tags are not supported ({})", tagged.tag));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attr(kind: &str, name: &str, attribute: &str) -> Reference {
        Reference::Attribute(AttributeRef {
            kind: kind.to_string(),
            name: name.to_string(),
            attribute: attribute.to_string(),
        })
    }

    #[test]
    fn test_plain_string_is_literal() {
        let expr = parse_template("index.html").expect("parse");
        assert_eq!(expr, Expr::Literal(json!("index.html")));
    }

    #[test]
    fn test_single_interpolation_keeps_reference() {
        let expr = parse_template("${bucket.site.domain_name}").expect("parse");
        assert_eq!(expr, Expr::Reference(attr("bucket", "site", "domain_name")));
    }

    #[test]
    fn test_mixed_template() {
        let expr = parse_template("https://${distribution.cdn.domain_name}/").expect("parse");
        assert_eq!(
            expr,
            Expr::Template(vec![
                TemplatePart::Text(String::from("https://")),
                TemplatePart::Interpolation(attr("distribution", "cdn", "domain_name")),
                TemplatePart::Text(String::from("/")),
            ])
        );
    }

    #[test]
    fn test_escape_produces_literal() {
        let expr = parse_template("cost: $${var.price} and $5").expect("parse");
        assert_eq!(expr, Expr::Literal(json!("cost: ${var.price} and $5")));
    }

    #[test]
    fn test_malformed_interpolations() {
        assert!(parse_template("${bucket.site").is_err());
        assert!(parse_template("${bucket.site}").is_err());
        assert!(parse_template("${var.a.b}").is_err());
        assert!(parse_template("${}").is_err());
        assert!(parse_template("${1bucket.a.b}").is_err());
    }

    #[test]
    fn test_variable_substitution_keeps_type() {
        let mut vars = BTreeMap::new();
        vars.insert(String::from("count"), json!(3));
        vars.insert(String::from("env"), json!("prod"));

        let whole = parse_template("${var.count}").expect("parse");
        assert_eq!(
            whole.substitute_variables(&vars).expect("substitute"),
            Expr::Literal(json!(3))
        );

        let mixed = parse_template("site-${var.env}-${var.count}").expect("parse");
        assert_eq!(
            mixed.substitute_variables(&vars).expect("substitute"),
            Expr::Literal(json!("site-prod-3"))
        );

        let missing = parse_template("${var.region}").expect("parse");
        assert_eq!(
            missing.substitute_variables(&vars),
            Err(String::from("region"))
        );
    }

    #[test]
    fn test_evaluate_unknown_propagates() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("[\"${bucket.a.id}\", \"x-${bucket.b.id}\"]").expect("yaml");
        let expr = Expr::from_yaml(&yaml).expect("expr");

        let lookup = |r: &AttributeRef| match r.name.as_str() {
            "a" => Some(Resolved::Known(json!("id-a"))),
            "b" => Some(Resolved::Unknown),
            _ => None,
        };
        assert_eq!(expr.evaluate(&lookup), Ok(Resolved::Unknown));

        let all_known = |_: &AttributeRef| Some(Resolved::Known(json!(7)));
        assert_eq!(
            expr.evaluate(&all_known),
            Ok(Resolved::Known(json!([7, "x-7"])))
        );
    }

    #[test]
    fn test_attribute_refs_in_order() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            "origin: \"${bucket.site.domain_name}\"\nzones: [\"${subnet.a.id}\"]",
        )
        .expect("yaml");
        let expr = Expr::from_yaml(&yaml).expect("expr");
        let addresses: Vec<String> = expr.attribute_refs().iter().map(|r| r.address()).collect();
        assert_eq!(addresses, vec!["bucket.site", "subnet.a"]);
    }
}
