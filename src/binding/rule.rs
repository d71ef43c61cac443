//! Binding rule grammar.
//!
//! ```text
//! rule      := reference | path | literal
//! reference := field-path "," option ("," option)*      (contains a comma)
//! option    := "objectType=" ("Secret" | "ConfigMap") | "key=" subkey
//! path      := "path=" field-path
//! literal   := anything else
//! ```

use super::error::EvalError;
use super::path::FieldPath;
use std::fmt;
use std::str::FromStr;

const PATH_PREFIX: &str = "path=";

/// Kind of object a reference rule points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Secret,
    ConfigMap,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Secret => f.write_str("Secret"),
            ObjectType::ConfigMap => f.write_str("ConfigMap"),
        }
    }
}

impl FromStr for ObjectType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Secret" => Ok(ObjectType::Secret),
            "ConfigMap" => Ok(ObjectType::ConfigMap),
            _ => Err(()),
        }
    }
}

/// Rule that dereferences another object in the instance's namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRule {
    /// Evaluates to the referenced object's name
    pub name_path: FieldPath,
    pub object_type: ObjectType,
    /// Keep only this key, emitted under the rule's output key
    pub key: Option<String>,
}

/// A parsed binding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Literal(String),
    Path(FieldPath),
    Reference(ReferenceRule),
}

impl Rule {
    /// Parse a rule expression
    pub fn parse(expr: &str) -> Result<Self, EvalError> {
        if expr.contains(',') {
            return parse_reference(expr).map(Rule::Reference);
        }
        if let Some(path) = expr.strip_prefix(PATH_PREFIX) {
            return Ok(Rule::Path(FieldPath::parse(path)?));
        }
        Ok(Rule::Literal(expr.to_string()))
    }
}

fn parse_reference(expr: &str) -> Result<ReferenceRule, EvalError> {
    let mut parts = expr.split(',');
    let raw_path = parts.next().unwrap_or_default().trim();
    let raw_path = raw_path.strip_prefix(PATH_PREFIX).unwrap_or(raw_path);
    let name_path = FieldPath::parse(raw_path)?;

    let mut object_type = None;
    let mut key = None;
    for option in parts {
        let option = option.trim();
        let Some((name, value)) = option.split_once('=') else {
            return Err(EvalError::MalformedRule {
                rule: expr.to_string(),
                reason: format!("option '{option}' is not of the form name=value"),
            });
        };
        match name.trim() {
            "objectType" => {
                let value = value.trim();
                object_type = Some(value.parse::<ObjectType>().map_err(|()| {
                    EvalError::InvalidObjectType {
                        rule: expr.to_string(),
                        object_type: value.to_string(),
                    }
                })?);
            }
            "key" => key = Some(value.trim().to_string()),
            other => {
                return Err(EvalError::MalformedRule {
                    rule: expr.to_string(),
                    reason: format!("unknown option '{other}'"),
                });
            }
        }
    }

    let object_type = object_type.ok_or_else(|| EvalError::InvalidObjectType {
        rule: expr.to_string(),
        object_type: String::new(),
    })?;

    Ok(ReferenceRule {
        name_path,
        object_type,
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        assert_eq!(
            Rule::parse("postgres").unwrap(),
            Rule::Literal("postgres".to_string())
        );
        assert_eq!(Rule::parse("").unwrap(), Rule::Literal(String::new()));
    }

    #[test]
    fn test_path() {
        let rule = Rule::parse("path={.spec.username}").unwrap();
        assert!(matches!(rule, Rule::Path(p) if p.source() == "{.spec.username}"));
    }

    #[test]
    fn test_reference_with_key() {
        let rule = Rule::parse("{.spec.secretRef},objectType=Secret,key=password").unwrap();
        let Rule::Reference(reference) = rule else {
            panic!("expected a reference rule");
        };
        assert_eq!(reference.object_type, ObjectType::Secret);
        assert_eq!(reference.key.as_deref(), Some("password"));
        assert_eq!(reference.name_path.source(), "{.spec.secretRef}");
    }

    #[test]
    fn test_reference_accepts_path_prefix() {
        let rule = Rule::parse("path={.spec.cm},objectType=ConfigMap").unwrap();
        assert!(matches!(
            rule,
            Rule::Reference(ReferenceRule { object_type: ObjectType::ConfigMap, key: None, .. })
        ));
    }

    #[test]
    fn test_reference_errors() {
        assert!(matches!(
            Rule::parse("{.spec.x},objectType=Deployment"),
            Err(EvalError::InvalidObjectType { .. })
        ));
        assert!(matches!(
            Rule::parse("{.spec.x},key=password"),
            Err(EvalError::InvalidObjectType { .. })
        ));
        assert!(matches!(
            Rule::parse("{.spec.x},objectType=Secret,foo=bar"),
            Err(EvalError::MalformedRule { .. })
        ));
        assert!(matches!(
            Rule::parse("{.spec.x},objectType=Secret,bare"),
            Err(EvalError::MalformedRule { .. })
        ));
        assert!(matches!(
            Rule::parse("{.spec.x[,objectType=Secret"),
            Err(EvalError::PathEval(_))
        ));
    }
}
