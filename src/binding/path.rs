//! Field paths - the JSONPath subset binding rules use
//!
//! Supports:
//! - `{.spec.host}` (template block)
//! - `{$.spec.host}` and `{spec.host}` (optional root marker / leading dot)
//! - `.items[0]`, `.items[-1]` (array index, negative counts from the end)
//! - `['my.field']`, `["my-field"]` (quoted field names)
//! - `postgres://{.spec.host}:{.spec.port}` (text mixed with blocks)
//!
//! Text outside a block is literal, so `shared-creds` renders as itself.
//!
//! Does NOT support filters, wildcards, slices or unions.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Field path failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid field path '{path}': {reason}")]
    Syntax { path: String, reason: String },

    #[error("field path '{path}' did not resolve: {reason}")]
    Unresolved { path: String, reason: String },
}

/// A parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object field access: `.field` or `['field']`
    Field(String),
    /// Array index access: `[0]`, `[-1]`
    Index(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Expr(Vec<Segment>),
}

/// A parsed field path template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    source: String,
    pieces: Vec<Piece>,
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FieldPath {
    /// Parse a template (`text{expr}text`)
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let syntax = |reason: &str| PathError::Syntax {
            path: input.to_string(),
            reason: reason.to_string(),
        };

        let mut pieces = Vec::new();
        let mut rest = input;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                pieces.push(Piece::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = find_block_end(after).ok_or_else(|| syntax("unclosed '{'"))?;
            let expr = after[..close].trim();
            if expr.is_empty() {
                return Err(syntax("empty expression block"));
            }
            pieces.push(Piece::Expr(parse_expr(expr).map_err(|reason| syntax(&reason))?));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            pieces.push(Piece::Text(rest.to_string()));
        }

        Ok(Self {
            source: input.to_string(),
            pieces,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `value` and render the result as text
    pub fn evaluate(&self, value: &Value) -> Result<String, PathError> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Expr(segments) => {
                    let resolved = apply(value, segments).map_err(|reason| PathError::Unresolved {
                        path: self.source.clone(),
                        reason,
                    })?;
                    out.push_str(&render(resolved));
                }
            }
        }
        Ok(out)
    }
}

/// Index of the `}` closing a block, skipping quoted field names
fn find_block_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '}') => return Some(i),
            (None, _) => {}
        }
    }
    None
}

/// Parse a single expression into segments
///
/// Examples:
/// - `.spec.username` -> [Field("spec"), Field("username")]
/// - `$.items[-1]` -> [Field("items"), Index(-1)]
pub fn parse_expr(expr: &str) -> Result<Vec<Segment>, String> {
    let expr = expr.trim();
    let expr = expr.strip_prefix('$').unwrap_or(expr);
    if expr.is_empty() || expr == "." {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = expr.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    // A leading bare name is an implicit `.name`.
    if chars[0] != '.' && chars[0] != '[' {
        let (name, next) = read_name(&chars, 0);
        segments.push(Segment::Field(name));
        i = next;
    }

    while i < chars.len() {
        match chars[i] {
            '.' => {
                let (name, next) = read_name(&chars, i + 1);
                if name.is_empty() {
                    return Err(format!("empty field name at position {i}"));
                }
                segments.push(Segment::Field(name));
                i = next;
            }
            '[' => {
                let (segment, next) = read_bracket(&chars, i + 1)?;
                segments.push(segment);
                i = next;
            }
            c => return Err(format!("unexpected character '{c}' at position {i}")),
        }
    }

    Ok(segments)
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let end = chars[start..]
        .iter()
        .position(|c| *c == '.' || *c == '[')
        .map_or(chars.len(), |p| start + p);
    (chars[start..end].iter().collect(), end)
}

fn read_bracket(chars: &[char], start: usize) -> Result<(Segment, usize), String> {
    let Some(&first) = chars.get(start) else {
        return Err("unclosed '['".to_string());
    };

    if first == '\'' || first == '"' {
        let close = chars[start + 1..]
            .iter()
            .position(|c| *c == first)
            .map(|p| start + 1 + p)
            .ok_or_else(|| "unterminated quoted field name".to_string())?;
        if chars.get(close + 1) != Some(&']') {
            return Err("expected ']' after quoted field name".to_string());
        }
        let name: String = chars[start + 1..close].iter().collect();
        return Ok((Segment::Field(name), close + 2));
    }

    let close = chars[start..]
        .iter()
        .position(|c| *c == ']')
        .map(|p| start + p)
        .ok_or_else(|| "unclosed '['".to_string())?;
    let raw: String = chars[start..close].iter().collect();
    let index: i64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("unsupported subscript '[{raw}]': {e}"))?;
    Ok((Segment::Index(index), close + 1))
}

/// Apply segments to a JSON value
///
/// Uses references throughout; the caller decides whether to clone.
pub fn apply<'a>(value: &'a Value, segments: &[Segment]) -> Result<&'a Value, String> {
    let mut current = value;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(map)) => map
                .get(name)
                .ok_or_else(|| format!("field '{name}' not found"))?,
            (Segment::Field(name), other) => {
                return Err(format!("cannot access field '{name}' on {}", type_name(other)));
            }
            (Segment::Index(idx), Value::Array(items)) => {
                let len = items.len() as i64;
                let pos = if *idx < 0 { len + idx } else { *idx };
                usize::try_from(pos)
                    .ok()
                    .and_then(|p| items.get(p))
                    .ok_or_else(|| format!("index {idx} out of range (length {len})"))?
            }
            (Segment::Index(idx), other) => {
                return Err(format!("cannot index [{idx}] into {}", type_name(other)));
            }
        };
    }
    Ok(current)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Render a resolved value as text
///
/// Strings verbatim, null as empty, everything else as compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(path: &str, value: &Value) -> Result<String, PathError> {
        FieldPath::parse(path)?.evaluate(value)
    }

    #[test]
    fn parse_dot_notation() {
        assert_eq!(
            parse_expr(".spec.username").unwrap(),
            vec![
                Segment::Field("spec".to_string()),
                Segment::Field("username".to_string())
            ]
        );
        assert_eq!(parse_expr("$.spec").unwrap(), parse_expr("spec").unwrap());
    }

    #[test]
    fn parse_brackets() {
        assert_eq!(
            parse_expr(".metadata.labels['app.kubernetes.io/name'][-1]").unwrap(),
            vec![
                Segment::Field("metadata".to_string()),
                Segment::Field("labels".to_string()),
                Segment::Field("app.kubernetes.io/name".to_string()),
                Segment::Index(-1),
            ]
        );
    }

    #[test]
    fn parse_root() {
        assert!(parse_expr("$").unwrap().is_empty());
        assert!(parse_expr(".").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_bad_syntax() {
        assert!(parse_expr(".spec..name").is_err());
        assert!(parse_expr(".items[*]").is_err());
        assert!(parse_expr(".items[0").is_err());
        assert!(matches!(
            FieldPath::parse("{.spec.name"),
            Err(PathError::Syntax { .. })
        ));
        assert!(matches!(FieldPath::parse("{}"), Err(PathError::Syntax { .. })));
    }

    #[test]
    fn evaluate_templates() {
        let obj = json!({"spec": {"username": "alice", "host": "db", "port": 5432}});
        assert_eq!(eval("{.spec.username}", &obj).unwrap(), "alice");
        assert_eq!(eval("{spec.username}", &obj).unwrap(), "alice");
        assert_eq!(
            eval("postgres://{.spec.host}:{.spec.port}", &obj).unwrap(),
            "postgres://db:5432"
        );
    }

    #[test]
    fn evaluate_arrays() {
        let obj = json!({"spec": {"ports": [{"port": 80}, {"port": 443}]}});
        assert_eq!(eval("{.spec.ports[0].port}", &obj).unwrap(), "80");
        assert_eq!(eval("{.spec.ports[-1].port}", &obj).unwrap(), "443");
        assert!(matches!(
            eval("{.spec.ports[2].port}", &obj),
            Err(PathError::Unresolved { .. })
        ));
    }

    #[test]
    fn evaluate_missing_and_mistyped_fields() {
        let obj = json!({"spec": {"name": "x"}});
        assert!(matches!(
            eval("{.spec.missing}", &obj),
            Err(PathError::Unresolved { .. })
        ));
        assert!(matches!(
            eval("{.spec.name.inner}", &obj),
            Err(PathError::Unresolved { .. })
        ));
    }

    #[test]
    fn text_outside_blocks_is_literal() {
        let obj = json!({"spec": {"username": "alice"}});
        assert_eq!(eval("shared-creds", &obj).unwrap(), "shared-creds");
        assert_eq!(eval(".spec.username", &obj).unwrap(), ".spec.username");
        assert_eq!(eval("", &obj).unwrap(), "");
    }

    #[test]
    fn render_values() {
        assert_eq!(render(&json!(null)), "");
        assert_eq!(render(&json!(true)), "true");
        assert_eq!(render(&json!(1.5)), "1.5");
        assert_eq!(render(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn quoted_braces_do_not_close_block() {
        let obj = json!({"data": {"a}b": "v"}});
        assert_eq!(eval("{.data['a}b']}", &obj).unwrap(), "v");
    }
}
