//! Response mapping context and its restricted expression evaluator.
//!
//! A middleware's `responseMap` is evaluated against the parsed response body
//! bound as `response` and the selected response headers bound as `headers`.
//! Only property paths, quoted literals and `${...}` templates are understood;
//! nothing else is ever executed.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Regex for matching variable expressions like ${...}
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Property paths such as `response.items[0].name` or `headers.x-request-id`.
static PATH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][\w-]*(\.[\w-]+|\[\d+\])*$").unwrap());

/// Errors produced while evaluating a mapping expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("Response mapping expression is empty")]
    Empty,

    #[error("Response mapping path '{0}' did not resolve to a value")]
    Unresolved(String),

    #[error("Unsupported response mapping expression: {0}")]
    Unsupported(String),

    #[error("Invalid string literal in response mapping: {0}")]
    InvalidLiteral(String),
}

/// Values bound for evaluating a response mapping.
#[derive(Debug, Clone)]
pub struct MappingContext {
    /// Parsed response body
    pub response: JsonValue,
    /// Selected response headers (lowercase names)
    pub headers: HashMap<String, String>,
}

impl MappingContext {
    /// Create a context binding the given response body.
    pub fn new(response: JsonValue) -> Self {
        Self {
            response,
            headers: HashMap::new(),
        }
    }

    /// Add response headers to the context.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self
    }

    /// Evaluate a mapping expression into the substitution string.
    ///
    /// Accepted forms:
    /// - `response.data.name`, `response.items[0]`, `headers.etag` - property paths
    /// - `"text"` or `'text'` - string literals
    /// - `Hello ${response.name}` or `` `Hello ${response.name}` `` - templates
    pub fn evaluate(&self, expression: &str) -> Result<String, MappingError> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(MappingError::Empty);
        }

        if let Some(inner) = strip_delimiters(expr, '`') {
            return Ok(self.interpolate(inner));
        }

        if expr.starts_with('"') {
            return serde_json::from_str::<String>(expr)
                .map_err(|_| MappingError::InvalidLiteral(expr.to_string()));
        }

        if expr.starts_with('\'') {
            return strip_delimiters(expr, '\'')
                .filter(|inner| !inner.contains('\''))
                .map(str::to_string)
                .ok_or_else(|| MappingError::InvalidLiteral(expr.to_string()));
        }

        if expr.contains("${") {
            return Ok(self.interpolate(expr));
        }

        if PATH_REGEX.is_match(expr) {
            return self
                .resolve(expr)
                .ok_or_else(|| MappingError::Unresolved(expr.to_string()));
        }

        Err(MappingError::Unsupported(expr.to_string()))
    }

    /// Resolve a property path.
    ///
    /// Supports:
    /// - `response` - The whole response body
    /// - `response.field.subfield` - Response body JSON path
    /// - `response.items[0]` or `response.items.0` - Array elements
    /// - `headers.Content-Type` - Selected response header value
    pub fn resolve(&self, expr: &str) -> Option<String> {
        let split = expr.find(['.', '[']).unwrap_or(expr.len());
        let (root, rest) = expr.split_at(split);
        let rest = rest.strip_prefix('.').unwrap_or(rest);

        match root {
            "response" => resolve_json_path(&self.response, rest),
            "headers" => self.headers.get(&rest.to_lowercase()).cloned(),
            _ => None,
        }
    }

    /// Interpolate all ${...} variables in a string.
    ///
    /// Unresolved variables render as empty strings.
    pub fn interpolate(&self, template: &str) -> String {
        VAR_REGEX
            .replace_all(template, |caps: &regex::Captures| {
                let var_name = caps[1].trim();
                self.resolve(var_name).unwrap_or_default()
            })
            .to_string()
    }
}

fn strip_delimiters(expr: &str, delimiter: char) -> Option<&str> {
    if expr.len() >= 2 && expr.starts_with(delimiter) && expr.ends_with(delimiter) {
        Some(&expr[1..expr.len() - 1])
    } else {
        None
    }
}

fn resolve_json_path(json: &JsonValue, path: &str) -> Option<String> {
    let mut current = json;

    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }

        // Handle array indexing like "items.0" or "items[0]"
        let (key, index) = if let Some(bracket_pos) = part.find('[') {
            let key = &part[..bracket_pos];
            let idx_str = part[bracket_pos + 1..].trim_end_matches(']');
            let idx: usize = idx_str.parse().ok()?;
            (key, Some(idx))
        } else if let Ok(idx) = part.parse::<usize>() {
            ("", Some(idx))
        } else {
            (part, None)
        };

        if !key.is_empty() {
            current = current.get(key)?;
        }

        if let Some(idx) = index {
            current = current.get(idx)?;
        }
    }

    Some(render(current))
}

/// Render a JSON value as substitution text.
pub fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => "null".to_string(),
        other => other.to_string(),
    }
}
