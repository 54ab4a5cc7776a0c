//! Configuration types for rules, middlewares and engine settings.

use serde::{Deserialize, Serialize};

/// Main configuration: the rule list and the middleware registry it refers to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinewrightConfig {
    /// Configuration version
    pub version: String,
    /// Global settings
    pub settings: Settings,
    /// Rewrite rules (applied in list order)
    pub rules: Vec<Rule>,
    /// Middleware registry (referenced by index from rules)
    pub middlewares: Vec<Middleware>,
}

impl Default for LinewrightConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: Settings::default(),
            rules: vec![],
            middlewares: vec![],
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Timeout for each middleware call (ms)
    pub timeout_ms: u64,
    /// Highest HTTP status treated as a successful middleware response
    pub max_success_status: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            max_success_status: 205,
        }
    }
}

/// A rewrite rule as authored.
///
/// The substitution source and the occurrence fields are optional here so that
/// any authored shape can be loaded; [`crate::rule::CompiledRule::compile`]
/// enforces which combinations are valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Rule name (for logging/debugging)
    pub name: String,
    /// Pattern that selects the lines this rule acts on
    #[serde(alias = "source_search_pattern", alias = "source")]
    pub source_search_pattern: PatternSpec,
    /// What gets rewritten when the source pattern matches
    #[serde(alias = "replace_type")]
    pub replace_type: ReplaceType,
    /// Literal substitution value
    #[serde(default)]
    pub value: Option<String>,
    /// Index of the middleware that resolves the substitution value
    #[serde(default, alias = "middleware_index", alias = "middleware")]
    pub middleware_index: Option<usize>,
    /// Pattern of the line rewritten by an occurrence rule
    #[serde(default, alias = "target_search_pattern", alias = "target")]
    pub target_search_pattern: Option<PatternSpec>,
    /// Scan direction of an occurrence rule
    #[serde(default)]
    pub location: Option<Location>,
}

/// A pattern definition: a bare expression or an expression with flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PatternSpec {
    /// Expression without flags
    Bare(String),
    /// Expression with a flag string such as `"gi"`
    Structured {
        pattern: String,
        #[serde(default)]
        flags: String,
    },
}

impl PatternSpec {
    /// The expression text.
    pub fn pattern(&self) -> &str {
        match self {
            Self::Bare(pattern) => pattern,
            Self::Structured { pattern, .. } => pattern,
        }
    }
}

impl From<&str> for PatternSpec {
    fn from(pattern: &str) -> Self {
        Self::Bare(pattern.to_string())
    }
}

/// Replacement mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceType {
    /// Rewrite the matching line itself
    Line,
    /// Rewrite the nearest line matching the target pattern
    Occurrence,
}

/// Scan direction for occurrence rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Next,
    Previous,
}

/// An HTTP-backed value resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Middleware {
    /// Middleware name
    pub name: String,
    /// Outbound request template
    pub request: MiddlewareRequest,
    /// Response mapping
    pub response: MiddlewareResponse,
}

/// HTTP method of a middleware call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
}

/// Request template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareRequest {
    /// Target URL
    pub url: String,
    /// HTTP method
    #[serde(default)]
    pub method: RequestMethod,
    /// Query-string template; its keys are paired with capture groups
    #[serde(default, alias = "query_string")]
    pub query_string: Option<String>,
    /// JSON object template with `$1..$N` placeholders
    #[serde(default)]
    pub body: Option<String>,
    /// Request headers
    #[serde(default)]
    pub headers: Vec<MiddlewareHeader>,
}

/// Response mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareResponse {
    /// Mapping expression evaluated against the bound response
    #[serde(alias = "response_map")]
    pub response_map: String,
    /// Response headers exposed to the mapping as `headers.<name>`
    #[serde(default)]
    pub headers: Vec<MiddlewareHeader>,
}

/// Header entry. Incomplete request entries are skipped.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MiddlewareHeader {
    /// Header name
    #[serde(default, alias = "type")]
    pub name: Option<String>,
    /// Header value
    #[serde(default)]
    pub value: Option<String>,
}

impl MiddlewareHeader {
    /// Create a complete header entry.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value.into()),
        }
    }
}
