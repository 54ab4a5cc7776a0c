//! Outbound request construction from a middleware template and capture groups.

use super::MiddlewareError;
use crate::config::{Middleware, RequestMethod};
use regex::{NoExpand, Regex};
use serde_json::Value as JsonValue;
use std::sync::LazyLock;
use tracing::debug;

/// Positional placeholders like `$1` in body templates.
static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\d+").unwrap());

/// A fully constructed middleware call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// HTTP method
    pub method: RequestMethod,
    /// Target URL as configured
    pub url: String,
    /// Encoded query string (without leading ?), empty when absent
    pub query: String,
    /// Request headers
    pub headers: Vec<(String, String)>,
    /// JSON body, if the template produced one
    pub body: Option<JsonValue>,
    /// Response headers to capture (lowercase names)
    pub response_headers: Vec<String>,
}

impl OutboundRequest {
    /// Build the request for a middleware from the capture groups of a match.
    ///
    /// `groups` excludes the whole-match element. Query and body templates are
    /// only applied when at least one group is present.
    pub fn build(middleware: &Middleware, groups: &[String]) -> Result<Self, MiddlewareError> {
        let request = &middleware.request;

        let query = match &request.query_string {
            Some(template) if !groups.is_empty() => build_query_string(template, groups),
            _ => String::new(),
        };

        let body = match &request.body {
            Some(template) if !groups.is_empty() => Some(build_body(template, groups)?),
            _ => None,
        };

        let headers = request
            .headers
            .iter()
            .filter_map(|h| match (&h.name, &h.value) {
                (Some(name), Some(value)) if !name.is_empty() => {
                    Some((name.clone(), value.clone()))
                }
                _ => None,
            })
            .collect();

        let response_headers = middleware
            .response
            .headers
            .iter()
            .filter_map(|h| h.name.as_ref())
            .filter(|name| !name.is_empty())
            .map(|name| name.to_lowercase())
            .collect();

        Ok(Self {
            method: request.method,
            url: request.url.clone(),
            query,
            headers,
            body,
            response_headers,
        })
    }

    /// The URL with the query string appended.
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, self.query)
    }
}

/// Pair the template's parameter keys with the groups, in order.
///
/// Pairs are form-encoded (spaces as `+`). A template whose key count differs
/// from the group count yields an empty query string.
pub fn build_query_string(template: &str, groups: &[String]) -> String {
    let keys: Vec<String> = template
        .trim_start_matches('?')
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let key = part.split_once('=').map(|(k, _)| k).unwrap_or(part);
            let key = key.replace('+', " ");
            urlencoding::decode(&key)
                .map(|k| k.into_owned())
                .unwrap_or_else(|_| key.clone())
        })
        .collect();

    if keys.len() != groups.len() {
        debug!(
            keys = keys.len(),
            groups = groups.len(),
            "Query template does not match capture groups, sending empty query"
        );
        return String::new();
    }

    keys.iter()
        .zip(groups)
        .map(|(key, value)| {
            format!("{}={}", form_encode(key), form_encode(value))
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn form_encode(component: &str) -> String {
    urlencoding::encode(component).replace("%20", "+")
}

/// Substitute groups into the top-level string fields of a JSON object template.
///
/// Every group is applied in turn to every field and replaces every remaining
/// `$<digits>` token, so once the first group has been applied no placeholder
/// is left for the others.
pub fn build_body(template: &str, groups: &[String]) -> Result<JsonValue, MiddlewareError> {
    let mut parsed: JsonValue = serde_json::from_str(template)
        .map_err(|e| MiddlewareError::BodyTemplate(e.to_string()))?;

    let JsonValue::Object(fields) = &mut parsed else {
        return Err(MiddlewareError::BodyTemplate(
            "body template must be a JSON object".to_string(),
        ));
    };

    for value in fields.values_mut() {
        if let JsonValue::String(text) = value {
            for group in groups {
                *text = PLACEHOLDER_REGEX
                    .replace_all(text, NoExpand(group))
                    .into_owned();
            }
        }
    }

    Ok(parsed)
}
