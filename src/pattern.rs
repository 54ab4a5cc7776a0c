//! Pattern validation and safe matching.
//!
//! A [`Pattern`] never fails outward. If its definition does not compile, the
//! pattern is marked invalid for good and every operation degrades to an empty
//! result while recording a diagnostic that the engine later moves into the
//! run's status log.

use crate::config::PatternSpec;
use crate::status::StatusEntry;
use regex::{Captures, NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::warn;

/// Matching modifiers, stored as explicit state at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternFlags {
    /// Multi-match scanning (`g`); required by [`Pattern::match_all`]
    pub global: bool,
    /// Case-insensitive matching (`i`)
    pub case_insensitive: bool,
    /// `^`/`$` match at line boundaries (`m`)
    pub multi_line: bool,
    /// `.` matches newlines (`s`)
    pub dot_all: bool,
    /// Insignificant whitespace and `#` comments (`x`)
    pub ignore_whitespace: bool,
}

impl PatternFlags {
    /// Parse a flag string such as `"gi"`.
    ///
    /// `u` is accepted and ignored since matching is always Unicode-aware.
    pub fn parse(flags: &str) -> Result<Self, PatternError> {
        let mut parsed = Self::default();
        for c in flags.chars() {
            match c {
                'g' => parsed.global = true,
                'i' => parsed.case_insensitive = true,
                'm' => parsed.multi_line = true,
                's' => parsed.dot_all = true,
                'x' => parsed.ignore_whitespace = true,
                'u' => {}
                other => return Err(PatternError::UnsupportedFlag(other)),
            }
        }
        Ok(parsed)
    }
}

/// Pattern diagnostics. These are recorded, never returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Regular expression is not valid: {0}")]
    Invalid(String),

    #[error("Regular expression has no global flag")]
    NonGlobal,

    #[error("Couldn't find any groups in the regular expression")]
    NoGroups,

    #[error("Unsupported regular expression flag '{0}'")]
    UnsupportedFlag(char),
}

/// A validated regular expression with explicit flags.
#[derive(Debug)]
pub struct Pattern {
    source: String,
    flags: PatternFlags,
    regex: Option<Regex>,
    error: Option<PatternError>,
    diagnostics: Mutex<Vec<StatusEntry>>,
}

impl Pattern {
    /// Compile a bare pattern with no flags.
    pub fn new(source: &str) -> Self {
        Self::build(source, Ok(PatternFlags::default()))
    }

    /// Compile a pattern with a flag string such as `"gi"`.
    pub fn with_flags(source: &str, flags: &str) -> Self {
        Self::build(source, PatternFlags::parse(flags))
    }

    /// Compile a pattern from its configuration form.
    pub fn from_spec(spec: &PatternSpec) -> Self {
        match spec {
            PatternSpec::Bare(source) => Self::new(source),
            PatternSpec::Structured { pattern, flags } => Self::with_flags(pattern, flags),
        }
    }

    fn build(source: &str, flags: Result<PatternFlags, PatternError>) -> Self {
        let compiled = flags.and_then(|flags| {
            RegexBuilder::new(source)
                .case_insensitive(flags.case_insensitive)
                .multi_line(flags.multi_line)
                .dot_matches_new_line(flags.dot_all)
                .ignore_whitespace(flags.ignore_whitespace)
                .build()
                .map(|regex| (flags, regex))
                .map_err(|e| PatternError::Invalid(e.to_string()))
        });

        match compiled {
            Ok((flags, regex)) => Self {
                source: source.to_string(),
                flags,
                regex: Some(regex),
                error: None,
                diagnostics: Mutex::new(Vec::new()),
            },
            Err(error) => {
                warn!(pattern = source, error = %error, "Pattern failed to compile");
                Self {
                    source: source.to_string(),
                    flags: PatternFlags::default(),
                    regex: None,
                    error: Some(error),
                    diagnostics: Mutex::new(Vec::new()),
                }
            }
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn flags(&self) -> PatternFlags {
        self.flags
    }

    pub fn is_valid(&self) -> bool {
        self.regex.is_some()
    }

    pub fn is_global(&self) -> bool {
        self.flags.global
    }

    /// The compile error, if the pattern is invalid.
    pub fn error(&self) -> Option<&PatternError> {
        self.error.as_ref()
    }

    /// Number of capture groups, excluding the whole match.
    pub fn group_count(&self) -> usize {
        self.regex
            .as_ref()
            .map(|r| r.captures_len().saturating_sub(1))
            .unwrap_or(0)
    }

    /// Capture-group placeholders: the group name for named groups, `$n` otherwise.
    pub fn groups(&self) -> Vec<String> {
        let Some(regex) = self.valid_regex() else {
            return Vec::new();
        };

        let groups: Vec<String> = regex
            .capture_names()
            .enumerate()
            .skip(1)
            .map(|(i, name)| match name {
                Some(name) => name.to_string(),
                None => format!("${}", i),
            })
            .collect();

        if groups.is_empty() {
            self.report(PatternError::NoGroups);
        }
        groups
    }

    /// First match: the whole match followed by every group.
    ///
    /// Groups that did not participate are returned as empty strings. Returns
    /// an empty vector when nothing matches.
    pub fn find(&self, text: &str) -> Vec<String> {
        let Some(regex) = self.valid_regex() else {
            return Vec::new();
        };

        regex
            .captures(text)
            .map(|caps| {
                caps.iter()
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Capture groups of the first match, excluding the whole match.
    pub fn captures(&self, text: &str) -> Vec<String> {
        let mut found = self.find(text);
        if !found.is_empty() {
            found.remove(0);
        }
        found
    }

    /// Every match with its groups. Requires the global flag.
    pub fn match_all(&self, text: &str) -> Vec<Vec<String>> {
        let Some(regex) = self.valid_regex() else {
            return Vec::new();
        };

        if !self.flags.global {
            self.report(PatternError::NonGlobal);
            return Vec::new();
        }

        regex
            .captures_iter(text)
            .map(|caps| {
                caps.iter()
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect()
            })
            .collect()
    }

    pub fn test(&self, text: &str) -> bool {
        self.valid_regex().is_some_and(|r| r.is_match(text))
    }

    /// Replace the first match, expanding group references in `replacement`.
    ///
    /// Recognized references: `$$`, `$&`, `` $` ``, `$'`, `$n`/`$nn` for an
    /// existing group, and `${name}`/`$<name>` for an existing named group
    /// (`${n}` also accepts a group number). Anything else is kept literally.
    pub fn replace_first(&self, text: &str, replacement: &str) -> String {
        let Some(regex) = self.valid_regex() else {
            return text.to_string();
        };
        let Some(caps) = regex.captures(text) else {
            return text.to_string();
        };
        let Some(whole) = caps.get(0) else {
            return text.to_string();
        };

        let expanded = expand_replacement(replacement, regex, &caps, text);
        format!("{}{}{}", &text[..whole.start()], expanded, &text[whole.end()..])
    }

    /// Replace the first match with the replacement inserted as-is.
    pub fn replace_first_verbatim(&self, text: &str, replacement: &str) -> String {
        match self.valid_regex() {
            Some(regex) => regex.replacen(text, 1, NoExpand(replacement)).into_owned(),
            None => text.to_string(),
        }
    }

    /// Move out every diagnostic recorded so far.
    pub fn take_diagnostics(&self) -> Vec<StatusEntry> {
        let mut diagnostics = self
            .diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *diagnostics)
    }

    fn valid_regex(&self) -> Option<&Regex> {
        if self.regex.is_none() {
            let error = self
                .error
                .clone()
                .unwrap_or_else(|| PatternError::Invalid(self.source.clone()));
            self.report(error);
        }
        self.regex.as_ref()
    }

    fn report(&self, error: PatternError) {
        warn!(pattern = %self.source, error = %error, "Pattern diagnostic");
        let entry = StatusEntry::now(format!("Pattern `{}`: {}", self.source, error));
        self.diagnostics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }
}

/// Expand a literal replacement against a match. Unknown references stay
/// literal text.
fn expand_replacement(template: &str, regex: &Regex, caps: &Captures<'_>, haystack: &str) -> String {
    let bytes = template.as_bytes();
    let group_count = caps.len().saturating_sub(1);
    let group = |n: usize| caps.get(n).map_or("", |m| m.as_str());
    let digit = |at: usize| {
        bytes
            .get(at)
            .filter(|b| b.is_ascii_digit())
            .map(|b| usize::from(b - b'0'))
    };

    let mut out = String::with_capacity(template.len());
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        out.push_str(&template[literal_start..i]);

        let (expansion, width) = match bytes.get(i + 1) {
            Some(b'$') => (Some("$"), 2),
            Some(b'&') => (caps.get(0).map(|m| m.as_str()), 2),
            Some(b'`') => (caps.get(0).map(|m| &haystack[..m.start()]), 2),
            Some(b'\'') => (caps.get(0).map(|m| &haystack[m.end()..]), 2),
            Some(b) if b.is_ascii_digit() => {
                let one = usize::from(b - b'0');
                match digit(i + 2).map(|d| one * 10 + d) {
                    Some(two) if (1..=group_count).contains(&two) => (Some(group(two)), 3),
                    _ if (1..=group_count).contains(&one) => (Some(group(one)), 2),
                    _ => (None, 1),
                }
            }
            Some(open @ (b'{' | b'<')) => {
                let close = if *open == b'{' { '}' } else { '>' };
                match template[i + 2..].find(close) {
                    Some(len) => {
                        let name = &template[i + 2..i + 2 + len];
                        let named = regex.capture_names().flatten().any(|n| n == name);
                        let numbered = (*open == b'{')
                            .then(|| name.parse::<usize>().ok())
                            .flatten()
                            .filter(|n| (1..=group_count).contains(n));
                        if named {
                            (Some(caps.name(name).map_or("", |m| m.as_str())), len + 3)
                        } else if let Some(n) = numbered {
                            (Some(group(n)), len + 3)
                        } else {
                            (None, 1)
                        }
                    }
                    None => (None, 1),
                }
            }
            _ => (None, 1),
        };

        match expansion {
            Some(value) => out.push_str(value),
            None => out.push('$'),
        }
        i += width;
        literal_start = i;
    }

    out.push_str(&template[literal_start..]);
    out
}
