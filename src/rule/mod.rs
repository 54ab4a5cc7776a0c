//! Rule compilation and the rule engine.

mod buffer;
mod engine;

pub use buffer::{LineBuffer, LineEnding, Slot, WriteSet};
pub use engine::{EngineError, LineError, RuleEngine, RunOutcome, RunStats};

use crate::config::{Location, Middleware, ReplaceType, Rule};
use crate::pattern::Pattern;

/// Errors in a rule's shape or references.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule defines both a value and a middleware")]
    ConflictingSubstitution,

    #[error("rule defines neither a value nor a middleware")]
    MissingSubstitution,

    #[error("occurrence rule has no target search pattern")]
    MissingTargetPattern,

    #[error("occurrence rule has no location")]
    MissingLocation,

    #[error("middleware #{index} is not registered ({registered} available)")]
    UnknownMiddleware { index: usize, registered: usize },
}

/// Where the substitution value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    /// Literal value; may reference groups as `$1` or `${name}`
    Value(String),
    /// Index into the middleware registry
    Middleware(usize),
}

/// Which line a matching rule rewrites.
#[derive(Debug)]
pub enum ReplaceMode {
    /// The matching line itself
    Line,
    /// The nearest line in `location` direction matching `target`
    Occurrence { target: Pattern, location: Location },
}

/// A rule whose shape has been validated.
#[derive(Debug)]
pub struct CompiledRule {
    /// Rule name (for logging/debugging)
    pub name: String,
    /// Pattern selecting the lines this rule acts on
    pub source: Pattern,
    /// Replacement mode
    pub mode: ReplaceMode,
    /// Substitution source
    pub substitution: Substitution,
}

impl CompiledRule {
    /// Validate an authored rule.
    ///
    /// Patterns that fail to compile do not make the rule invalid; they are
    /// carried as invalid [`Pattern`]s whose operations never match.
    pub fn compile(rule: &Rule) -> Result<Self, RuleError> {
        let substitution = match (&rule.value, rule.middleware_index) {
            (Some(_), Some(_)) => return Err(RuleError::ConflictingSubstitution),
            (Some(value), None) => Substitution::Value(value.clone()),
            (None, Some(index)) => Substitution::Middleware(index),
            (None, None) => return Err(RuleError::MissingSubstitution),
        };

        let mode = match rule.replace_type {
            ReplaceType::Line => ReplaceMode::Line,
            ReplaceType::Occurrence => {
                let target = rule
                    .target_search_pattern
                    .as_ref()
                    .ok_or(RuleError::MissingTargetPattern)?;
                let location = rule.location.ok_or(RuleError::MissingLocation)?;
                ReplaceMode::Occurrence {
                    target: Pattern::from_spec(target),
                    location,
                }
            }
        };

        Ok(Self {
            name: rule.name.clone(),
            source: Pattern::from_spec(&rule.source_search_pattern),
            mode,
            substitution,
        })
    }

    /// The target pattern of an occurrence rule.
    pub fn target(&self) -> Option<&Pattern> {
        match &self.mode {
            ReplaceMode::Line => None,
            ReplaceMode::Occurrence { target, .. } => Some(target),
        }
    }

    /// Look up the middleware this rule refers to, if any.
    pub fn middleware<'a>(
        &self,
        middlewares: &'a [Middleware],
    ) -> Result<Option<&'a Middleware>, RuleError> {
        match self.substitution {
            Substitution::Value(_) => Ok(None),
            Substitution::Middleware(index) => middlewares
                .get(index)
                .map(Some)
                .ok_or(RuleError::UnknownMiddleware {
                    index,
                    registered: middlewares.len(),
                }),
        }
    }
}
