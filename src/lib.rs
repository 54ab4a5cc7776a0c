//! Rule-driven text rewriting with HTTP-backed value middlewares.
//!
//! A run takes a text, an ordered rule list and a middleware registry and
//! produces the rewritten text plus a timestamped status log:
//!
//! - Line rules rewrite the first match on each matching line
//! - Occurrence rules rewrite the nearest following or preceding line that
//!   matches a second pattern
//! - Substitution values are literals or come from a middleware: an HTTP call
//!   built from the match's capture groups whose response is mapped through a
//!   restricted path/template evaluator
//! - Failures are recorded per line and never abort the run
//!
//! ## Configuration Example
//!
//! ```yaml
//! rules:
//!   - name: "rename"
//!     sourceSearchPattern: "Name: (.*)"
//!     replaceType: line
//!     value: "Name: Bob"
//!   - name: "resolve-owner"
//!     sourceSearchPattern: "^owner:"
//!     replaceType: occurrence
//!     targetSearchPattern: "id=(\\d+)"
//!     location: next
//!     middlewareIndex: 0
//! middlewares:
//!   - name: "users"
//!     request:
//!       url: "http://localhost:8080/users"
//!       method: GET
//!       queryString: "id="
//!     response:
//!       responseMap: "response.name"
//! ```

pub mod config;
pub mod context;
pub mod middleware;
pub mod pattern;
pub mod rule;
pub mod status;

pub use config::{LinewrightConfig, Middleware, Rule, Settings};
pub use middleware::{HttpMiddlewareClient, MiddlewareClient, MiddlewareError, MiddlewareResolver};
pub use pattern::{Pattern, PatternError, PatternFlags};
pub use rule::{CompiledRule, RuleEngine, RuleError, RunOutcome};
pub use status::{StatusEntry, StatusLog};
