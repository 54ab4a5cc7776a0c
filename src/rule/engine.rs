//! The rule engine: applies rules to a text one pass at a time.

use super::buffer::{LineBuffer, WriteSet};
use super::{CompiledRule, ReplaceMode, RuleError, Substitution};
use crate::config::{LinewrightConfig, Location, Middleware, Rule, Settings};
use crate::middleware::{HttpMiddlewareClient, MiddlewareClient, MiddlewareError, MiddlewareResolver};
use crate::pattern::Pattern;
use crate::status::StatusLog;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors constructing the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Middleware client error: {0}")]
    Middleware(#[from] MiddlewareError),
}

/// Failure while processing a single line. Recorded, never propagated.
///
/// Status entries name the line 1-based: index 0 is logged as `line #1`.
#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error("run cancelled")]
    Cancelled,
}

/// Counters for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Rules whose pass completed
    pub rules_applied: usize,
    /// Rules rejected before their pass
    pub rules_skipped: usize,
    /// Lines rewritten across all passes
    pub lines_rewritten: usize,
    /// Line failures across all passes
    pub line_failures: usize,
}

/// The result of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Text after the last completed rule
    pub text: String,
    /// Everything recorded during the run; line numbers in messages are 1-based
    pub status: StatusLog,
    /// Whether the run stopped early on cancellation
    pub cancelled: bool,
    /// Run counters
    pub stats: RunStats,
}

/// Applies an ordered rule list to a text.
///
/// Each rule sees the complete output of the previous one. Within a rule,
/// lines are visited in ascending order and every line index is finalized
/// at most once.
pub struct RuleEngine<C = HttpMiddlewareClient> {
    resolver: MiddlewareResolver<C>,
}

impl RuleEngine<HttpMiddlewareClient> {
    /// Create an engine whose middlewares are called over HTTP.
    pub fn new(settings: &Settings) -> Result<Self, EngineError> {
        let resolver = MiddlewareResolver::from_settings(settings)?;
        Ok(Self { resolver })
    }
}

impl<C: MiddlewareClient> RuleEngine<C> {
    /// Create an engine over a custom middleware transport.
    pub fn with_client(client: C, settings: &Settings) -> Self {
        Self {
            resolver: MiddlewareResolver::with_client(client, settings),
        }
    }

    /// Run the rules and middlewares of a configuration.
    pub async fn run_config(&self, source: &str, config: &LinewrightConfig) -> RunOutcome {
        self.run(source, &config.rules, &config.middlewares).await
    }

    /// Apply `rules` to `source` in order.
    pub async fn run(&self, source: &str, rules: &[Rule], middlewares: &[Middleware]) -> RunOutcome {
        self.run_with_cancel(source, rules, middlewares, &CancellationToken::new())
            .await
    }

    /// Apply `rules` to `source`, stopping early when `cancel` fires.
    ///
    /// A rule interrupted by cancellation contributes nothing: the outcome
    /// holds the text produced by the last completed rule.
    pub async fn run_with_cancel(
        &self,
        source: &str,
        rules: &[Rule],
        middlewares: &[Middleware],
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut status = StatusLog::new();
        let mut stats = RunStats::default();
        let mut text = source.to_string();
        let mut cancelled = false;

        info!(
            rules = rules.len(),
            middlewares = middlewares.len(),
            "Starting rewrite run"
        );

        for rule in rules {
            if cancel.is_cancelled() {
                status.push(format!("Run cancelled before rule {}", rule.name));
                cancelled = true;
                break;
            }

            let compiled = match CompiledRule::compile(rule) {
                Ok(compiled) => compiled,
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "Rejected rule");
                    status.push(format!("Rule {} failed: {}", rule.name, e));
                    stats.rules_skipped += 1;
                    continue;
                }
            };

            match self
                .apply_rule(&text, &compiled, middlewares, &mut status, &mut stats, cancel)
                .await
            {
                Some(output) => {
                    text = output;
                    stats.rules_applied += 1;
                }
                None => {
                    status.push(format!(
                        "Run cancelled during rule {}; its changes were discarded",
                        compiled.name
                    ));
                    cancelled = true;
                    break;
                }
            }
        }

        info!(
            rules_applied = stats.rules_applied,
            rules_skipped = stats.rules_skipped,
            lines_rewritten = stats.lines_rewritten,
            line_failures = stats.line_failures,
            cancelled,
            "Finished rewrite run"
        );

        RunOutcome {
            text,
            status,
            cancelled,
            stats,
        }
    }

    /// One pass of one rule over `text`. Returns `None` if cancelled.
    async fn apply_rule(
        &self,
        text: &str,
        rule: &CompiledRule,
        middlewares: &[Middleware],
        status: &mut StatusLog,
        stats: &mut RunStats,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let buffer = LineBuffer::split(text);
        let mut writes = WriteSet::new(buffer.len());

        debug!(rule = %rule.name, lines = buffer.len(), "Applying rule");

        for pattern in std::iter::once(&rule.source).chain(rule.target()) {
            if let Some(error) = pattern.error() {
                status.push(format!(
                    "Rule {}: pattern `{}` is unusable: {}",
                    rule.name,
                    pattern.source(),
                    error
                ));
            }
        }

        for i in 0..buffer.len() {
            if writes.is_marked(i) {
                continue;
            }

            if cancel.is_cancelled() {
                return None;
            }

            status.push(format!("Processed line {} of {}", i + 1, buffer.len()));

            let result = self
                .process_line(&buffer, &mut writes, i, rule, middlewares, status, cancel)
                .await;

            status.extend(rule.source.take_diagnostics());
            if let Some(target) = rule.target() {
                status.extend(target.take_diagnostics());
            }

            match result {
                Ok(()) => {}
                Err(LineError::Cancelled) => return None,
                Err(e) => {
                    warn!(rule = %rule.name, line = i + 1, error = %e, "Line failed");
                    status.push(format!("Rule {} failed on line #{}: {}", rule.name, i + 1, e));
                    stats.line_failures += 1;
                    writes.keep(i);
                }
            }
        }

        stats.lines_rewritten += writes.rewritten();
        debug!(rule = %rule.name, rewritten = writes.rewritten(), "Rule applied");

        Some(buffer.join_with(&writes))
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_line(
        &self,
        buffer: &LineBuffer,
        writes: &mut WriteSet,
        i: usize,
        rule: &CompiledRule,
        middlewares: &[Middleware],
        status: &mut StatusLog,
        cancel: &CancellationToken,
    ) -> Result<(), LineError> {
        let line = buffer.content(i).unwrap_or_default();
        let found = rule.source.find(line);
        let matched = !found.is_empty();

        // A match whose first group is blank carries nothing to act on
        if matched && rule.source.group_count() > 0 && found[1].trim().is_empty() {
            writes.keep(i);
            return Ok(());
        }

        match &rule.mode {
            ReplaceMode::Line => {
                if !matched {
                    writes.keep(i);
                    return Ok(());
                }
                let replaced = self
                    .substitute(rule, &rule.source, line, middlewares, cancel)
                    .await?;
                writes.rewrite(i, replaced);
            }
            ReplaceMode::Occurrence { target, location } => {
                writes.keep(i);
                if !matched {
                    return Ok(());
                }

                let Some(t) = find_target(buffer, target, i, *location) else {
                    status.push(format!(
                        "Rule {}: no {} line matches `{}` for line #{}",
                        rule.name,
                        direction(*location),
                        target.source(),
                        i + 1
                    ));
                    return Ok(());
                };

                if writes.is_rewritten(t) {
                    status.push(format!(
                        "Rule {}: line #{} was already rewritten in this pass, skipping for line #{}",
                        rule.name,
                        t + 1,
                        i + 1
                    ));
                    return Ok(());
                }

                let target_line = buffer.content(t).unwrap_or_default();
                let replaced = self
                    .substitute(rule, target, target_line, middlewares, cancel)
                    .await?;
                writes.rewrite(t, replaced);
                debug!(rule = %rule.name, anchor = i + 1, target = t + 1, "Rewrote occurrence");
            }
        }

        Ok(())
    }

    /// Replace the first match of `pattern` in `line` with the rule's value.
    async fn substitute(
        &self,
        rule: &CompiledRule,
        pattern: &Pattern,
        line: &str,
        middlewares: &[Middleware],
        cancel: &CancellationToken,
    ) -> Result<String, LineError> {
        match &rule.substitution {
            Substitution::Value(value) => Ok(pattern.replace_first(line, value)),
            Substitution::Middleware(_) => {
                let middleware = rule
                    .middleware(middlewares)?
                    .ok_or(RuleError::MissingSubstitution)?;
                let groups = pattern.captures(line);

                let value = tokio::select! {
                    _ = cancel.cancelled() => return Err(LineError::Cancelled),
                    resolved = self.resolver.resolve(middleware, &groups) => resolved?,
                };

                Ok(pattern.replace_first_verbatim(line, &value))
            }
        }
    }
}

/// Index of the nearest line after (or before) `anchor` matching `target`.
fn find_target(
    buffer: &LineBuffer,
    target: &Pattern,
    anchor: usize,
    location: Location,
) -> Option<usize> {
    let matches = |j: &usize| buffer.content(*j).is_some_and(|line| target.test(line));
    match location {
        Location::Next => (anchor + 1..buffer.len()).find(matches),
        Location::Previous => (0..anchor).rev().find(matches),
    }
}

fn direction(location: Location) -> &'static str {
    match location {
        Location::Next => "following",
        Location::Previous => "preceding",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        MiddlewareRequest, MiddlewareResponse, PatternSpec, ReplaceType, RequestMethod,
    };
    use crate::middleware::{MiddlewareReply, OutboundRequest};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers every call from a fixed table keyed by the request query.
    struct StubClient {
        status: u16,
        answers: HashMap<String, serde_json::Value>,
        calls: Mutex<Vec<OutboundRequest>>,
    }

    impl StubClient {
        fn new(status: u16, answers: &[(&str, serde_json::Value)]) -> Self {
            Self {
                status,
                answers: answers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MiddlewareClient for StubClient {
        async fn dispatch(
            &self,
            request: &OutboundRequest,
        ) -> Result<MiddlewareReply, MiddlewareError> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(MiddlewareReply {
                status: self.status,
                headers: HashMap::new(),
                body: self
                    .answers
                    .get(&request.query)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            })
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    /// Never answers; used to exercise cancellation.
    struct HangingClient;

    #[async_trait]
    impl MiddlewareClient for HangingClient {
        async fn dispatch(
            &self,
            _request: &OutboundRequest,
        ) -> Result<MiddlewareReply, MiddlewareError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    fn line_rule(name: &str, source: &str, value: &str) -> Rule {
        Rule {
            name: name.to_string(),
            source_search_pattern: PatternSpec::from(source),
            replace_type: ReplaceType::Line,
            value: Some(value.to_string()),
            middleware_index: None,
            target_search_pattern: None,
            location: None,
        }
    }

    fn occurrence_rule(source: &str, target: &str, location: Location, value: &str) -> Rule {
        Rule {
            name: "occurrence".to_string(),
            source_search_pattern: PatternSpec::from(source),
            replace_type: ReplaceType::Occurrence,
            value: Some(value.to_string()),
            middleware_index: None,
            target_search_pattern: Some(PatternSpec::from(target)),
            location: Some(location),
        }
    }

    fn lookup_middleware() -> Middleware {
        Middleware {
            name: "lookup".to_string(),
            request: MiddlewareRequest {
                url: "http://lookup.test/users".to_string(),
                method: RequestMethod::Get,
                query_string: Some("id=".to_string()),
                body: None,
                headers: vec![],
            },
            response: MiddlewareResponse {
                response_map: "response.name".to_string(),
                headers: vec![],
            },
        }
    }

    fn engine() -> RuleEngine<StubClient> {
        RuleEngine::with_client(StubClient::new(200, &[]), &Settings::default())
    }

    #[tokio::test]
    async fn test_no_rules_returns_source() {
        let outcome = engine().run("a\r\nb", &[], &[]).await;
        assert_eq!(outcome.text, "a\r\nb");
        assert!(outcome.status.is_empty());
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_line_replace() {
        let rules = vec![line_rule("rename", "Name: (.*)", "Name: Bob")];
        let outcome = engine().run("Name: Alice\nAge: 30\n", &rules, &[]).await;

        assert_eq!(outcome.text, "Name: Bob\nAge: 30\n");
        assert!(outcome.status.contains("Processed line 1 of 2"));
        assert!(outcome.status.contains("Processed line 2 of 2"));
        assert_eq!(outcome.stats.lines_rewritten, 1);
    }

    #[tokio::test]
    async fn test_line_replace_first_match_only() {
        let rules = vec![line_rule("first", r"(\d+)", "N")];
        let outcome = engine().run("1 2 3\n", &rules, &[]).await;
        assert_eq!(outcome.text, "N 2 3\n");
    }

    #[tokio::test]
    async fn test_literal_value_expands_groups() {
        let rules = vec![line_rule("swap", r"(\w+)=(\w+)", "$2=$1")];
        let outcome = engine().run("key=value\n", &rules, &[]).await;
        assert_eq!(outcome.text, "value=key\n");
    }

    #[tokio::test]
    async fn test_literal_value_keeps_dollar_text() {
        let rules = vec![
            line_rule("price", "Price: (.*)", "Price: $5"),
            line_rule("total", "Total", "Cost: $100 USD"),
            line_rule("id", r"id=(\d+)", "$1x"),
        ];
        let outcome = engine()
            .run("Price: 3\nTotal\nid=7\n", &rules, &[])
            .await;
        assert_eq!(outcome.text, "Price: $5\nCost: $100 USD\n7x\n");
    }

    #[tokio::test]
    async fn test_no_op_rule() {
        let text = "alpha\r\nbeta\ngamma";
        let rules = vec![line_rule("nothing", "delta", "x")];
        let outcome = engine().run(text, &rules, &[]).await;
        assert_eq!(outcome.text, text);
        assert_eq!(outcome.stats.lines_rewritten, 0);
    }

    #[tokio::test]
    async fn test_empty_capture_guard() {
        let rules = vec![line_rule("guard", "Name:(.*)", "Name: Bob")];
        let outcome = engine().run("Name:   \nName: Eve\n", &rules, &[]).await;
        assert_eq!(outcome.text, "Name:   \nName: Bob\n");
    }

    #[tokio::test]
    async fn test_rules_apply_in_order() {
        let rules = vec![
            line_rule("first", "a", "b"),
            line_rule("second", "b", "c"),
        ];
        let outcome = engine().run("a\n", &rules, &[]).await;
        assert_eq!(outcome.text, "c\n");
        assert_eq!(outcome.stats.rules_applied, 2);
    }

    #[tokio::test]
    async fn test_occurrence_next() {
        let rules = vec![occurrence_rule("START", "END", Location::Next, "DONE")];
        let outcome = engine().run("START\nfiller\nEND\n", &rules, &[]).await;
        assert_eq!(outcome.text, "START\nfiller\nDONE\n");
    }

    #[tokio::test]
    async fn test_occurrence_next_only_nearest() {
        let rules = vec![occurrence_rule("START", "END", Location::Next, "DONE")];
        let outcome = engine().run("START\nEND\nEND\n", &rules, &[]).await;
        assert_eq!(outcome.text, "START\nDONE\nEND\n");
    }

    #[tokio::test]
    async fn test_occurrence_previous() {
        let rules = vec![occurrence_rule("START", "END", Location::Previous, "DONE")];
        let outcome = engine()
            .run("END\nEND\nmiddle\nSTART\n", &rules, &[])
            .await;
        assert_eq!(outcome.text, "END\nDONE\nmiddle\nSTART\n");
    }

    #[tokio::test]
    async fn test_occurrence_no_target() {
        let text = "START\nfiller\nfiller2\n";
        let rules = vec![occurrence_rule("START", "END", Location::Next, "DONE")];
        let outcome = engine().run(text, &rules, &[]).await;

        assert_eq!(outcome.text, text);
        assert!(outcome.status.contains("no following line matches `END`"));
        assert_eq!(outcome.stats.line_failures, 0);
    }

    #[tokio::test]
    async fn test_occurrence_target_written_once() {
        // Both anchors find the same END line; only the first rewrites it
        let rules = vec![occurrence_rule("START", "END", Location::Next, "DONE")];
        let outcome = engine().run("START\nSTART\nEND\n", &rules, &[]).await;

        assert_eq!(outcome.text, "START\nSTART\nDONE\n");
        assert_eq!(outcome.stats.lines_rewritten, 1);
    }

    #[tokio::test]
    async fn test_occurrence_previous_single_write() {
        let rules = vec![occurrence_rule("START", "END", Location::Previous, "DONE")];
        let outcome = engine().run("END\nSTART\nSTART\n", &rules, &[]).await;

        assert_eq!(outcome.text, "DONE\nSTART\nSTART\n");
        assert!(outcome.status.contains("line #1 was already rewritten"));
    }

    #[tokio::test]
    async fn test_rewritten_target_is_not_reprocessed() {
        // The rewritten target also matches the anchor pattern but is skipped
        let rules = vec![occurrence_rule("(START|END)", "END", Location::Next, "START")];
        let outcome = engine().run("START\nEND\nEND\n", &rules, &[]).await;
        assert_eq!(outcome.text, "START\nSTART\nEND\n");
    }

    #[tokio::test]
    async fn test_invalid_rule_is_skipped() {
        let mut broken = occurrence_rule("START", "END", Location::Next, "DONE");
        broken.name = "broken".to_string();
        broken.location = None;
        let rules = vec![broken, line_rule("after", "START", "BEGIN")];

        let outcome = engine().run("START\nEND\n", &rules, &[]).await;

        assert_eq!(outcome.text, "BEGIN\nEND\n");
        assert!(outcome
            .status
            .contains("Rule broken failed: occurrence rule has no location"));
        assert_eq!(outcome.stats.rules_skipped, 1);
        assert_eq!(outcome.stats.rules_applied, 1);
    }

    #[tokio::test]
    async fn test_invalid_pattern_degrades() {
        let rules = vec![line_rule("bad", "(unclosed", "x")];
        let outcome = engine().run("(unclosed\n", &rules, &[]).await;

        assert_eq!(outcome.text, "(unclosed\n");
        assert!(outcome.status.contains("pattern `(unclosed` is unusable"));
        assert!(outcome.status.contains("Regular expression is not valid"));
    }

    #[tokio::test]
    async fn test_middleware_substitution() {
        let client = StubClient::new(
            200,
            &[("id=7", serde_json::json!({"name": "Grace"}))],
        );
        let engine = RuleEngine::with_client(client, &Settings::default());
        let mut rule = line_rule("resolve", r"user: (\d+)", "unused");
        rule.value = None;
        rule.middleware_index = Some(0);

        let outcome = engine
            .run("user: 7\nuser: none\n", &[rule], &[lookup_middleware()])
            .await;

        assert_eq!(outcome.text, "Grace\nuser: none\n");
        assert_eq!(engine.resolver.client().call_count(), 1);
    }

    #[tokio::test]
    async fn test_occurrence_middleware_uses_target_groups() {
        let client = StubClient::new(
            200,
            &[("id=9", serde_json::json!({"name": "Linus"}))],
        );
        let engine = RuleEngine::with_client(client, &Settings::default());
        let rule = Rule {
            name: "owner".to_string(),
            source_search_pattern: PatternSpec::from("^owner:"),
            replace_type: ReplaceType::Occurrence,
            value: None,
            middleware_index: Some(0),
            target_search_pattern: Some(PatternSpec::from(r"id (\d+)")),
            location: Some(Location::Next),
        };

        let outcome = engine
            .run("owner:\nid 9\n", &[rule], &[lookup_middleware()])
            .await;

        assert_eq!(outcome.text, "owner:\nLinus\n");
    }

    #[tokio::test]
    async fn test_middleware_failure_keeps_line() {
        let engine = RuleEngine::with_client(StubClient::new(500, &[]), &Settings::default());
        let mut rule = line_rule("lookup-user", r"user: (\d+)", "unused");
        rule.value = None;
        rule.middleware_index = Some(0);

        let outcome = engine
            .run("header\nuser: 7\nfooter\n", &[rule], &[lookup_middleware()])
            .await;

        assert_eq!(outcome.text, "header\nuser: 7\nfooter\n");
        assert!(outcome.status.contains("Rule lookup-user failed on line #2"));
        assert!(outcome.status.contains("status 500"));
        assert_eq!(outcome.stats.line_failures, 1);
        // Processing continued after the failure
        assert!(outcome.status.contains("Processed line 3 of 3"));
    }

    #[tokio::test]
    async fn test_dangling_middleware_reference() {
        let mut rule = line_rule("dangling", "x", "unused");
        rule.value = None;
        rule.middleware_index = Some(3);

        let outcome = engine().run("x\ny\n", &[rule], &[]).await;

        assert_eq!(outcome.text, "x\ny\n");
        assert!(outcome
            .status
            .contains("Rule dangling failed on line #1: middleware #3 is not registered"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rules = vec![line_rule("rename", "a", "b")];

        let outcome = engine()
            .run_with_cancel("a\n", &rules, &[], &cancel)
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.text, "a\n");
        assert!(outcome.status.contains("Run cancelled before rule rename"));
    }

    #[tokio::test]
    async fn test_cancel_during_middleware_call_discards_rule() {
        let engine = RuleEngine::with_client(HangingClient, &Settings::default());
        let mut hanging = line_rule("hanging", "(b)", "unused");
        hanging.value = None;
        hanging.middleware_index = Some(0);
        let rules = vec![line_rule("first", "a", "A"), hanging];
        let middlewares = vec![lookup_middleware()];

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = engine
            .run_with_cancel("a\nb\n", &rules, &middlewares, &cancel)
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.text, "A\nb\n");
        assert!(outcome.status.contains("Run cancelled during rule hanging"));
        assert_eq!(outcome.stats.rules_applied, 1);
    }
}
