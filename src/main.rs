//! linewright CLI entry point.
//!
//! Reads a text, applies the configured rules and prints the rewritten text.

use anyhow::{bail, Context, Result};
use clap::Parser;
use linewright::{CompiledRule, LinewrightConfig, RuleEngine};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "linewright")]
#[command(author, version, about = "Rule-driven text rewriting with HTTP middlewares")]
struct Args {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input text file (defaults to stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the status log to stderr after the run
    #[arg(long)]
    status: bool,

    /// Middleware call timeout in milliseconds (overrides the configuration)
    #[arg(long, env = "LINEWRIGHT_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Validate configuration and exit.
    #[arg(long)]
    validate: bool,
}

fn print_example_config() {
    let example = r#"# linewright configuration example
version: "1"

settings:
  # Timeout for each middleware call (ms)
  timeout_ms: 1000
  # Highest HTTP status accepted from a middleware
  max_success_status: 205

rules:
  # Replace the first match on every matching line
  - name: "rename"
    sourceSearchPattern: "Name: (.*)"
    replaceType: line
    value: "Name: Bob"

  # Rewrite the next END line after each START line
  - name: "close-block"
    sourceSearchPattern: { pattern: "^start$", flags: "i" }
    replaceType: occurrence
    targetSearchPattern: "^END$"
    location: next
    value: "DONE"

  # Resolve a user name through a middleware
  - name: "resolve-user"
    sourceSearchPattern: "user: (\\d+)"
    replaceType: line
    middlewareIndex: 0

middlewares:
  - name: "users"
    request:
      url: "http://localhost:8080/users"
      method: GET
      queryString: "id="
      headers:
        - name: "Authorization"
          value: "Bearer change-me"
    response:
      responseMap: "user: ${response.name}"
"#;
    println!("{}", example);
}

fn load_config(path: &Path) -> Result<LinewrightConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = if path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml")
    {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML configuration: {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON configuration: {}", path.display()))?
    };

    Ok(config)
}

/// Compile every rule and check its middleware reference.
fn validate(config: &LinewrightConfig) -> Result<()> {
    let mut problems = 0;

    for rule in &config.rules {
        let compiled = match CompiledRule::compile(rule) {
            Ok(compiled) => compiled,
            Err(e) => {
                error!(rule = %rule.name, error = %e, "Invalid rule");
                problems += 1;
                continue;
            }
        };

        for pattern in std::iter::once(&compiled.source).chain(compiled.target()) {
            if let Some(e) = pattern.error() {
                error!(rule = %rule.name, pattern = pattern.source(), error = %e, "Invalid pattern");
                problems += 1;
            }
        }

        if let Err(e) = compiled.middleware(&config.middlewares) {
            error!(rule = %rule.name, error = %e, "Invalid middleware reference");
            problems += 1;
        }
    }

    if problems > 0 {
        bail!("Configuration has {} problem(s)", problems);
    }
    Ok(())
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file: {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read input from stdin")?;
            Ok(text)
        }
    }
}

fn write_output(path: Option<&Path>, text: &str) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("Failed to write output file: {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(text.as_bytes())
                .and_then(|_| stdout.flush())
                .context("Failed to write output to stdout")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout carries only the rewritten text
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Print example config if requested
    if args.example_config {
        print_example_config();
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => LinewrightConfig::default(),
    };

    // Override timeout from CLI
    if let Some(timeout_ms) = args.timeout_ms {
        config.settings.timeout_ms = timeout_ms;
    }

    // Validate only if requested
    if args.validate {
        validate(&config)?;
        info!(rules = config.rules.len(), "Configuration is valid");
        return Ok(());
    }

    let engine = RuleEngine::new(&config.settings).context("Failed to create rule engine")?;
    let text = read_input(args.input.as_deref())?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    info!(
        config = ?args.config,
        rules = config.rules.len(),
        middlewares = config.middlewares.len(),
        "Running rules"
    );

    let outcome = engine
        .run_with_cancel(&text, &config.rules, &config.middlewares, &cancel)
        .await;

    if args.status {
        for entry in outcome.status.entries() {
            eprintln!("{}", entry);
        }
    }

    if outcome.cancelled {
        bail!("Run cancelled; no output written");
    }

    write_output(args.output.as_deref(), &outcome.text)?;

    info!(
        lines_rewritten = outcome.stats.lines_rewritten,
        line_failures = outcome.stats.line_failures,
        "Run complete"
    );

    Ok(())
}
