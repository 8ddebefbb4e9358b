//! scriptbox - run untrusted scripts under a security policy
//!
//! ## Commands
//!
//! - `run`: execute a script file or inline script
//! - `history`: show recent executions
//! - `session`: inspect and edit session state
//! - `cleanup`: remove sessions idle for too long

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scriptbox_core::telemetry::init_tracing;
use scriptbox_core::{
    EngineConfig, ExecuteRequest, ExecutionResult, HistoryEntry, HistoryQuery, ScriptEngine,
    SessionId,
};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed script execution engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "SCRIPTBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script and print its result
    Run {
        /// Script file (`-` reads stdin)
        #[arg(required_unless_present = "eval", conflicts_with = "eval")]
        file: Option<PathBuf>,

        /// Inline script text
        #[arg(short = 'e', long = "eval")]
        eval: Option<String>,

        /// Security level (Minimal, Standard, Elevated, Maximum)
        #[arg(short, long, default_value = "Standard")]
        security: String,

        /// Custom policy file (JSON); requires `allow_custom_policies`
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Session whose state the script may read and write
        #[arg(long)]
        session: Option<String>,

        /// Timeout in seconds (clamped to the policy limit)
        #[arg(short, long, default_value = "30")]
        timeout: i64,

        /// Output format (plain, json, xml, yaml, table, csv, markdown)
        #[arg(short, long, default_value = "plain")]
        format: String,

        /// Script variable, `name=value`; JSON values are decoded
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Environment variable exposed to the script, `NAME=VALUE`
        #[arg(long = "env", value_name = "NAME=VALUE")]
        envs: Vec<String>,

        /// Fail instead of dropping `--env` values the policy withholds
        #[arg(long)]
        require_env: bool,

        /// Working directory for file and exec commands
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Capability or namespace to import
        #[arg(long = "import")]
        imports: Vec<String>,

        /// Execution mode (interactive, batch, service, debug)
        #[arg(long, default_value = "batch")]
        mode: String,

        /// Print the full execution result as JSON
        #[arg(long)]
        report: bool,
    },

    /// Show recent executions
    History {
        /// Only executions bound to this session
        #[arg(long)]
        session: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print entries as JSON lines
        #[arg(long)]
        full: bool,
    },

    /// Inspect and edit session state
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Remove sessions idle for longer than the given number of days
    Cleanup {
        #[arg(long, default_value = "7")]
        max_idle_days: i64,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print one value as JSON
    Get { session: String, key: String },
    /// Store a value (decoded as JSON when possible)
    Set {
        session: String,
        key: String,
        value: String,
    },
    /// List keys of a session, or every session when none is given
    List { session: Option<String> },
    /// Remove every value but keep the session
    Clear { session: String },
    /// Remove the session entirely
    Delete { session: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    debug!(?config, "configuration loaded");
    let engine = ScriptEngine::open(config)
        .await
        .context("Failed to start script engine")?;

    match cli.command {
        Commands::Run {
            file,
            eval,
            security,
            policy,
            session,
            timeout,
            format,
            vars,
            envs,
            require_env,
            workdir,
            imports,
            mode,
            report,
        } => {
            let script = read_script(file.as_deref(), eval)?;
            let mut request = ExecuteRequest {
                script,
                security_level: security,
                session_id: session,
                timeout_seconds: timeout,
                output_format: format,
                working_directory: workdir,
                imported_capabilities: imports,
                require_environment: require_env,
                execution_mode: mode,
                ..ExecuteRequest::default()
            };
            if let Some(path) = policy {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read policy {}", path.display()))?;
                request.custom_policy =
                    Some(serde_json::from_str(&raw).context("Invalid custom policy")?);
            }
            for var in &vars {
                let (name, value) = parse_assignment(var)?;
                request.variables.insert(name, decode_value(&value));
            }
            for env in &envs {
                let (name, value) = parse_assignment(env)?;
                request.environment_variables.insert(name, value);
            }

            let result = engine.execute(request).await;
            print_result(&result, report)?;
            engine.shutdown(std::time::Duration::from_secs(1)).await;
            std::process::exit(result.exit_code);
        }
        Commands::History {
            session,
            limit,
            full,
        } => cmd_history(&engine, session, limit, full).await,
        Commands::Session { action } => cmd_session(&engine, action).await,
        Commands::Cleanup { max_idle_days } => cmd_cleanup(&engine, max_idle_days).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let base = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    base.apply_env().context("Invalid SCRIPTBOX_* environment")
}

fn read_script(file: Option<&Path>, eval: Option<String>) -> Result<String> {
    if let Some(script) = eval {
        return Ok(script);
    }
    match file {
        Some(path) if path == Path::new("-") => {
            let mut script = String::new();
            std::io::stdin()
                .read_to_string(&mut script)
                .context("Failed to read script from stdin")?;
            Ok(script)
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display())),
        None => bail!("no script given: pass a FILE or --eval"),
    }
}

/// Split `NAME=VALUE`.
fn parse_assignment(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => bail!("expected NAME=VALUE, got {raw:?}"),
    }
}

/// JSON when it parses, otherwise the raw string.
fn decode_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_result(result: &ExecutionResult, report: bool) -> Result<()> {
    if report {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    print!("{}", result.output);
    if let Some(formatted) = &result.formatted {
        if !formatted.is_empty() {
            println!("{formatted}");
        }
    }
    if let Some(message) = result.error_message() {
        eprintln!("error: {message}");
        if !result.security_violations.is_empty() {
            eprintln!("violations: {}", result.security_violations.join(", "));
        }
    }
    Ok(())
}

async fn cmd_history(
    engine: &ScriptEngine,
    session: Option<String>,
    limit: usize,
    full: bool,
) -> Result<()> {
    let query = match session {
        Some(session) => HistoryQuery::for_session(session, limit),
        None => HistoryQuery::recent(limit),
    };
    let entries = engine.history(&query).await.context("Failed to query history")?;

    if entries.is_empty() {
        println!("No executions recorded");
        return Ok(());
    }
    for entry in &entries {
        if full {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!("{}", history_line(entry));
        }
    }
    Ok(())
}

fn history_line(entry: &HistoryEntry) -> String {
    let first_line = entry.script.lines().next().unwrap_or_default();
    format!(
        "{}  {}  {:<17} {:>3}  {:>6}ms  {}  {}",
        entry.started_at.format("%Y-%m-%d %H:%M:%S"),
        &entry.execution_id[..8.min(entry.execution_id.len())],
        entry.outcome,
        entry.exit_code,
        entry.duration_ms,
        entry.security_level,
        first_line
    )
}

async fn cmd_session(engine: &ScriptEngine, action: SessionAction) -> Result<()> {
    let store = engine.sessions();
    match action {
        SessionAction::Get { session, key } => {
            let id = SessionId::parse(session)?;
            match store.get(&id, &key).await? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("no value for key {key:?} in session {id}"),
            }
        }
        SessionAction::Set {
            session,
            key,
            value,
        } => {
            let id = SessionId::parse(session)?;
            store.set(&id, &key, decode_value(&value)).await?;
        }
        SessionAction::List { session: Some(session) } => {
            let id = SessionId::parse(session)?;
            for key in store.list(&id).await? {
                println!("{key}");
            }
        }
        SessionAction::List { session: None } => {
            for summary in store.sessions().await? {
                println!(
                    "{}  {} keys  last used {}",
                    summary.session_id,
                    summary.key_count,
                    summary.last_accessed_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        SessionAction::Clear { session } => {
            let id = SessionId::parse(session)?;
            store.clear(&id).await?;
        }
        SessionAction::Delete { session } => {
            let id = SessionId::parse(session)?;
            if !store.delete(&id).await? {
                bail!("session {id} does not exist");
            }
        }
    }
    Ok(())
}

async fn cmd_cleanup(engine: &ScriptEngine, max_idle_days: i64) -> Result<()> {
    if max_idle_days < 0 {
        bail!("--max-idle-days must not be negative");
    }
    let Some(max_idle) = chrono::TimeDelta::try_days(max_idle_days) else {
        bail!("--max-idle-days {max_idle_days} is out of range");
    };
    let removed = engine
        .sessions()
        .cleanup(max_idle)
        .await
        .context("Session cleanup failed")?;
    let pruned = engine
        .history_store()
        .prune(&engine.config().history.retention())
        .await
        .context("History pruning failed")?;
    println!(
        "Removed {} idle session(s), pruned {} history entr{}",
        removed.len(),
        pruned,
        if pruned == 1 { "y" } else { "ies" }
    );
    Ok(())
}
