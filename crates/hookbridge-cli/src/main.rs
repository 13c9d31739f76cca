//! CLI entry point for hookbridge.
//!
//! The `hookbridge` binary runs a compiled hook module against a trigger,
//! issues single host calls through the sandbox-side bridge, and prints the
//! per-op wire schema.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hookbridge_guest::{BoxedHost, Invocation, LoopbackAbi};
use hookbridge_host::{Host, HookRuntime, HostConfig, ModuleLoader, Trigger};
use hookbridge_protocol::schema::{self, Presence};
use hookbridge_protocol::{OpCode, Payload};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Guest heap for one `call`; large enough for any frame the host accepts.
const LOOPBACK_HEAP: u32 = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "hookbridge",
    version,
    about = "Run sandboxed hooks against host capabilities"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a .wasm hook module and invoke it once.
    Run {
        /// Path to the compiled module.
        module: PathBuf,

        /// Host configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Trigger JSON, e.g. '{"type":"cron","schedule":"@hourly","fired_at":"2026-01-01T00:00:00Z"}'.
        #[arg(short, long)]
        trigger: Option<String>,
    },

    /// Issue one host call through the bridge and print the result.
    Call {
        /// Op name (`kv_get`) or wire code (`3`).
        op: String,

        /// Payload JSON object.
        #[arg(default_value = "{}")]
        payload: String,

        /// Host configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List every op code with its request fields.
    Ops,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(if cli.verbose { "debug" } else { "info" });

    if let Err(e) = dotenvy::dotenv() {
        debug!(error = %e, "no .env file loaded");
    }

    match cli.command {
        Commands::Run {
            module,
            config,
            trigger,
        } => cmd_run(&module, config.as_deref(), trigger.as_deref()).await,
        Commands::Call {
            op,
            payload,
            config,
        } => cmd_call(&op, &payload, config.as_deref()).await,
        Commands::Ops => {
            cmd_ops();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(module: &Path, config: Option<&Path>, trigger: Option<&str>) -> Result<()> {
    let trigger = match trigger {
        Some(text) => serde_json::from_str::<Trigger>(text).context("invalid --trigger JSON")?,
        None => Trigger::cron("manual"),
    };

    let config = load_config(config)?;
    let host = Arc::new(Host::new(config).context("failed to start host")?);
    let runtime = HookRuntime::new(host).context("failed to create wasm runtime")?;

    let modules_dir = module
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut loader = ModuleLoader::new(modules_dir, Arc::new(Mutex::new(runtime)));
    let info = loader
        .load_module(module)
        .await
        .with_context(|| format!("failed to load {}", module.display()))?;

    info!(module = %info.name, trigger = trigger.kind(), "invoking hook");
    let output = loader
        .invoke(&info.name, trigger)
        .await
        .with_context(|| format!("hook '{}' failed", info.name))?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: call
// ---------------------------------------------------------------------------

async fn cmd_call(op: &str, payload: &str, config: Option<&Path>) -> Result<()> {
    let op: OpCode = op.parse()?;
    let payload: Payload = match serde_json::from_str(payload).context("invalid payload JSON")? {
        Value::Object(map) => map,
        other => bail!("payload must be a JSON object, got {other}"),
    };
    let config = load_config(config)?;

    // Host capabilities block on I/O, so the whole call runs off the reactor.
    let value = tokio::task::spawn_blocking(move || -> Result<Value> {
        let host = Arc::new(Host::new(config).context("failed to start host")?);
        call_once(&host, op, payload)
    })
    .await
    .context("host call panicked")??;

    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Issue one call through a loopback sandbox in a fresh host session.
///
/// The session is ended even when the invocation's own cleanup fails, so
/// the host never keeps a transaction open past the call.
fn call_once(host: &Arc<Host>, op: OpCode, payload: Payload) -> Result<Value> {
    let session = host.open_session();
    let serve: BoxedHost = {
        let host = Arc::clone(host);
        let session = Arc::clone(&session);
        Box::new(move |code: u32, request: &[u8]| host.dispatch(code, request, &session))
    };
    let invocation = Invocation::new(LoopbackAbi::new(LOOPBACK_HEAP, serve));
    let result = invocation.call(op, payload);
    let finished = invocation.finish();
    host.end_session(&session);
    finished.context("invocation cleanup failed")?;
    Ok(result?)
}

// ---------------------------------------------------------------------------
// Subcommand: ops
// ---------------------------------------------------------------------------

fn cmd_ops() {
    for op in OpCode::ALL {
        let schema = schema::schema(op);
        println!("{:>2}  {}  -> {}", op.code(), op.name(), schema.returns);
        for field in schema.fields {
            let presence = match field.presence {
                Presence::Required => "required".to_owned(),
                Presence::Optional(None) => "optional".to_owned(),
                Presence::Optional(Some(default)) => format!("default {}", default.to_value()),
            };
            println!("      {:<12} {:<14} {presence}", field.name, field.kind.describe());
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    match path {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(HostConfig::default()),
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use hookbridge_host::{Fault, handler_fn};

    use super::*;

    #[test]
    fn call_once_returns_the_host_value() {
        let host = Arc::new(Host::in_memory().unwrap());
        let value = call_once(&host, OpCode::Utils, uuid_payload()).unwrap();
        assert!(value["value"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[test]
    fn session_ends_even_when_cleanup_fails() {
        let host = Host::with_handlers(HostConfig::default(), |registry| {
            registry.replace(handler_fn(OpCode::TxRollback, |_, _| {
                Err(Fault::host("rollback refused"))
            }));
            Ok(())
        })
        .unwrap();
        let host = Arc::new(host);

        let err = call_once(&host, OpCode::TxBegin, Payload::new()).unwrap_err();
        assert!(err.to_string().contains("cleanup"), "{err:#}");
        let stats = host.services().transactions.stats();
        assert_eq!(stats.open, 0);
        assert_eq!(stats.rolled_back, 1);
    }

    fn uuid_payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("op".into(), Value::from("uuid"));
        payload
    }
}
