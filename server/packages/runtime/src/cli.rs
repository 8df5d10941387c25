use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::client::ClientContext;
use crate::config::{RuntimeTunables, ServerConfig};
use crate::directories::DirectoryResolver;
use crate::interceptors::{MethodFirewall, ProtocolGate};
use crate::pipeline::Interceptor;
use crate::session::{Session, SessionOptions};
use mcpadre_error::McpadreError;

#[derive(Parser, Debug)]
#[command(name = "mcpadre-run", bin_name = "mcpadre-run")]
#[command(about = "Run one tool server behind the mcpadre JSON-RPC proxy on stdio", version)]
pub struct Cli {
    /// Server definition as JSON.
    #[arg(long = "server-json")]
    server_json: String,

    /// Project workspace; defaults to the current directory.
    #[arg(long, conflicts_with = "user")]
    workspace: Option<PathBuf>,

    /// Run in user scope instead of project scope.
    #[arg(long)]
    user: bool,

    #[arg(long)]
    disable_sandbox: bool,

    /// Append all traffic to `<log>/<server>/traffic-<ms>.jsonl`.
    #[arg(long)]
    record: bool,

    /// Refuse a method with METHOD_NOT_FOUND. Repeatable.
    #[arg(long = "block", value_name = "METHOD")]
    block: Vec<String>,

    /// Reject requests sent out of handshake order.
    #[arg(long)]
    strict_protocol: bool,

    #[arg(long, value_name = "MS")]
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid --server-json: {0}")]
    ServerJson(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Runtime(#[from] McpadreError),
}

impl Cli {
    fn interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
        if self.strict_protocol {
            interceptors.push(Arc::new(ProtocolGate::new()));
        }
        if !self.block.is_empty() {
            interceptors.push(Arc::new(MethodFirewall::new(self.block.iter().cloned())));
        }
        interceptors
    }

    fn directories(&self) -> Result<DirectoryResolver, CliError> {
        if self.user {
            return Ok(DirectoryResolver::for_user());
        }
        let workspace = match &self.workspace {
            Some(workspace) => workspace.clone(),
            None => std::env::current_dir()?,
        };
        Ok(DirectoryResolver::for_project(workspace))
    }

    fn tunables(&self) -> RuntimeTunables {
        let mut tunables = RuntimeTunables::from_env();
        if let Some(ms) = self.shutdown_grace_ms {
            tunables.shutdown_grace = Duration::from_millis(ms);
        }
        tunables
    }
}

pub fn run_mcpadre() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging();
    run(cli)
}

/// Logs go to stderr; stdout carries JSON-RPC.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    let session = prepare(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        session
            .run(tokio::io::stdin(), tokio::io::stdout())
            .await
            .map_err(CliError::from)
    })
}

fn prepare(cli: &Cli) -> Result<Session, CliError> {
    let mut server: ServerConfig = serde_json::from_str(&cli.server_json)?;
    server.record |= cli.record;

    let dirs = cli.directories()?;
    tracing::info!(
        server = %server.name,
        runtime = server.runtime.family(),
        workspace = %dirs.workspace().display(),
        scope = ?dirs.scope(),
        "starting session"
    );
    let context = ClientContext::new(dirs, cli.tunables()).disable_sandboxes(cli.disable_sandbox);
    let session = Session::new(SessionOptions {
        server,
        context,
        interceptors: cli.interceptors(),
    })?;
    Ok(session)
}
