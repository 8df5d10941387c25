//! Process clients: one child process per tool server, spoken to over
//! newline-delimited JSON-RPC on its stdio.
//!
//! Every runtime family ends up as a [`ShellClient`] running a generated
//! script; the node, python and container clients only decide what goes into
//! that script and which extra paths the sandbox must expose.

mod container;
mod node;
mod python;
mod shell;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{RuntimeTunables, ServerConfig, ServerRuntime};
use crate::directories::DirectoryResolver;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::sandbox::{
    finalize_sandbox_config, sandbox_for_platform, FinalizedSandboxConfig, Platform,
    SandboxAdapter, SandboxContext,
};
use crate::stream::StreamError;
use crate::template::{TemplateContext, TemplateError};
use mcpadre_error::McpadreError;

pub use container::{docker_command, ContainerClient};
pub use node::{npx_command, NodeClient};
pub use python::{uvx_command, PythonClient};
pub use shell::{ShellClient, ShellLaunch, EARLY_EXIT_WINDOW, STDERR_RING_LINES};

pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lifecycle of the child process behind a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("failed to start server `{server}`: {message}")]
    Spawn { server: String, message: String },
    #[error("invalid configuration for server `{server}`: {message}")]
    Config { server: String, message: String },
    #[error("requests with a null id cannot be correlated")]
    NullId,
    #[error("server `{server}` is stopped")]
    Stopped { server: String },
    #[error("server `{server}`: {source}")]
    Stream {
        server: String,
        #[source]
        source: StreamError,
    },
}

impl ClientError {
    pub(crate) fn stream(server: &str, source: StreamError) -> Self {
        Self::Stream {
            server: server.to_string(),
            source,
        }
    }

    pub(crate) fn config(server: &str, err: TemplateError) -> Self {
        Self::Config {
            server: server.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ClientError> for McpadreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Spawn { server, message } | ClientError::Config { server, message } => {
                McpadreError::ProcessSpawn { server, message }
            }
            ClientError::NullId => McpadreError::InvalidRequest {
                message: "requests with a null id cannot be correlated".to_string(),
            },
            ClientError::Stopped { .. } => McpadreError::SessionTerminated,
            ClientError::Stream { server, source } => match source {
                StreamError::SessionTerminated => McpadreError::SessionTerminated,
                StreamError::ProcessExited {
                    exit_code,
                    stderr,
                    early_exit,
                } => McpadreError::ProcessExited {
                    server,
                    exit_code,
                    stderr,
                    early_exit,
                },
                StreamError::DuplicateId { id } => McpadreError::InvalidRequest {
                    message: format!("request id {id} is already in flight"),
                },
                other => McpadreError::StreamError {
                    message: other.to_string(),
                },
            },
        }
    }
}

/// Uniform request/response contract over a child process.
pub trait ProcessClient: Send + Sync {
    fn server_name(&self) -> &str;

    fn state(&self) -> ProcessState;

    /// Sends `request`, starting the child on first use. Resolves to `None`
    /// for notifications.
    fn send(&self, request: JsonRpcRequest)
        -> ClientFuture<'_, Result<Option<JsonRpcResponse>, ClientError>>;

    /// Writes a raw message to the child, e.g. the answer to a request the
    /// child initiated.
    fn forward_message(&self, message: Value) -> ClientFuture<'_, Result<(), ClientError>>;

    /// Requests and notifications initiated by the child. Yields the receiver
    /// once; later calls return `None`.
    fn take_server_messages(&self) -> Option<mpsc::Receiver<JsonRpcRequest>>;

    /// Stops the child and rejects everything still pending. Idempotent.
    fn stop(&self) -> ClientFuture<'_, ()>;
}

/// Implements [`ProcessClient`] for a wrapper whose `inner` field is the
/// [`ShellClient`] doing the work.
macro_rules! delegate_to_shell {
    ($client:ty) => {
        impl $crate::client::ProcessClient for $client {
            fn server_name(&self) -> &str {
                self.inner.server_name()
            }

            fn state(&self) -> $crate::client::ProcessState {
                self.inner.state()
            }

            fn send(
                &self,
                request: $crate::jsonrpc::JsonRpcRequest,
            ) -> $crate::client::ClientFuture<
                '_,
                Result<Option<$crate::jsonrpc::JsonRpcResponse>, $crate::client::ClientError>,
            > {
                self.inner.send(request)
            }

            fn forward_message(
                &self,
                message: serde_json::Value,
            ) -> $crate::client::ClientFuture<'_, Result<(), $crate::client::ClientError>> {
                self.inner.forward_message(message)
            }

            fn take_server_messages(
                &self,
            ) -> Option<tokio::sync::mpsc::Receiver<$crate::jsonrpc::JsonRpcRequest>> {
                self.inner.take_server_messages()
            }

            fn stop(&self) -> $crate::client::ClientFuture<'_, ()> {
                self.inner.stop()
            }
        }
    };
}
use delegate_to_shell;

/// Everything a client needs besides its own [`ServerConfig`].
#[derive(Clone)]
pub struct ClientContext {
    pub dirs: DirectoryResolver,
    pub parent_env: HashMap<String, String>,
    pub tunables: RuntimeTunables,
    pub platform: Platform,
    pub sandbox: Arc<dyn SandboxAdapter>,
    /// Workspace-wide switch that turns every sandbox off.
    pub disable_all_sandboxes: bool,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("dirs", &self.dirs)
            .field("tunables", &self.tunables)
            .field("platform", &self.platform)
            .field("sandbox", &self.sandbox.name())
            .field("disable_all_sandboxes", &self.disable_all_sandboxes)
            .finish()
    }
}

impl ClientContext {
    /// Context for the current host: its platform, its sandbox primitive
    /// and its environment.
    pub fn new(dirs: DirectoryResolver, tunables: RuntimeTunables) -> Self {
        let platform = Platform::current();
        Self {
            dirs,
            parent_env: crate::config::parent_env(),
            tunables,
            platform,
            sandbox: Arc::from(sandbox_for_platform(platform)),
            disable_all_sandboxes: false,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxAdapter>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_parent_env(mut self, parent_env: HashMap<String, String>) -> Self {
        self.parent_env = parent_env;
        self
    }

    pub fn disable_sandboxes(mut self, disabled: bool) -> Self {
        self.disable_all_sandboxes = disabled;
        self
    }

    pub fn templates(&self) -> TemplateContext<'_> {
        TemplateContext::new(&self.dirs, &self.parent_env)
    }

    pub(crate) fn finalize_sandbox(
        &self,
        config: &ServerConfig,
    ) -> Result<FinalizedSandboxConfig, ClientError> {
        let sandbox_ctx = SandboxContext {
            dirs: &self.dirs,
            parent_env: &self.parent_env,
            disable_all_sandboxes: self.disable_all_sandboxes,
        };
        finalize_sandbox_config(config.sandbox.as_ref(), &sandbox_ctx)
            .map_err(|err| ClientError::config(&config.name, err))
    }

    pub(crate) fn resolve_env(
        &self,
        config: &ServerConfig,
    ) -> Result<std::collections::BTreeMap<String, String>, ClientError> {
        config
            .resolve_env(&self.templates())
            .map_err(|err| ClientError::config(&config.name, err))
    }
}

/// Builds the client matching the runtime family of `config`. The child is
/// not spawned until the first request.
pub fn build_client(
    config: &ServerConfig,
    ctx: &ClientContext,
) -> Result<Arc<dyn ProcessClient>, ClientError> {
    let span = tracing::info_span!("server", server = %config.name, runtime = config.runtime.family());
    let client: Arc<dyn ProcessClient> = match &config.runtime {
        ServerRuntime::Shell(shell) => Arc::new(ShellClient::from_config(config, shell, ctx, span)?),
        ServerRuntime::Node(package) => Arc::new(NodeClient::new(config, package, ctx, span)?),
        ServerRuntime::Python(package) => Arc::new(PythonClient::new(config, package, ctx, span)?),
        ServerRuntime::Container(image) => {
            Arc::new(ContainerClient::new(config, image, ctx, span)?)
        }
    };
    Ok(client)
}
