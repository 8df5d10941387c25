use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempPath;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use super::{ClientContext, ClientError, ClientFuture, ProcessClient, ProcessState};
use crate::config::{RuntimeTunables, ServerConfig, ShellServer};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::launch::{join_command_line, LaunchSpec};
use crate::sandbox::{wrap_invocation, ExtraPaths, FinalizedSandboxConfig, Platform, SandboxAdapter};
use crate::stream::{StreamError, StreamMultiplexer};
use mcpadre_error::{ErrorKind, RpcErrorObject};

/// An exit this soon after spawn usually means the sandbox refused the
/// process rather than the server failing on its own.
pub const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(100);
pub const STDERR_RING_LINES: usize = 200;

#[cfg(unix)]
const SCRIPT_DELETE_DELAY: Duration = Duration::from_secs(1);
const STDOUT_DRAIN_LIMIT: Duration = Duration::from_millis(500);
const STDERR_DRAIN_LIMIT: Duration = Duration::from_millis(500);
const EXIT_REPORT_WAIT: Duration = Duration::from_secs(1);

/// What a [`ShellClient`] runs, fully resolved.
#[derive(Debug, Clone)]
pub struct ShellLaunch {
    pub server: String,
    /// Script body: one shell command line.
    pub command: String,
    pub cwd: PathBuf,
    /// Server environment, layered over the inherited one.
    pub env: BTreeMap<String, String>,
    pub sandbox: FinalizedSandboxConfig,
    pub extra: ExtraPaths,
}

#[derive(Debug, Clone, Default)]
struct StderrRing(Arc<StdMutex<VecDeque<String>>>);

impl StderrRing {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.0.lock() {
            if lines.len() == STDERR_RING_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn snapshot(&self) -> Option<String> {
        let lines = self.0.lock().ok()?;
        if lines.is_empty() {
            return None;
        }
        Some(lines.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
}

struct RunningChild {
    mux: Arc<StreamMultiplexer>,
    stop_tx: StdMutex<Option<oneshot::Sender<Duration>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    /// Set by the supervisor when the child exits on its own.
    exit: Arc<StdMutex<Option<StreamError>>>,
    script: StdMutex<Option<TempPath>>,
}

impl RunningChild {
    fn exit_reason(&self) -> Option<StreamError> {
        self.exit.lock().ok().and_then(|reason| reason.clone())
    }

    async fn shutdown(&self, server: &str, grace: Duration) {
        self.mux.close_writes();
        self.mux.stop().await;

        if let Some(stop_tx) = self.stop_tx.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = stop_tx.send(grace);
        }
        let supervisor = self.supervisor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                tracing::debug!(error = %err, "supervisor task ended abnormally");
            }
        }

        if let Some(script) = self.script.lock().ok().and_then(|mut slot| slot.take()) {
            delete_script(server, script);
        }
    }
}

enum Slot {
    Idle,
    Running(Arc<RunningChild>),
    Failed(ClientError),
    Stopped,
}

/// Runs a command line through the platform shell and talks JSON-RPC over
/// its stdio. The child starts lazily on the first request.
pub struct ShellClient {
    launch: ShellLaunch,
    platform: Platform,
    tunables: RuntimeTunables,
    sandbox: Arc<dyn SandboxAdapter>,
    shell: PathBuf,
    span: Span,
    slot: Mutex<Slot>,
    lifecycle: Arc<watch::Sender<ProcessState>>,
    stderr: StderrRing,
    server_tx: mpsc::Sender<JsonRpcRequest>,
    server_rx: Arc<StdMutex<Option<mpsc::Receiver<JsonRpcRequest>>>>,
}

impl std::fmt::Debug for ShellClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellClient")
            .field("server", &self.launch.server)
            .field("state", &self.state())
            .finish()
    }
}

impl ShellClient {
    pub fn new(launch: ShellLaunch, ctx: &ClientContext, span: Span) -> Self {
        let shell = shell_program(ctx.platform, &ctx.parent_env);
        let (server_tx, server_rx) = mpsc::channel(64);
        let (lifecycle, _) = watch::channel(ProcessState::NotStarted);
        Self {
            launch,
            platform: ctx.platform,
            tunables: ctx.tunables,
            sandbox: ctx.sandbox.clone(),
            shell,
            span,
            slot: Mutex::new(Slot::Idle),
            lifecycle: Arc::new(lifecycle),
            stderr: StderrRing::default(),
            server_tx,
            server_rx: Arc::new(StdMutex::new(Some(server_rx))),
        }
    }

    pub fn from_config(
        config: &ServerConfig,
        shell: &ShellServer,
        ctx: &ClientContext,
        span: Span,
    ) -> Result<Self, ClientError> {
        let templates = ctx.templates();
        let command = templates
            .render(&shell.command)
            .map_err(|err| ClientError::config(&config.name, err))?;
        let cwd = match &shell.cwd {
            Some(raw) => {
                let rendered = templates
                    .render(raw)
                    .map_err(|err| ClientError::config(&config.name, err))?;
                let path = PathBuf::from(rendered);
                if path.is_absolute() {
                    path
                } else {
                    ctx.dirs.workspace().join(path)
                }
            }
            None => ctx.dirs.workspace().to_path_buf(),
        };

        let launch = ShellLaunch {
            server: config.name.clone(),
            command,
            cwd,
            env: ctx.resolve_env(config)?,
            sandbox: ctx.finalize_sandbox(config)?,
            extra: ExtraPaths::default(),
        };
        Ok(Self::new(launch, ctx, span))
    }

    pub fn launch(&self) -> &ShellLaunch {
        &self.launch
    }

    /// Last lines the child wrote to stderr.
    pub fn stderr_tail(&self) -> Option<String> {
        self.stderr.snapshot()
    }

    async fn running(&self) -> Result<Arc<RunningChild>, ClientError> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Running(child) => return Ok(child.clone()),
            Slot::Failed(err) => return Err(err.clone()),
            Slot::Stopped => {
                return Err(ClientError::Stopped {
                    server: self.launch.server.clone(),
                })
            }
            Slot::Idle => {}
        }

        match self.start().await {
            Ok(child) => {
                *slot = Slot::Running(child.clone());
                Ok(child)
            }
            Err(err) => {
                self.lifecycle.send_replace(ProcessState::Stopped);
                *slot = Slot::Failed(err.clone());
                Err(err)
            }
        }
    }

    async fn current(&self) -> Result<Arc<RunningChild>, ClientError> {
        match &*self.slot.lock().await {
            Slot::Running(child) => Ok(child.clone()),
            Slot::Failed(err) => Err(err.clone()),
            Slot::Idle | Slot::Stopped => Err(ClientError::Stopped {
                server: self.launch.server.clone(),
            }),
        }
    }

    async fn start(&self) -> Result<Arc<RunningChild>, ClientError> {
        let server = self.launch.server.as_str();
        self.lifecycle.send_replace(ProcessState::Starting);

        let windows = self.platform.is_windows();
        let script = write_script(&self.launch.command, windows).map_err(|err| ClientError::Spawn {
            server: server.to_string(),
            message: format!("failed to write launch script: {err}"),
        })?;
        tracing::debug!(script = %script.display(), command = %self.launch.command, "launch script written");

        let script_arg = script.to_string_lossy().into_owned();
        let args = if windows {
            vec!["/D".to_string(), "/C".to_string(), script_arg]
        } else {
            vec![script_arg]
        };
        let invocation = LaunchSpec::new(self.shell.clone(), args).with_env(self.launch.env.clone());

        let mut extra = self.launch.extra.clone();
        extra.read.push(self.shell.clone());
        extra.read.push(script.to_path_buf());
        let invocation =
            wrap_invocation(self.sandbox.as_ref(), &self.launch.sandbox, invocation, &extra).await;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&self.launch.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        tracing::info!(command = %invocation.display(), cwd = %self.launch.cwd.display(), "spawning server process");
        let spawned_at = Instant::now();
        let mut child = command.spawn().map_err(|err| {
            tracing::error!(command = %invocation.display(), error = %err, "failed to spawn server process");
            ClientError::Spawn {
                server: server.to_string(),
                message: err.to_string(),
            }
        })?;
        tracing::info!(pid = child.id().unwrap_or(0), "server process spawned");

        let missing = |stream: &str| ClientError::Spawn {
            server: server.to_string(),
            message: format!("failed to capture child {stream}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (mux, inbound) = StreamMultiplexer::new(
            format!("{server}:child"),
            Box::pin(stdin),
            self.tunables.max_pending_requests,
        );
        let mux = Arc::new(mux);
        mux.start(stdout);

        tokio::spawn(
            relay_server_messages(inbound, self.server_tx.clone(), self.server_rx.clone(), mux.clone())
                .instrument(self.span.clone()),
        );
        let stderr_task = tokio::spawn(
            read_stderr(stderr, self.stderr.clone(), spawned_at).instrument(self.span.clone()),
        );

        // Windows keeps the script until stop(): cmd.exe reads it lazily.
        #[cfg(unix)]
        let script_slot = {
            schedule_script_deletion(server.to_string(), script, &self.span);
            None
        };
        #[cfg(not(unix))]
        let script_slot = Some(script);

        let exit = Arc::new(StdMutex::new(None));
        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(
            supervise(
                child,
                Supervision {
                    mux: mux.clone(),
                    stderr: self.stderr.clone(),
                    stderr_task,
                    spawned_at,
                    lifecycle: self.lifecycle.clone(),
                    exit: exit.clone(),
                    default_grace: self.tunables.shutdown_grace,
                },
                stop_rx,
            )
            .instrument(self.span.clone()),
        );

        self.lifecycle.send_replace(ProcessState::Running);
        Ok(Arc::new(RunningChild {
            mux,
            stop_tx: StdMutex::new(Some(stop_tx)),
            supervisor: StdMutex::new(Some(supervisor)),
            exit,
            script: StdMutex::new(script_slot),
        }))
    }

    /// Prefers the recorded exit over the generic stream failure it caused.
    async fn explain(&self, child: &RunningChild, err: StreamError) -> ClientError {
        if matches!(
            err,
            StreamError::SessionTerminated | StreamError::Closed | StreamError::Write(_)
        ) {
            let mut lifecycle = self.lifecycle.subscribe();
            let _ = tokio::time::timeout(
                EXIT_REPORT_WAIT,
                lifecycle.wait_for(|state| *state == ProcessState::Stopped),
            )
            .await;
            if let Some(reason) = child.exit_reason() {
                return ClientError::stream(&self.launch.server, reason);
            }
        }
        ClientError::stream(&self.launch.server, err)
    }
}

impl ProcessClient for ShellClient {
    fn server_name(&self) -> &str {
        &self.launch.server
    }

    fn state(&self) -> ProcessState {
        *self.lifecycle.borrow()
    }

    fn send(
        &self,
        request: JsonRpcRequest,
    ) -> ClientFuture<'_, Result<Option<JsonRpcResponse>, ClientError>> {
        Box::pin(
            async move {
                if request.id.as_ref().is_some_and(|id| id.is_null()) {
                    return Err(ClientError::NullId);
                }
                let child = self.running().await?;
                match child.mux.send_request(&request).await {
                    Ok(response) => Ok(response),
                    Err(err) => Err(self.explain(&child, err).await),
                }
            }
            .instrument(self.span.clone()),
        )
    }

    fn forward_message(&self, message: Value) -> ClientFuture<'_, Result<(), ClientError>> {
        Box::pin(
            async move {
                let child = self.current().await?;
                child
                    .mux
                    .write_message(&message)
                    .await
                    .map_err(|err| ClientError::stream(&self.launch.server, err))
            }
            .instrument(self.span.clone()),
        )
    }

    fn take_server_messages(&self) -> Option<mpsc::Receiver<JsonRpcRequest>> {
        self.server_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    fn stop(&self) -> ClientFuture<'_, ()> {
        Box::pin(
            async move {
                let previous = {
                    let mut slot = self.slot.lock().await;
                    std::mem::replace(&mut *slot, Slot::Stopped)
                };
                if let Slot::Running(child) = previous {
                    self.lifecycle.send_replace(ProcessState::Stopping);
                    child
                        .shutdown(&self.launch.server, self.tunables.shutdown_grace)
                        .await;
                }
                self.lifecycle.send_replace(ProcessState::Stopped);
            }
            .instrument(self.span.clone()),
        )
    }
}

struct Supervision {
    mux: Arc<StreamMultiplexer>,
    stderr: StderrRing,
    stderr_task: JoinHandle<()>,
    spawned_at: Instant,
    lifecycle: Arc<watch::Sender<ProcessState>>,
    exit: Arc<StdMutex<Option<StreamError>>>,
    default_grace: Duration,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stop(Duration),
}

/// Sole owner of the child handle. Ends when the child is gone.
async fn supervise(mut child: Child, mut ctx: Supervision, mut stop_rx: oneshot::Receiver<Duration>) {
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        grace = &mut stop_rx => Outcome::Stop(grace.unwrap_or(ctx.default_grace)),
    };

    match outcome {
        Outcome::Exited(status) => {
            let elapsed = ctx.spawned_at.elapsed();
            let exit_code = status.as_ref().ok().and_then(|status| status.code());
            ctx.mux.drain_reader(STDOUT_DRAIN_LIMIT).await;
            let _ = tokio::time::timeout(STDERR_DRAIN_LIMIT, &mut ctx.stderr_task).await;
            let stderr = ctx.stderr.snapshot();

            let early_exit = elapsed < EARLY_EXIT_WINDOW;
            if early_exit {
                tracing::error!(
                    exit_code = ?exit_code,
                    elapsed_ms = elapsed.as_millis() as u64,
                    stderr = stderr.as_deref().unwrap_or(""),
                    "server exited immediately after spawn; the sandbox policy may have rejected it"
                );
            } else {
                tracing::warn!(
                    exit_code = ?exit_code,
                    age_ms = elapsed.as_millis() as u64,
                    stderr = stderr.as_deref().unwrap_or(""),
                    "server process exited"
                );
            }

            let reason = StreamError::ProcessExited {
                exit_code,
                stderr,
                early_exit,
            };
            if let Ok(mut slot) = ctx.exit.lock() {
                *slot = Some(reason.clone());
            }
            ctx.mux.stop_with(reason).await;
        }
        Outcome::Stop(grace) => {
            terminate(&mut child, grace).await;
            ctx.mux.stop().await;
            ctx.stderr_task.abort();
        }
    }

    ctx.lifecycle.send_replace(ProcessState::Stopped);
}

async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // The child leads its own process group; signal all of it.
            let group = -(pid as i32);
            unsafe {
                libc::kill(group, libc::SIGTERM);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(exit_code = ?status.code(), "server process stopped");
                    return;
                }
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "failed to wait for server process");
                }
                Err(_) => {
                    tracing::warn!(
                        grace_ms = grace.as_millis() as u64,
                        "server process ignored SIGTERM; killing"
                    );
                }
            }
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "kill failed (process may have already exited)");
    }
}

async fn read_stderr(stderr: ChildStderr, ring: StderrRing, spawned_at: Instant) {
    let mut lines = BufReader::new(stderr).lines();
    let mut line_count: u64 = 0;
    while let Ok(Some(line)) = lines.next_line().await {
        line_count += 1;
        tracing::error!(
            line_number = line_count,
            age_ms = spawned_at.elapsed().as_millis() as u64,
            "server stderr: {}",
            line
        );
        ring.push(line);
    }
    tracing::debug!(total_lines = line_count, "server stderr: stream ended");
}

/// Hands child-initiated messages to whoever took the receiver. Until
/// someone has, requests are refused so the child never waits forever.
async fn relay_server_messages(
    mut inbound: mpsc::Receiver<JsonRpcRequest>,
    outbound: mpsc::Sender<JsonRpcRequest>,
    unclaimed: Arc<StdMutex<Option<mpsc::Receiver<JsonRpcRequest>>>>,
    mux: Arc<StreamMultiplexer>,
) {
    while let Some(message) = inbound.recv().await {
        let claimed = unclaimed.lock().map(|slot| slot.is_none()).unwrap_or(true);
        if claimed {
            if outbound.send(message).await.is_err() {
                break;
            }
            continue;
        }

        tracing::debug!(method = %message.method, "no consumer for server-initiated message");
        if message.expects_response() {
            let refusal = JsonRpcResponse::failure(
                message.response_id(),
                RpcErrorObject::from_kind(
                    ErrorKind::MethodNotFound,
                    format!("no handler for `{}`", message.method),
                ),
            );
            if let Err(err) = mux.write_message(&refusal).await {
                tracing::debug!(error = %err, "could not refuse server-initiated request");
            }
        }
    }
}

/// Script body running `words` as one command. POSIX scripts `exec` it so
/// signals reach the server rather than the wrapping shell.
pub(crate) fn script_for(words: &[String], platform: Platform) -> String {
    let line = join_command_line(words, platform.is_windows());
    if platform.is_windows() {
        line
    } else {
        format!("exec {line}")
    }
}

fn shell_program(platform: Platform, parent_env: &HashMap<String, String>) -> PathBuf {
    let configured = if platform.is_windows() {
        parent_env
            .get("ComSpec")
            .or_else(|| parent_env.get("COMSPEC"))
            .cloned()
            .unwrap_or_else(|| "cmd.exe".to_string())
    } else {
        parent_env
            .get("SHELL")
            .filter(|shell| !shell.is_empty())
            .cloned()
            .unwrap_or_else(|| "/bin/sh".to_string())
    };
    let path = PathBuf::from(&configured);
    if path.is_absolute() {
        return path;
    }
    which::which(&configured).unwrap_or(path)
}

fn write_script(body: &str, windows: bool) -> std::io::Result<TempPath> {
    let (suffix, contents) = if windows {
        (".cmd", format!("@echo off\r\n{body}\r\n"))
    } else {
        (".sh", format!("{body}\n"))
    };
    // Created with owner-only permissions.
    let mut file = tempfile::Builder::new()
        .prefix("mcpadre-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

#[cfg(unix)]
fn schedule_script_deletion(server: String, script: TempPath, span: &Span) {
    tokio::spawn(
        async move {
            tokio::time::sleep(SCRIPT_DELETE_DELAY).await;
            delete_script(&server, script);
        }
        .instrument(span.clone()),
    );
}

fn delete_script(server: &str, script: TempPath) {
    let path: PathBuf = script.to_path_buf();
    match script.close() {
        Ok(()) => tracing::debug!(script = %path.display(), "launch script removed"),
        Err(err) => tracing::warn!(server, script = %path.display(), error = %err, "failed to remove launch script"),
    }
}
