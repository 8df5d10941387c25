//! One proxied tool server: the caller speaks JSON-RPC on the session's
//! input/output, every request runs through the interceptor pipeline to the
//! child process, and the child's own requests are relayed back to the caller.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::client::{build_client, ClientContext, ProcessClient};
use crate::config::{RuntimeTunables, ServerConfig};
use crate::interceptors::TrafficRecorder;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::pipeline::{Interceptor, Pipeline, PipelineFuture, PipelineTarget};
use crate::stream::{StreamError, StreamMultiplexer};
use mcpadre_error::McpadreError;

const FRONT_LABEL: &str = "front";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct SessionOptions {
    pub server: ServerConfig,
    pub context: ClientContext,
    /// Applied in order on requests and in reverse on responses.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
}

/// Sends pipeline output to the child.
struct ClientTarget {
    client: Arc<dyn ProcessClient>,
}

impl PipelineTarget for ClientTarget {
    fn call(&self, request: JsonRpcRequest) -> PipelineFuture<'_, JsonRpcResponse> {
        Box::pin(async move {
            let id = request.response_id();
            match self.client.send(request).await? {
                Some(response) => Ok(response),
                // Notifications: nothing is written back for them.
                None => Ok(JsonRpcResponse::success(id, Value::Null)),
            }
        })
    }
}

pub struct Session {
    server: String,
    client: Arc<dyn ProcessClient>,
    pipeline: Arc<Pipeline>,
    tunables: RuntimeTunables,
    state: watch::Sender<SessionState>,
    span: tracing::Span,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.server)
            .field("pipeline", &self.pipeline)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Session {
    /// Builds the client for `options.server`. With `record` set, a
    /// [`TrafficRecorder`] is put in front of the configured interceptors so
    /// it sees the caller's traffic unmodified.
    pub fn new(options: SessionOptions) -> Result<Self, McpadreError> {
        let SessionOptions {
            server,
            context,
            mut interceptors,
        } = options;

        let client = build_client(&server, &context)?;
        if server.record {
            let recorder = TrafficRecorder::for_server(context.dirs.log(), &server.name);
            tracing::info!(server = %server.name, path = %recorder.path().display(), "recording traffic");
            interceptors.insert(0, Arc::new(recorder));
        }

        Ok(Self::with_client(client, interceptors).with_tunables(context.tunables))
    }

    pub fn with_client(client: Arc<dyn ProcessClient>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        let server = client.server_name().to_string();
        let target = Arc::new(ClientTarget {
            client: client.clone(),
        });
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            span: tracing::info_span!("session", server = %server),
            server,
            client,
            pipeline: Arc::new(Pipeline::new(interceptors, target)),
            tunables: RuntimeTunables::default(),
            state,
        }
    }

    pub fn with_tunables(mut self, tunables: RuntimeTunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn interceptor_names(&self) -> Vec<&str> {
        self.pipeline.interceptor_names()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Serves until `input` ends, Ctrl-C, or SIGTERM.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<(), McpadreError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + 'static,
    {
        self.run_until(input, output, shutdown_signal()).await
    }

    /// Serves until `input` ends, writing to `output` fails, or `shutdown`
    /// resolves. A session runs once.
    pub async fn run_until<R, W, F>(&self, input: R, output: W, shutdown: F) -> Result<(), McpadreError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let started = self.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(McpadreError::internal(format!(
                "session for `{}` has already run",
                self.server
            )));
        }

        let span = self.span.clone();
        let (front, mut inbound) = {
            let _entered = span.enter();
            let (front, inbound) =
                StreamMultiplexer::new(FRONT_LABEL, Box::pin(output), self.tunables.max_pending_requests);
            let front = Arc::new(front);
            front.start(input);
            (front, inbound)
        };
        tracing::info!(parent: &span, interceptors = ?self.interceptor_names(), "session running");

        let broken = Arc::new(Notify::new());
        let relay = self.client.take_server_messages().map(|messages| {
            tokio::spawn(
                relay_server_messages(messages, front.clone(), self.client.clone(), broken.clone())
                    .instrument(span.clone()),
            )
        });

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(parent: &span, "shutdown requested");
                    break;
                }
                _ = broken.notified() => {
                    tracing::warn!(parent: &span, "caller output is gone; shutting down");
                    break;
                }
                message = inbound.recv() => match message {
                    Some(request) => {
                        tasks.spawn(
                            handle_request(self.pipeline.clone(), front.clone(), broken.clone(), request)
                                .instrument(span.clone()),
                        );
                    }
                    None => {
                        tracing::info!(parent: &span, "caller closed the stream");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(parent: &span, error = %err, "request task failed");
                    }
                }
            }
        }

        self.shutdown(&front, tasks, relay).instrument(span).await;
        Ok(())
    }

    async fn shutdown(
        &self,
        front: &StreamMultiplexer,
        mut tasks: JoinSet<()>,
        relay: Option<tokio::task::JoinHandle<()>>,
    ) {
        self.state.send_replace(SessionState::ShuttingDown);

        // Nothing pending at this point gets an answer.
        front.close_writes();
        self.client.stop().await;

        let in_flight = tasks.len();
        let drained = tokio::time::timeout(self.tunables.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                grace_ms = self.tunables.shutdown_grace.as_millis() as u64,
                "in-flight requests did not finish; aborting"
            );
            tasks.abort_all();
        } else if in_flight > 0 {
            tracing::debug!(count = in_flight, "in-flight requests drained");
        }

        if let Some(relay) = relay {
            relay.abort();
        }
        front.stop().await;

        self.state.send_replace(SessionState::Stopped);
        tracing::info!("session stopped");
    }
}

async fn handle_request(
    pipeline: Arc<Pipeline>,
    front: Arc<StreamMultiplexer>,
    broken: Arc<Notify>,
    request: JsonRpcRequest,
) {
    let reply = !request.is_notification();
    let method = request.method.clone();
    let response = pipeline.process(request).await;
    if !reply {
        return;
    }
    match front.write_message(&response).await {
        Ok(()) => {}
        Err(err @ StreamError::Write(_)) => {
            tracing::warn!(method = %method, error = %err, "response could not be written");
            broken.notify_one();
        }
        Err(err) => {
            tracing::debug!(method = %method, error = %err, "response dropped");
        }
    }
}

/// Forwards child-initiated messages to the caller and the caller's answers
/// back to the child.
async fn relay_server_messages(
    mut messages: mpsc::Receiver<JsonRpcRequest>,
    front: Arc<StreamMultiplexer>,
    client: Arc<dyn ProcessClient>,
    broken: Arc<Notify>,
) {
    while let Some(request) = messages.recv().await {
        let front = front.clone();
        let client = client.clone();
        let broken = broken.clone();
        tokio::spawn(
            async move {
                let id = request.response_id();
                let answer = match front.send_request(&request).await {
                    Ok(Some(response)) => response,
                    Ok(None) => return,
                    Err(err) => {
                        if matches!(err, StreamError::Write(_)) {
                            broken.notify_one();
                        }
                        tracing::debug!(method = %request.method, error = %err, "caller did not answer");
                        JsonRpcResponse::from_error(
                            id,
                            &McpadreError::StreamError {
                                message: err.to_string(),
                            },
                        )
                    }
                };
                let value = match serde_json::to_value(&answer) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode caller response");
                        return;
                    }
                };
                if let Err(err) = client.forward_message(value).await {
                    tracing::debug!(error = %err, "failed to forward caller response");
                }
            }
            .in_current_span(),
        );
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, ClientFuture, ProcessState};
    use crate::stream::StreamError;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    /// Answers immediately, or parks every request until stopped.
    struct FakeClient {
        park: bool,
        sent: mpsc::UnboundedSender<String>,
        stopped: watch::Sender<bool>,
        server_messages: StdMutex<Option<mpsc::Receiver<JsonRpcRequest>>>,
        forwarded: mpsc::UnboundedSender<Value>,
    }

    struct FakeHandles {
        sent: mpsc::UnboundedReceiver<String>,
        to_caller: mpsc::Sender<JsonRpcRequest>,
        forwarded: mpsc::UnboundedReceiver<Value>,
    }

    fn fake_client(park: bool) -> (Arc<FakeClient>, FakeHandles) {
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (to_caller, server_rx) = mpsc::channel(8);
        let (forwarded_tx, forwarded) = mpsc::unbounded_channel();
        let client = Arc::new(FakeClient {
            park,
            sent: sent_tx,
            stopped: watch::channel(false).0,
            server_messages: StdMutex::new(Some(server_rx)),
            forwarded: forwarded_tx,
        });
        (
            client,
            FakeHandles {
                sent,
                to_caller,
                forwarded,
            },
        )
    }

    impl ProcessClient for FakeClient {
        fn server_name(&self) -> &str {
            "fake"
        }

        fn state(&self) -> ProcessState {
            if *self.stopped.borrow() {
                ProcessState::Stopped
            } else {
                ProcessState::Running
            }
        }

        fn send(&self, request: JsonRpcRequest) -> ClientFuture<'_, Result<Option<JsonRpcResponse>, ClientError>> {
            Box::pin(async move {
                let _ = self.sent.send(request.method.clone());
                if request.is_notification() {
                    return Ok(None);
                }
                if self.park {
                    let mut stopped = self.stopped.subscribe();
                    let _ = stopped.wait_for(|stopped| *stopped).await;
                    return Err(ClientError::stream("fake", StreamError::SessionTerminated));
                }
                Ok(Some(JsonRpcResponse::success(
                    request.response_id(),
                    json!({"echo": request.method}),
                )))
            })
        }

        fn forward_message(&self, message: Value) -> ClientFuture<'_, Result<(), ClientError>> {
            let _ = self.forwarded.send(message);
            Box::pin(async { Ok(()) })
        }

        fn take_server_messages(&self) -> Option<mpsc::Receiver<JsonRpcRequest>> {
            self.server_messages.lock().ok().and_then(|mut slot| slot.take())
        }

        fn stop(&self) -> ClientFuture<'_, ()> {
            self.stopped.send_replace(true);
            Box::pin(async {})
        }
    }

    struct Caller {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Caller {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn next_json(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn wire(session: Session) -> (Caller, tokio::task::JoinHandle<Result<(), McpadreError>>, tokio::sync::oneshot::Sender<()>) {
        let (caller_side, session_side) = tokio::io::duplex(16 * 1024);
        let (input, output) = tokio::io::split(session_side);
        let (reader, writer) = tokio::io::split(caller_side);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            session
                .run_until(input, output, async {
                    let _ = stop_rx.await;
                })
                .await
        });
        (
            Caller {
                lines: BufReader::new(reader).lines(),
                writer,
            },
            handle,
            stop_tx,
        )
    }

    #[tokio::test]
    async fn answers_requests_and_skips_notifications() {
        let (client, mut handles) = fake_client(false);
        let session = Session::with_client(client, Vec::new());
        assert_eq!(session.state(), SessionState::Idle);
        let mut states = session.subscribe_state();
        let (mut caller, handle, _stop) = wire(session);

        caller
            .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        caller.send(r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#).await;
        assert_eq!(
            caller.next_json().await,
            json!({"jsonrpc": "2.0", "id": "a", "result": {"echo": "tools/list"}})
        );
        let mut sent = vec![handles.sent.recv().await.unwrap(), handles.sent.recv().await.unwrap()];
        sent.sort();
        assert_eq!(sent, ["notifications/initialized", "tools/list"]);

        caller.send("{oops").await;
        let parse_error = caller.next_json().await;
        assert_eq!(parse_error["id"], Value::Null);
        assert_eq!(parse_error["error"]["code"], -32700);

        caller.send(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).await;
        let null_id = caller.next_json().await;
        assert_eq!(null_id["id"], Value::Null);
        assert_eq!(null_id["result"], json!({"echo": "ping"}));

        caller.writer.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(caller.lines.next_line().await.unwrap().is_none());
        states.wait_for(|state| *state == SessionState::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_requests_without_writing_responses() {
        let (client, mut handles) = fake_client(true);
        let session = Session::with_client(client.clone(), Vec::new());
        let (mut caller, handle, stop) = wire(session);

        caller.send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#).await;
        caller.send(r#"{"jsonrpc":"2.0","id":2,"method":"tools/call"}"#).await;
        handles.sent.recv().await.unwrap();
        handles.sent.recv().await.unwrap();

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(caller.lines.next_line().await.unwrap().is_none());
        assert_eq!(client.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn child_requests_are_relayed_to_the_caller() {
        let (client, mut handles) = fake_client(false);
        let session = Session::with_client(client, Vec::new());
        let (mut caller, handle, stop) = wire(session);

        handles
            .to_caller
            .send(JsonRpcRequest::new("srv-1", "sampling/createMessage", Some(json!({"x": 1}))))
            .await
            .unwrap();
        let relayed = caller.next_json().await;
        assert_eq!(relayed["method"], "sampling/createMessage");
        assert_eq!(relayed["id"], "srv-1");

        caller
            .send(r#"{"jsonrpc":"2.0","id":"srv-1","result":{"content":"hi"}}"#)
            .await;
        let forwarded = handles.forwarded.recv().await.unwrap();
        assert_eq!(
            forwarded,
            json!({"jsonrpc": "2.0", "id": "srv-1", "result": {"content": "hi"}})
        );

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lost_caller_output_stops_the_session() {
        let (client, _handles) = fake_client(false);
        let session = Arc::new(Session::with_client(client.clone(), Vec::new()));
        let mut states = session.subscribe_state();

        let (mut caller_in, input) = tokio::io::duplex(1024);
        let (output, caller_out) = tokio::io::duplex(1024);
        drop(caller_out);

        let run = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .run_until(input, output, std::future::pending::<()>())
                    .await
            })
        };
        caller_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            states.wait_for(|state| *state == SessionState::Stopped),
        )
        .await
        .expect("session stops once its output is gone")
        .unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(client.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn a_session_runs_once() {
        let (client, _handles) = fake_client(false);
        let session = Session::with_client(client, Vec::new());
        let (input, _keep) = tokio::io::duplex(64);
        session
            .run_until(tokio::io::empty(), tokio::io::sink(), async {})
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Stopped);

        let again = session.run_until(input, tokio::io::sink(), async {}).await;
        assert!(matches!(again, Err(McpadreError::Internal { .. })));
    }
}
