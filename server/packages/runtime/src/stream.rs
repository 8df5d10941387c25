//! Newline-delimited JSON-RPC multiplexer.
//!
//! One multiplexer owns one bidirectional byte stream. Outbound requests with
//! an id are parked in a pending map until the matching response line is
//! read; inbound requests and notifications are handed to the owner over a
//! bounded channel in arrival order.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::jsonrpc::{decode_frame, Frame, JsonRpcRequest, JsonRpcResponse};
use mcpadre_error::{ErrorKind, RpcErrorObject};

pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

const INBOUND_CHANNEL_CAPACITY: usize = 64;
const WRITER_RELEASE_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_LOGGED_LINE: usize = 200;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("session terminated")]
    SessionTerminated,
    #[error("process exited (code {exit_code:?})")]
    ProcessExited {
        exit_code: Option<i32>,
        stderr: Option<String>,
        early_exit: bool,
    },
    #[error("stream closed")]
    Closed,
    #[error("request id {id} is already in flight")]
    DuplicateId { id: String },
    #[error("too many pending requests (limit {limit})")]
    TooManyPending { limit: usize },
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(String),
    #[error("failed to write message: {0}")]
    Write(String),
}

#[derive(Debug)]
struct PendingRequest {
    method: String,
    sender: oneshot::Sender<Result<JsonRpcResponse, StreamError>>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

#[derive(Clone)]
struct OutboundWriter {
    label: Arc<str>,
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    closed: Arc<AtomicBool>,
}

impl OutboundWriter {
    async fn write_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), StreamError> {
        let mut bytes =
            serde_json::to_vec(value).map_err(|err| StreamError::Serialize(err.to_string()))?;
        bytes.push(b'\n');
        self.write_bytes(&bytes).await
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(StreamError::Closed)?;
        writer.write_all(bytes).await.map_err(|err| {
            tracing::error!(stream = %self.label, error = %err, "write_all failed");
            StreamError::Write(err.to_string())
        })?;
        writer.flush().await.map_err(|err| {
            tracing::error!(stream = %self.label, error = %err, "flush failed");
            StreamError::Write(err.to_string())
        })?;
        Ok(())
    }
}

pub struct StreamMultiplexer {
    label: Arc<str>,
    outbound: OutboundWriter,
    pending: PendingMap,
    inbound: StdMutex<Option<mpsc::Sender<JsonRpcRequest>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    max_pending: usize,
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("label", &self.label)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

impl StreamMultiplexer {
    /// Creates a multiplexer writing to `writer`. Inbound requests and
    /// notifications arrive on the returned receiver once [`start`] is called.
    ///
    /// [`start`]: StreamMultiplexer::start
    pub fn new(
        label: impl Into<String>,
        writer: BoxedWriter,
        max_pending: usize,
    ) -> (Self, mpsc::Receiver<JsonRpcRequest>) {
        let label: Arc<str> = Arc::from(label.into());
        let (sender, receiver) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let multiplexer = Self {
            label: label.clone(),
            outbound: OutboundWriter {
                label,
                writer: Arc::new(Mutex::new(Some(writer))),
                closed: Arc::new(AtomicBool::new(false)),
            },
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbound: StdMutex::new(Some(sender)),
            reader: StdMutex::new(None),
            stopped: AtomicBool::new(false),
            max_pending: max_pending.max(1),
        };
        (multiplexer, receiver)
    }

    /// Starts the reader task. Calling it twice is a no-op.
    pub fn start<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let Some(inbound) = self.inbound.lock().ok().and_then(|mut slot| slot.take()) else {
            tracing::debug!(stream = %self.label, "reader already started");
            return;
        };

        let label = self.label.clone();
        let pending = self.pending.clone();
        let outbound = self.outbound.clone();
        let task = tokio::spawn(
            read_loop(label, reader, pending, outbound, inbound).instrument(tracing::Span::current()),
        );

        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(task);
        }
    }

    /// Writes `request`. When it carries a non-null id, waits for the matching
    /// response; otherwise returns `None` once the line is written.
    pub async fn send_request(
        &self,
        request: &JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, StreamError> {
        let id = match &request.id {
            Some(id) if !id.is_null() => id.clone(),
            _ => {
                tracing::debug!(
                    stream = %self.label,
                    method = %request.method,
                    "notification → peer (fire-and-forget)"
                );
                self.outbound.write_value(request).await?;
                return Ok(None);
            }
        };

        let key = id.correlation_key();
        let receiver = {
            let mut pending = self.pending.lock().await;
            if self.stopped.load(Ordering::SeqCst) {
                return Err(StreamError::SessionTerminated);
            }
            if pending.contains_key(&key) {
                return Err(StreamError::DuplicateId { id: key });
            }
            if pending.len() >= self.max_pending {
                tracing::warn!(
                    stream = %self.label,
                    limit = self.max_pending,
                    method = %request.method,
                    "pending request limit reached"
                );
                return Err(StreamError::TooManyPending {
                    limit: self.max_pending,
                });
            }
            let (sender, receiver) = oneshot::channel();
            pending.insert(
                key.clone(),
                PendingRequest {
                    method: request.method.clone(),
                    sender,
                },
            );
            tracing::debug!(
                stream = %self.label,
                method = %request.method,
                id = %key,
                pending_count = pending.len(),
                "request → peer (awaiting response)"
            );
            receiver
        };

        if let Err(err) = self.outbound.write_value(request).await {
            self.pending.lock().await.remove(&key);
            return Err(err);
        }

        match receiver.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(StreamError::SessionTerminated),
        }
    }

    /// Writes an arbitrary message without correlation, e.g. a response.
    pub async fn write_message<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), StreamError> {
        self.outbound.write_value(message).await
    }

    /// Refuses further writes while leaving pending requests in place.
    pub fn close_writes(&self) {
        self.outbound.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Waits up to `limit` for the reader to reach end of stream so lines
    /// already written by the peer are still delivered.
    pub async fn drain_reader(&self, limit: Duration) {
        let Some(mut task) = self.reader.lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            if let Ok(mut slot) = self.reader.lock() {
                *slot = Some(task);
            }
        }
    }

    pub async fn stop(&self) {
        self.stop_with(StreamError::SessionTerminated).await;
    }

    /// Rejects every pending request with `reason`, stops reading and
    /// releases the writer. Only the first call has an effect.
    pub async fn stop_with(&self, reason: StreamError) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_writes();

        if let Some(task) = self.reader.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
        if let Ok(mut slot) = self.inbound.lock() {
            slot.take();
        }

        let drained = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect::<Vec<_>>()
        };
        if !drained.is_empty() {
            tracing::info!(
                stream = %self.label,
                count = drained.len(),
                reason = %reason,
                "rejecting pending requests"
            );
        }
        for (id, request) in drained {
            tracing::debug!(stream = %self.label, id = %id, method = %request.method, "pending request rejected");
            let _ = request.sender.send(Err(reason.clone()));
        }

        match tokio::time::timeout(WRITER_RELEASE_TIMEOUT, self.outbound.writer.lock()).await {
            Ok(mut guard) => {
                if let Some(mut writer) = guard.take() {
                    if let Err(err) = writer.shutdown().await {
                        tracing::debug!(stream = %self.label, error = %err, "writer shutdown failed");
                    }
                }
            }
            Err(_) => {
                tracing::warn!(stream = %self.label, "writer busy at stop; releasing on drop");
            }
        }
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().ok().and_then(|slot| slot.take()) {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    label: Arc<str>,
    reader: R,
    pending: PendingMap,
    outbound: OutboundWriter,
    inbound: mpsc::Sender<JsonRpcRequest>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    let mut line_count: u64 = 0;

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(stream = %label, error = %err, "read failed; closing stream");
                break;
            }
        }

        let line = match std::str::from_utf8(&buffer) {
            Ok(line) => line.trim(),
            Err(err) => {
                tracing::warn!(stream = %label, error = %err, "line is not valid UTF-8");
                reply_best_effort(&label, &outbound, &JsonRpcResponse::parse_error(err.to_string())).await;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        line_count += 1;

        match decode_frame(line) {
            Ok(Frame::Response(response)) => {
                if response.id.is_null() {
                    tracing::warn!(
                        stream = %label,
                        has_error = response.is_error(),
                        "response with null id dropped"
                    );
                    continue;
                }
                let key = response.id.correlation_key();
                let waiter = pending.lock().await.remove(&key);
                match waiter {
                    Some(request) => {
                        tracing::debug!(
                            stream = %label,
                            id = %key,
                            method = %request.method,
                            has_error = response.is_error(),
                            "response matched to pending request"
                        );
                        let _ = request.sender.send(Ok(response));
                    }
                    None => {
                        tracing::warn!(
                            stream = %label,
                            id = %key,
                            "response has no matching pending request (orphan)"
                        );
                    }
                }
            }
            Ok(Frame::Request(request)) => {
                if let Err(mpsc::error::SendError(request)) = inbound.send(request).await {
                    tracing::warn!(stream = %label, method = %request.method, "no consumer for inbound request");
                    if request.expects_response() {
                        let refusal = JsonRpcResponse::failure(
                            request.response_id(),
                            RpcErrorObject::from_kind(
                                ErrorKind::MethodNotFound,
                                format!("no handler for `{}`", request.method),
                            ),
                        );
                        reply_best_effort(&label, &outbound, &refusal).await;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    stream = %label,
                    line_number = line_count,
                    error = ?err,
                    raw = %truncate(line),
                    "invalid JSON-RPC line"
                );
                reply_best_effort(&label, &outbound, &err.to_response()).await;
            }
        }
    }

    tracing::debug!(stream = %label, total_lines = line_count, "stream ended");
}

async fn reply_best_effort(label: &str, outbound: &OutboundWriter, response: &JsonRpcResponse) {
    if let Err(err) = outbound.write_value(response).await {
        tracing::debug!(stream = %label, error = %err, "could not write error response");
    }
}

fn truncate(line: &str) -> String {
    if line.len() <= MAX_LOGGED_LINE {
        return line.to_string();
    }
    let mut end = MAX_LOGGED_LINE;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::RequestId;
    use serde_json::{json, Value};
    use tokio::io::{DuplexStream, Lines};

    struct Peer {
        lines: Lines<BufReader<DuplexStream>>,
        writer: DuplexStream,
    }

    impl Peer {
        async fn next_json(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().expect("line from multiplexer");
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn harness() -> (Arc<StreamMultiplexer>, mpsc::Receiver<JsonRpcRequest>, Peer) {
        let (mux_out, peer_in) = tokio::io::duplex(64 * 1024);
        let (peer_out, mux_in) = tokio::io::duplex(64 * 1024);
        let (mux, inbound) = StreamMultiplexer::new("test", Box::pin(mux_out), 16);
        mux.start(mux_in);
        let peer = Peer {
            lines: BufReader::new(peer_in).lines(),
            writer: peer_out,
        };
        (Arc::new(mux), inbound, peer)
    }

    fn spawn_send(
        mux: &Arc<StreamMultiplexer>,
        id: i64,
    ) -> JoinHandle<Result<Option<JsonRpcResponse>, StreamError>> {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.send_request(&JsonRpcRequest::new(id, "tools/call", None)).await
        })
    }

    #[tokio::test]
    async fn out_of_order_responses_resolve_the_right_caller() {
        let (mux, _inbound, mut peer) = harness();
        let first = spawn_send(&mux, 1);
        assert_eq!(peer.next_json().await["id"], 1);
        let second = spawn_send(&mux, 2);
        assert_eq!(peer.next_json().await["id"], 2);

        peer.send_raw("{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":\"two\"}\n").await;
        let response = second.await.unwrap().unwrap().unwrap();
        assert_eq!(response.id, RequestId::from(2));
        assert_eq!(response.result(), Some(&json!("two")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished());
        assert_eq!(mux.pending_count().await, 1);

        peer.send_raw("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"one\"}\n").await;
        let response = first.await.unwrap().unwrap().unwrap();
        assert_eq!(response.result(), Some(&json!("one")));
    }

    #[tokio::test]
    async fn malformed_line_gets_parse_error_and_stream_continues() {
        let (_mux, mut inbound, mut peer) = harness();
        peer.send_raw("{this is not json\n").await;
        peer.send_raw("{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}\n").await;

        let error = peer.next_json().await;
        assert_eq!(error["id"], Value::Null);
        assert_eq!(error["error"]["code"], ErrorKind::PARSE_ERROR);

        let request = inbound.recv().await.expect("request after malformed line");
        assert_eq!(request.method, "ping");
        assert_eq!(request.id, Some(RequestId::from(7)));
    }

    #[tokio::test]
    async fn unknown_response_id_is_dropped() {
        let (mux, _inbound, mut peer) = harness();
        let call = spawn_send(&mux, 1);
        peer.next_json().await;

        peer.send_raw("{\"jsonrpc\":\"2.0\",\"id\":99,\"result\":{}}\n").await;
        peer.send_raw("{\"jsonrpc\":\"2.0\",\"id\":null,\"error\":{\"code\":-1,\"message\":\"x\"}}\n")
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!call.is_finished());
        assert_eq!(mux.pending_count().await, 1);
    }

    #[tokio::test]
    async fn partial_lines_accumulate_across_chunks() {
        let (mux, _inbound, mut peer) = harness();
        let call = spawn_send(&mux, 5);
        peer.next_json().await;

        peer.send_raw("{\"jsonrpc\":\"2.0\",").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.send_raw("\"id\":5,\"result\":{\"ok\":true}}\n{\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n")
            .await;

        let response = call.await.unwrap().unwrap().unwrap();
        assert_eq!(response.result(), Some(&json!({"ok": true})));
    }

    #[tokio::test]
    async fn notifications_do_not_wait() {
        let (mux, _inbound, mut peer) = harness();
        let outcome = mux
            .send_request(&JsonRpcRequest::notification("notifications/initialized", None))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(peer.next_json().await["method"], "notifications/initialized");
        assert_eq!(mux.pending_count().await, 0);
    }

    #[tokio::test]
    async fn stop_rejects_every_pending_request() {
        let (mux, _inbound, mut peer) = harness();
        let first = spawn_send(&mux, 1);
        let second = spawn_send(&mux, 2);
        peer.next_json().await;
        peer.next_json().await;

        mux.stop().await;

        assert_eq!(first.await.unwrap(), Err(StreamError::SessionTerminated));
        assert_eq!(second.await.unwrap(), Err(StreamError::SessionTerminated));
        assert!(mux.is_stopped());
        assert_eq!(
            mux.send_request(&JsonRpcRequest::new(3, "x", None)).await,
            Err(StreamError::SessionTerminated)
        );
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (mux, _inbound, mut peer) = harness();
        let _first = spawn_send(&mux, 1);
        peer.next_json().await;
        assert_eq!(
            mux.send_request(&JsonRpcRequest::new(1, "again", None)).await,
            Err(StreamError::DuplicateId {
                id: "1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn unconsumed_inbound_request_is_refused() {
        let (_mux, inbound, mut peer) = harness();
        drop(inbound);
        peer.send_raw("{\"jsonrpc\":\"2.0\",\"id\":\"s-1\",\"method\":\"sampling/createMessage\"}\n")
            .await;
        let refusal = peer.next_json().await;
        assert_eq!(refusal["id"], "s-1");
        assert_eq!(refusal["error"]["code"], ErrorKind::METHOD_NOT_FOUND);
    }
}
