use std::sync::Mutex;

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::pipeline::{Interceptor, PipelineFuture, RequestOutcome, ResponseOutcome};
use mcpadre_error::McpadreError;

const INITIALIZE: &str = "initialize";
const PING: &str = "ping";

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Uninitialized,
    /// `initialize` forwarded; a failed answer returns to `Uninitialized`.
    Initializing(RequestId),
    Initialized,
}

/// Enforces the handshake: only `initialize` and `ping` before a successful
/// `initialize`, and `initialize` only once. Notifications pass untouched.
#[derive(Debug)]
pub struct ProtocolGate {
    phase: Mutex<Phase>,
}

impl Default for ProtocolGate {
    fn default() -> Self {
        Self {
            phase: Mutex::new(Phase::Uninitialized),
        }
    }
}

impl ProtocolGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.phase
            .lock()
            .map(|phase| *phase == Phase::Initialized)
            .unwrap_or(false)
    }

    fn admit(&self, request: &JsonRpcRequest) -> Result<(), McpadreError> {
        if request.is_notification() {
            return Ok(());
        }
        let mut phase = self
            .phase
            .lock()
            .map_err(|_| McpadreError::internal("protocol gate state poisoned"))?;

        match (&*phase, request.method.as_str()) {
            (Phase::Uninitialized, INITIALIZE) => {
                *phase = Phase::Initializing(request.response_id());
                Ok(())
            }
            (_, INITIALIZE) => Err(McpadreError::InvalidRequest {
                message: "server is already initialized".to_string(),
            }),
            (_, PING) | (Phase::Initialized, _) => Ok(()),
            (_, method) => Err(McpadreError::InvalidRequest {
                message: format!("`{method}` sent before initialization completed"),
            }),
        }
    }

    fn settle(&self, id: &RequestId, succeeded: bool) {
        let Ok(mut phase) = self.phase.lock() else {
            return;
        };
        if let Phase::Initializing(pending) = &*phase {
            if pending == id {
                *phase = if succeeded {
                    Phase::Initialized
                } else {
                    Phase::Uninitialized
                };
            }
        }
    }
}

impl Interceptor for ProtocolGate {
    fn name(&self) -> &str {
        "protocol-gate"
    }

    fn process_request(&self, request: JsonRpcRequest) -> PipelineFuture<'_, RequestOutcome> {
        Box::pin(async move {
            self.admit(&request)?;
            Ok(RequestOutcome::Continue(request))
        })
    }

    fn process_response(&self, response: JsonRpcResponse) -> PipelineFuture<'_, ResponseOutcome> {
        Box::pin(async move {
            self.settle(&response.id, !response.is_error());
            Ok(ResponseOutcome::Continue(response))
        })
    }

    fn request_failed(&self, id: &RequestId, _error: &McpadreError) {
        self.settle(id, false);
    }
}
