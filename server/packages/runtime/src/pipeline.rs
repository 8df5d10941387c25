//! Interceptor chain in front of a request target.
//!
//! Requests run through the interceptors in order, the target answers, and
//! the response runs back through them in reverse. Whatever happens in
//! between, the caller gets exactly one response carrying the id it sent.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId};
use mcpadre_error::McpadreError;

pub type PipelineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, McpadreError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Pass the (possibly rewritten) request on.
    Continue(JsonRpcRequest),
    /// Answer with this result; neither the target nor any later
    /// interceptor sees the request.
    Override(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Continue(JsonRpcResponse),
    /// Use this response as-is and skip the rest of the backward pass.
    Override(JsonRpcResponse),
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn process_request(&self, request: JsonRpcRequest) -> PipelineFuture<'_, RequestOutcome> {
        Box::pin(async move { Ok(RequestOutcome::Continue(request)) })
    }

    fn process_response(&self, response: JsonRpcResponse) -> PipelineFuture<'_, ResponseOutcome> {
        Box::pin(async move { Ok(ResponseOutcome::Continue(response)) })
    }

    /// Called instead of [`process_response`] when a request this interceptor
    /// passed on failed further down the chain.
    ///
    /// [`process_response`]: Interceptor::process_response
    fn request_failed(&self, _id: &RequestId, _error: &McpadreError) {}
}

/// Terminal handler of a pipeline.
pub trait PipelineTarget: Send + Sync {
    fn call(&self, request: JsonRpcRequest) -> PipelineFuture<'_, JsonRpcResponse>;
}

impl<F, Fut> PipelineTarget for F
where
    F: Fn(JsonRpcRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonRpcResponse, McpadreError>> + Send + 'static,
{
    fn call(&self, request: JsonRpcRequest) -> PipelineFuture<'_, JsonRpcResponse> {
        Box::pin(self(request))
    }
}

pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    target: Arc<dyn PipelineTarget>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("interceptors", &self.interceptor_names())
            .finish()
    }
}

impl Pipeline {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>, target: Arc<dyn PipelineTarget>) -> Self {
        Self {
            interceptors,
            target,
        }
    }

    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub async fn process(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        process_pipeline(&self.interceptors, self.target.as_ref(), request).await
    }
}

/// Runs `request` through `interceptors` and `target`. Never fails: errors
/// become JSON-RPC error responses, and the response id is always the
/// request's id (null when it had none).
pub async fn process_pipeline(
    interceptors: &[Arc<dyn Interceptor>],
    target: &dyn PipelineTarget,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let id = request.response_id();
    let method = request.method.clone();

    match run_chain(interceptors, target, request).await {
        Ok(mut response) => {
            response.id = id;
            response
        }
        Err(err) => {
            tracing::debug!(method = %method, error = %err, code = err.code(), "request failed in pipeline");
            JsonRpcResponse::from_error(id, &err)
        }
    }
}

async fn run_chain(
    interceptors: &[Arc<dyn Interceptor>],
    target: &dyn PipelineTarget,
    request: JsonRpcRequest,
) -> Result<JsonRpcResponse, McpadreError> {
    let id = request.response_id();
    let mut request = request;

    for (index, interceptor) in interceptors.iter().enumerate() {
        let outcome = match interceptor.process_request(request).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(abandon(&interceptors[..index], &id, err)),
        };
        match outcome {
            RequestOutcome::Continue(next) => request = next,
            RequestOutcome::Override(result) => {
                tracing::debug!(interceptor = interceptor.name(), "request answered by interceptor");
                return Ok(JsonRpcResponse::success(id, result));
            }
        }
    }

    let mut response = match target.call(request).await {
        Ok(response) => response,
        Err(err) => return Err(abandon(interceptors, &id, err)),
    };

    for (index, interceptor) in interceptors.iter().enumerate().rev() {
        let outcome = match interceptor.process_response(response).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(abandon(&interceptors[..=index], &id, err)),
        };
        match outcome {
            ResponseOutcome::Continue(next) => response = next,
            ResponseOutcome::Override(replacement) => {
                tracing::debug!(interceptor = interceptor.name(), "response replaced by interceptor");
                response = replacement;
                break;
            }
        }
    }

    Ok(response)
}

/// Tells every interceptor that passed the request on that it failed.
fn abandon(passed: &[Arc<dyn Interceptor>], id: &RequestId, err: McpadreError) -> McpadreError {
    for interceptor in passed.iter().rev() {
        interceptor.request_failed(id, &err);
    }
    err
}
