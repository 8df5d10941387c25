use std::collections::BTreeSet;

use crate::jsonrpc::JsonRpcRequest;
use crate::pipeline::{Interceptor, PipelineFuture, RequestOutcome};
use mcpadre_error::McpadreError;

/// Refuses a fixed set of methods as if the server did not implement them.
#[derive(Debug, Clone, Default)]
pub struct MethodFirewall {
    blocked: BTreeSet<String>,
}

impl MethodFirewall {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: methods.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_blocked(&self, method: &str) -> bool {
        self.blocked.contains(method)
    }
}

impl Interceptor for MethodFirewall {
    fn name(&self) -> &str {
        "method-firewall"
    }

    fn process_request(&self, request: JsonRpcRequest) -> PipelineFuture<'_, RequestOutcome> {
        Box::pin(async move {
            if self.is_blocked(&request.method) {
                tracing::info!(method = %request.method, "blocked method");
                return Err(McpadreError::MethodNotFound {
                    method: request.method,
                });
            }
            Ok(RequestOutcome::Continue(request))
        })
    }
}
