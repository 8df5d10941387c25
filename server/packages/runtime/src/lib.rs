//! Runtime core of mcpadre: runs a tool server as a child process, optionally
//! inside an OS sandbox, and proxies newline-delimited JSON-RPC between the
//! caller and the child through an interceptor pipeline.

pub mod cli;
pub mod client;
pub mod config;
pub mod directories;
pub mod interceptors;
pub mod jsonrpc;
pub mod launch;
pub mod pipeline;
pub mod sandbox;
pub mod session;
pub mod stream;
pub mod template;

pub use client::{build_client, ClientContext, ClientError, ProcessClient, ProcessState};
pub use config::{RuntimeTunables, ServerConfig};
pub use directories::{DirectoryResolver, ExecutionScope};
pub use jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId};
pub use pipeline::{process_pipeline, Interceptor, Pipeline, PipelineTarget, RequestOutcome, ResponseOutcome};
pub use session::{Session, SessionOptions, SessionState};
pub use stream::{StreamError, StreamMultiplexer};
