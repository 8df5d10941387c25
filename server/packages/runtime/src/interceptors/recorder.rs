use std::path::{Path, PathBuf};

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::pipeline::{Interceptor, PipelineFuture, RequestOutcome, ResponseOutcome};

#[derive(Serialize)]
struct TrafficLine<'a> {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    req: Option<&'a JsonRpcRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    res: Option<&'a JsonRpcResponse>,
}

/// Appends every request and response to a JSON-lines file. Recording
/// never fails a request; write errors are only logged.
#[derive(Debug)]
pub struct TrafficRecorder {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl TrafficRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// `<log_dir>/<server>/traffic-<unix_ms>.jsonl`
    pub fn for_server(log_dir: &Path, server: &str) -> Self {
        let unix_ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        Self::new(log_dir.join(server).join(format!("traffic-{unix_ms}.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &TrafficLine<'_>) {
        let mut bytes = match serde_json::to_vec(line) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to encode traffic line");
                return;
            }
        };
        bytes.push(b'\n');

        let mut slot = self.file.lock().await;
        if slot.is_none() {
            match open_append(&self.path).await {
                Ok(file) => *slot = Some(file),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to open traffic log");
                    return;
                }
            }
        }
        let Some(file) = slot.as_mut() else {
            return;
        };
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to write traffic line");
            // Reopen on the next line.
            *slot = None;
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

impl Interceptor for TrafficRecorder {
    fn name(&self) -> &str {
        "traffic-recorder"
    }

    fn process_request(&self, request: JsonRpcRequest) -> PipelineFuture<'_, RequestOutcome> {
        Box::pin(async move {
            self.append(&TrafficLine {
                timestamp: timestamp(),
                req: Some(&request),
                res: None,
            })
            .await;
            Ok(RequestOutcome::Continue(request))
        })
    }

    fn process_response(&self, response: JsonRpcResponse) -> PipelineFuture<'_, ResponseOutcome> {
        Box::pin(async move {
            self.append(&TrafficLine {
                timestamp: timestamp(),
                req: None,
                res: Some(&response),
            })
            .await;
            Ok(ResponseOutcome::Continue(response))
        })
    }
}
