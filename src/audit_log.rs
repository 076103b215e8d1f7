use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::interceptor::OnCompletion;
use crate::proxy::{AttemptInfo, ResponseHook};

const MAX_AUDIT_BODY_BYTES: usize = 256 * 1024;

/// Async JSONL audit sink. Records are pushed onto a channel and appended
/// by a dedicated writer task; files rotate when `max_file_bytes` would be
/// exceeded.
#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<AuditRecord>,
}

impl AuditLogger {
    pub fn new(base_path: String, max_file_bytes: u64) -> Result<Self, String> {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(256);
        tokio::spawn(async move {
            let mut current_path = build_log_path(&base_path);
            let mut file = match open_log_file(&current_path).await {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!("audit log open error: {}", err);
                    return;
                }
            };
            let mut current_size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
            while let Some(record) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&record) {
                    let projected = current_size + line.len() as u64 + 1;
                    if projected > max_file_bytes {
                        current_path = build_log_path(&base_path);
                        match open_log_file(&current_path).await {
                            Ok(new_file) => {
                                file = new_file;
                                current_size = 0;
                            }
                            Err(err) => {
                                tracing::error!("audit log rotate error: {}", err);
                            }
                        }
                    }
                    if file.write_all(line.as_bytes()).await.is_err() {
                        tracing::error!("audit log write error");
                        continue;
                    }
                    if file.write_all(b"\n").await.is_err() {
                        tracing::error!("audit log write error");
                    }
                    current_size += line.len() as u64 + 1;
                }
            }
        });
        Ok(Self { sender: tx })
    }

    /// Enqueues a record without waiting; a full queue drops the record
    /// rather than stall the caller.
    pub fn try_push(&self, record: AuditRecord) {
        if self.sender.try_send(record).is_err() {
            tracing::warn!("audit log queue full; dropping record");
        }
    }
}

/// One record per completed upstream stream.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    pub ts_ms: u128,
    pub method: String,
    pub path: String,
    pub original_model: String,
    pub provider: String,
    pub translated_model: String,
    pub status: u16,
    pub body_bytes: usize,
    pub body: String,
    pub body_truncated: bool,
}

/// Response hook wiring the audit sink into the proxy: every dispatched
/// response gets a completion callback that records the buffered body once
/// the stream finishes cleanly.
pub fn completion_hook(logger: AuditLogger) -> ResponseHook {
    Arc::new(move |attempt: &AttemptInfo, response: &reqwest::Response| {
        let logger = logger.clone();
        let attempt = attempt.clone();
        let status = response.status().as_u16();
        let callback: OnCompletion = Box::new(move |body: Bytes| {
            let (text, truncated) = render_body(&body);
            logger.try_push(AuditRecord {
                ts_ms: now_ms(),
                method: attempt.method,
                path: attempt.path,
                original_model: attempt.original_model,
                provider: attempt.provider,
                translated_model: attempt.translated_model,
                status,
                body_bytes: body.len(),
                body: text,
                body_truncated: truncated,
            });
        });
        Some(callback)
    })
}

fn render_body(body: &Bytes) -> (String, bool) {
    let truncated = body.len() > MAX_AUDIT_BODY_BYTES;
    let end = body.len().min(MAX_AUDIT_BODY_BYTES);
    (String::from_utf8_lossy(&body[..end]).into_owned(), truncated)
}

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn build_log_path(base: &str) -> String {
    let ts = now_ms();
    if let Some(stripped) = base.strip_suffix(".jsonl") {
        format!("{}.{}.jsonl", stripped, ts)
    } else {
        format!("{}.{}", base, ts)
    }
}

async fn open_log_file(path: &str) -> Result<tokio::fs::File, std::io::Error> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
