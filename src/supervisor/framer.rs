//! Newline-delimited JSON-RPC 2.0 framing over a child's stdio.
//!
//! One frame is one JSON object terminated by `\n`. Writes go through a
//! mutex so concurrent senders cannot interleave bytes; reads run on a
//! dedicated task that correlates responses against the pending table and
//! fans notifications out over a bounded broadcast channel. Stderr is never
//! framed; it is forwarded line-by-line to the log sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::log_buffer::LogBuffer;
use crate::error::GatewayError;
use crate::rpc::{self, RpcId, RpcMessage, RpcRequest, RpcResponse};

/// Bounded notification fan-out; lagging subscribers lose oldest first.
const NOTIFICATION_CAPACITY: usize = 256;

/// Consecutive unparseable stdout lines tolerated before the child is
/// reported failed.
const MAX_PARSE_FAILURES: u32 = 100;

#[derive(Debug)]
pub struct Framer {
    service_id: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Arc<Mutex<HashMap<i64, oneshot::Sender<RpcResponse>>>>,
    next_id: AtomicI64,
    notifications: broadcast::Sender<RpcRequest>,
    dropped_notifications: AtomicU64,
    closed: Mutex<Option<String>>,
    failure_tx: mpsc::UnboundedSender<String>,
    logs: Arc<LogBuffer>,
}

impl Framer {
    /// Wire up a framer over the child's pipes and start the reader tasks.
    ///
    /// The returned receiver yields at most one `childFailed` cause: EOF,
    /// write failure, or the parse-failure threshold.
    pub fn spawn(
        service_id: impl Into<String>,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
        logs: Arc<LogBuffer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let framer = Arc::new(Self {
            service_id: service_id.into(),
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(0),
            notifications: notify_tx,
            dropped_notifications: AtomicU64::new(0),
            closed: Mutex::new(None),
            failure_tx,
            logs,
        });

        tokio::spawn(Arc::clone(&framer).read_loop(stdout));
        if let Some(stderr) = stderr {
            tokio::spawn(Arc::clone(&framer).stderr_loop(stderr));
        }

        (framer, failure_rx)
    }

    /// Allocate a fresh internal request id. Monotonic per child, never
    /// reused while outstanding.
    pub fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register interest in the response for `id`. Fails when the transport
    /// has already closed.
    pub fn register(&self, id: i64) -> Result<oneshot::Receiver<RpcResponse>, GatewayError> {
        if let Some(cause) = self.close_cause() {
            return Err(GatewayError::TransportClosed(cause));
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(id, tx);
        Ok(rx)
    }

    /// Drop a pending entry (deadline elapsed or caller went away). The
    /// response, if it ever arrives, is logged and discarded.
    pub fn remove_pending(&self, id: i64) {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(&id);
    }

    /// Serialise and write one frame. A failed write closes the transport.
    pub async fn send(&self, request: &RpcRequest) -> Result<(), GatewayError> {
        if let Some(cause) = self.close_cause() {
            return Err(GatewayError::TransportClosed(cause));
        }

        let mut frame = serde_json::to_string(request)?;
        frame.push('\n');

        let mut stdin = self.stdin.lock().await;
        if let Err(e) = stdin.write_all(frame.as_bytes()).await {
            drop(stdin);
            let cause = format!("stdin write failed: {e}");
            self.fail(&cause);
            return Err(GatewayError::TransportClosed(cause));
        }
        if let Err(e) = stdin.flush().await {
            drop(stdin);
            let cause = format!("stdin flush failed: {e}");
            self.fail(&cause);
            return Err(GatewayError::TransportClosed(cause));
        }
        Ok(())
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<RpcRequest> {
        self.notifications.subscribe()
    }

    /// Notifications discarded because no subscriber could take them.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    pub fn close_cause(&self) -> Option<String> {
        self.closed.lock().expect("closed lock poisoned").clone()
    }

    /// Close the transport: every outstanding request completes with
    /// `transportClosed`, and the supervisor is notified once.
    pub fn fail(&self, cause: &str) {
        {
            let mut closed = self.closed.lock().expect("closed lock poisoned");
            if closed.is_some() {
                return;
            }
            *closed = Some(cause.to_string());
        }

        let outstanding = {
            let mut pending = self.pending.lock().expect("pending table lock poisoned");
            let n = pending.len();
            // Dropping the senders wakes every waiter with a closed channel.
            pending.clear();
            n
        };
        if outstanding > 0 {
            warn!(
                service = %self.service_id,
                outstanding, "transport closed with requests in flight: {cause}"
            );
        }
        let _ = self.failure_tx.send(cause.to_string());
    }

    async fn read_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        let mut parse_failures: u32 = 0;
        let mut threshold_reported = false;

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    self.fail("child stdout closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match rpc::classify(trimmed) {
                        RpcMessage::Response(resp) => {
                            parse_failures = 0;
                            self.deliver_response(resp, trimmed);
                        }
                        RpcMessage::Notification(note) | RpcMessage::Request(note) => {
                            parse_failures = 0;
                            if self.notifications.send(note).is_err() {
                                self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        RpcMessage::Invalid(text) => {
                            self.logs.push(&self.service_id, "stdout", text);
                            parse_failures += 1;
                            if parse_failures > MAX_PARSE_FAILURES && !threshold_reported {
                                threshold_reported = true;
                                self.fail("child stdout is not speaking JSON-RPC");
                            }
                        }
                    }
                }
                Err(e) => {
                    self.fail(&format!("stdout read error: {e}"));
                    break;
                }
            }
        }
    }

    fn deliver_response(&self, response: RpcResponse, raw: &str) {
        let sender = match &response.id {
            Some(RpcId::Num(n)) => self
                .pending
                .lock()
                .expect("pending table lock poisoned")
                .remove(n),
            _ => None,
        };
        match sender {
            Some(tx) => {
                // The receiver may already be gone (deadline elapsed or the
                // client disconnected); its response becomes an orphan.
                if tx.send(response).is_err() {
                    debug!(service = %self.service_id, "response arrived after its waiter left");
                }
            }
            None => {
                warn!(service = %self.service_id, "dropping response with unmatched id: {raw}");
            }
        }
    }

    async fn stderr_loop(self: Arc<Self>, stderr: ChildStderr) {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        self.logs.push(&self.service_id, "stderr", trimmed);
                    }
                }
            }
        }
    }
}
