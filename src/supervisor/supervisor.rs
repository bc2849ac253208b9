//! Per-service child process supervision.
//!
//! A supervisor owns exactly one child process and exposes a small command
//! surface: start, stop, restart, send_request, notification/log
//! subscription, and a status snapshot. Lifecycle transitions follow the
//! state machine in the module docs of [`crate::supervisor`]; the crash
//! handler only acts while the child is supposed to be running, so `stop`
//! flips the state to `Stopped` *before* signalling.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::framer::Framer;
use super::log_buffer::LogBuffer;
use crate::error::GatewayError;
use crate::registry::ServiceDefinition;
use crate::rpc::{RpcId, RpcRequest, RpcResponse};

/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Back-off cap for automatic restarts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopped,
    Crashed,
    Restarting,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Crashed => "crashed",
            ServiceState::Restarting => "restarting",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }
}

/// Point-in-time view of a supervisor, safe to serialise to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub dropped_notifications: u64,
}

#[derive(Debug)]
struct Runtime {
    state: ServiceState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    restart_count: u32,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct Supervisor {
    def: RwLock<ServiceDefinition>,
    runtime: Mutex<Runtime>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    framer: Mutex<Option<Arc<Framer>>>,
    logs: Arc<LogBuffer>,
    /// Bumped on every spawn and on stop; monitor tasks from older
    /// generations see the mismatch and stand down.
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(def: ServiceDefinition, logs: Arc<LogBuffer>) -> Arc<Self> {
        Arc::new(Self {
            def: RwLock::new(def),
            runtime: Mutex::new(Runtime {
                state: ServiceState::Stopped,
                pid: None,
                started_at: None,
                restart_count: 0,
                last_error: None,
            }),
            child: tokio::sync::Mutex::new(None),
            framer: Mutex::new(None),
            logs,
            generation: AtomicU64::new(0),
        })
    }

    pub fn definition(&self) -> ServiceDefinition {
        self.def.read().expect("definition lock poisoned").clone()
    }

    pub fn update_definition(&self, def: ServiceDefinition) {
        *self.def.write().expect("definition lock poisoned") = def;
    }

    pub fn state(&self) -> ServiceState {
        self.runtime.lock().expect("runtime lock poisoned").state
    }

    pub fn status(&self) -> ServiceStatus {
        let rt = self.runtime.lock().expect("runtime lock poisoned");
        let dropped = self
            .framer
            .lock()
            .expect("framer slot poisoned")
            .as_ref()
            .map(|f| f.dropped_notifications())
            .unwrap_or(0);
        ServiceStatus {
            state: rt.state,
            pid: rt.pid,
            uptime_secs: rt.started_at.map(|t| t.elapsed().as_secs()),
            restart_count: rt.restart_count,
            last_error: rt.last_error.clone(),
            dropped_notifications: dropped,
        }
    }

    /// Explicit (user-initiated) start. Resets the restart counter.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            match rt.state {
                ServiceState::Stopped | ServiceState::Crashed => {}
                other => {
                    return Err(GatewayError::IllegalState {
                        status: other.as_str().to_string(),
                        last_error: rt.last_error.clone(),
                    })
                }
            }
            rt.state = ServiceState::Starting;
            rt.restart_count = 0;
            rt.last_error = None;
        }

        if let Err(cause) = self.spawn_child().await {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            rt.state = ServiceState::Crashed;
            rt.last_error = Some(cause.clone());
            drop(rt);
            error!(service = %self.definition().id, "start failed: {cause}");
            return Err(GatewayError::Internal(cause));
        }
        Ok(())
    }

    /// Stop the child. Idempotent; cancels all in-flight requests with
    /// `transportClosed`.
    pub async fn stop(&self) -> Result<(), GatewayError> {
        let id = self.definition().id;
        {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            if rt.state == ServiceState::Stopped {
                return Ok(());
            }
            // Stopped before signalling: the crash handler must not see
            // this exit as a crash.
            rt.state = ServiceState::Stopped;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        let framer = self.framer.lock().expect("framer slot poisoned").take();
        if let Some(framer) = framer {
            framer.fail("service stopped");
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let pid = child.id();
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            let _ = child.start_kill();

            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => debug!(service = %id, "child exited within grace period"),
                Err(_) => {
                    warn!(service = %id, "child ignored SIGTERM, killing");
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        signal_group(pid, libc::SIGKILL);
                    }
                    let _ = child.kill().await;
                }
            }
        }

        {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            rt.pid = None;
            rt.started_at = None;
        }
        info!(service = %id, "service stopped");
        Ok(())
    }

    /// Explicit restart: stop, then start. Resets the restart counter.
    pub async fn restart(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.stop().await?;
        self.start().await
    }

    /// Forward one JSON-RPC request to the child and await its response.
    ///
    /// The client's `id` (or its absence) is preserved on the returned
    /// envelope; internally every request travels under a fresh monotonic
    /// id so concurrent callers can never collide.
    pub async fn send_request(&self, mut request: RpcRequest) -> Result<RpcResponse, GatewayError> {
        let timeout_ms = {
            let rt = self.runtime.lock().expect("runtime lock poisoned");
            if !rt.state.is_running() {
                return Err(GatewayError::IllegalState {
                    status: rt.state.as_str().to_string(),
                    last_error: rt.last_error.clone(),
                });
            }
            self.def
                .read()
                .expect("definition lock poisoned")
                .timeout_ms
        };

        let framer = {
            let slot = self.framer.lock().expect("framer slot poisoned");
            match slot.as_ref() {
                Some(f) => Arc::clone(f),
                None => {
                    return Err(GatewayError::TransportClosed(
                        "child transport not attached".to_string(),
                    ))
                }
            }
        };

        let original_id = request.id.take();
        let internal_id = framer.allocate_id();
        request.id = Some(RpcId::Num(internal_id));

        let rx = framer.register(internal_id)?;
        // Removes the pending entry on every exit, including the caller
        // being cancelled (client disconnect); a late response is then
        // logged as an orphan and discarded.
        let _guard = PendingGuard {
            framer: Arc::clone(&framer),
            id: internal_id,
        };
        framer.send(&request).await?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(mut response)) => {
                response.id = original_id;
                Ok(response)
            }
            Ok(Err(_)) => Err(GatewayError::TransportClosed(
                framer
                    .close_cause()
                    .unwrap_or_else(|| "transport closed".to_string()),
            )),
            Err(_) => Err(GatewayError::Timeout(timeout_ms)),
        }
    }

    /// Subscribe to the child's notification stream.
    pub fn subscribe_notifications(&self) -> Result<broadcast::Receiver<RpcRequest>, GatewayError> {
        let slot = self.framer.lock().expect("framer slot poisoned");
        match slot.as_ref() {
            Some(f) => Ok(f.subscribe_notifications()),
            None => {
                let rt = self.runtime.lock().expect("runtime lock poisoned");
                Err(GatewayError::IllegalState {
                    status: rt.state.as_str().to_string(),
                    last_error: rt.last_error.clone(),
                })
            }
        }
    }

    /// Subscribe to the service's captured log lines.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<super::log_buffer::LogLine> {
        self.logs.subscribe(&self.definition().id)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn spawn_child<'a>(
        self: &'a Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            let def = self.definition();
            let workdir = Path::new(&def.working_dir);
            if !workdir.is_dir() {
                return Err(format!(
                    "working directory {} does not exist",
                    workdir.display()
                ));
            }

            let program = resolve_entry_point(&def);
            let mut cmd = Command::new(&program);
            cmd.args(&def.args)
                .current_dir(&def.working_dir)
                .envs(def.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            // Own process group so stop can signal grand-children too. On
            // platforms without process groups this is a best-effort kill of
            // the direct child only.
            #[cfg(unix)]
            cmd.process_group(0);

            let mut child = cmd.spawn().map_err(|e| format!("spawn failed: {e}"))?;
            let pid = child.id();

            let stdin = child.stdin.take().ok_or("child stdin not piped")?;
            let stdout = child.stdout.take().ok_or("child stdout not piped")?;
            let stderr = child.stderr.take();

            let (framer, failure_rx) = Framer::spawn(
                def.id.clone(),
                stdin,
                stdout,
                stderr,
                Arc::clone(&self.logs),
            );
            *self.framer.lock().expect("framer slot poisoned") = Some(framer);
            *self.child.lock().await = Some(child);

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut rt = self.runtime.lock().expect("runtime lock poisoned");
                rt.state = ServiceState::Running;
                rt.pid = pid;
                rt.started_at = Some(Instant::now());
                rt.last_error = None;
            }

            info!(service = %def.id, pid = ?pid, "service started");
            self.logs.push(&def.id, "system", "process started");

            let interval = Duration::from_secs(def.health_check_interval.max(1));
            let monitor_fut: Pin<Box<dyn Future<Output = ()> + Send>> =
                Box::pin(Arc::clone(self).monitor(generation, failure_rx, interval));
            tokio::spawn(monitor_fut);
            Ok(())
        })
    }

    /// Watches one child generation: reacts to transport failure reports
    /// and runs the periodic OS-level liveness probe.
    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut failure_rx: mpsc::UnboundedReceiver<String>,
        interval: Duration,
    ) {
        loop {
            tokio::select! {
                cause = failure_rx.recv() => {
                    let cause = cause.unwrap_or_else(|| "transport closed".to_string());
                    self.handle_exit(generation, &cause).await;
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    if self.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    if !self.probe_alive().await {
                        self.handle_exit(generation, "liveness probe failed").await;
                        return;
                    }
                }
            }
        }
    }

    async fn probe_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Crash path: the child went away while it was supposed to run.
    async fn handle_exit(self: &Arc<Self>, generation: u64, cause: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let def = self.definition();
        let attempt = {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            if !matches!(rt.state, ServiceState::Running | ServiceState::Starting) {
                // An intentional stop got here first.
                return;
            }
            rt.state = ServiceState::Crashed;
            rt.pid = None;
            rt.started_at = None;
            rt.last_error = Some(cause.to_string());
            rt.restart_count
        };

        let framer = self.framer.lock().expect("framer slot poisoned").take();
        if let Some(framer) = framer {
            framer.fail(cause);
        }
        self.child.lock().await.take();

        warn!(service = %def.id, "child exited: {cause}");
        self.logs
            .push(&def.id, "system", format!("process exited: {cause}"));

        if !def.auto_restart {
            return;
        }
        if attempt >= def.max_restarts {
            error!(
                service = %def.id,
                attempts = attempt,
                "restart cap reached, leaving service crashed"
            );
            return;
        }

        {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            rt.state = ServiceState::Restarting;
            rt.restart_count = attempt + 1;
        }
        let delay = backoff_delay(attempt);
        info!(
            service = %def.id,
            attempt = attempt + 1,
            max = def.max_restarts,
            "restarting in {delay:?}"
        );
        tokio::time::sleep(delay).await;

        {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            if rt.state != ServiceState::Restarting {
                // The user intervened during the back-off.
                return;
            }
            rt.state = ServiceState::Starting;
        }

        if let Err(e) = self.spawn_child().await {
            let mut rt = self.runtime.lock().expect("runtime lock poisoned");
            rt.state = ServiceState::Crashed;
            rt.last_error = Some(e.clone());
            drop(rt);
            error!(service = %def.id, "automatic restart failed: {e}");
        }
    }
}

struct PendingGuard {
    framer: Arc<Framer>,
    id: i64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.framer.remove_pending(self.id);
    }
}

/// Exponential restart back-off: `min(1s * 2^n, 30s)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Entry points resolve against the working directory when they name a file
/// there, otherwise fall back to a PATH lookup.
fn resolve_entry_point(def: &ServiceDefinition) -> PathBuf {
    let raw = Path::new(&def.entry_point);
    if raw.is_absolute() {
        return raw.to_path_buf();
    }
    let joined = Path::new(&def.working_dir).join(raw);
    if joined.exists() {
        joined
    } else {
        raw.to_path_buf()
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // Negative pid addresses the whole process group.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceSpec;
    use serde_json::json;

    fn definition(entry: &str, args: Vec<&str>) -> ServiceDefinition {
        let spec: ServiceSpec = serde_json::from_value(json!({
            "name": "test",
            "entryPoint": entry,
            "workingDir": "/tmp",
            "proxyPath": "/mcp/test",
            "timeoutMs": 1000,
            "healthCheckInterval": 1,
        }))
        .unwrap();
        let mut def = ServiceDefinition::from_spec("svc-test", spec);
        def.args = args.into_iter().map(String::from).collect();
        def
    }

    fn echo_def() -> ServiceDefinition {
        definition(
            "/bin/sh",
            vec![
                "-c",
                r#"while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
done"#,
            ],
        )
    }

    async fn wait_for_state(sup: &Arc<Supervisor>, want: ServiceState, secs: u64) -> bool {
        for _ in 0..(secs * 20) {
            if sup.state() == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn start_and_stop_transitions() {
        let sup = Supervisor::new(
            definition("/bin/sh", vec!["-c", "sleep 30"]),
            Arc::new(LogBuffer::default()),
        );
        assert_eq!(sup.state(), ServiceState::Stopped);

        sup.start().await.unwrap();
        assert_eq!(sup.state(), ServiceState::Running);
        assert!(sup.status().pid.is_some());

        sup.stop().await.unwrap();
        assert_eq!(sup.state(), ServiceState::Stopped);
        assert!(sup.status().pid.is_none());

        // stop is idempotent
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_while_running_is_illegal() {
        let sup = Supervisor::new(
            definition("/bin/sh", vec!["-c", "sleep 30"]),
            Arc::new(LogBuffer::default()),
        );
        sup.start().await.unwrap();
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::IllegalState { .. }));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_when_working_dir_missing() {
        let mut def = definition("/bin/sh", vec!["-c", "true"]);
        def.working_dir = "/definitely/not/a/dir".into();
        let sup = Supervisor::new(def, Arc::new(LogBuffer::default()));
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(sup.state(), ServiceState::Crashed);
    }

    #[tokio::test]
    async fn send_request_restores_client_id() {
        let sup = Supervisor::new(echo_def(), Arc::new(LogBuffer::default()));
        sup.start().await.unwrap();

        let req = RpcRequest::new(Some(RpcId::Num(7)), "ping", None);
        let resp = sup.send_request(req).await.unwrap();
        assert_eq!(resp.id, Some(RpcId::Num(7)));

        let req = RpcRequest::new(Some(RpcId::Str("client-id".into())), "ping", None);
        let resp = sup.send_request(req).await.unwrap();
        assert_eq!(resp.id, Some(RpcId::Str("client-id".into())));

        // Absent id stays absent.
        let resp = sup
            .send_request(RpcRequest::new(None, "ping", None))
            .await
            .unwrap();
        assert_eq!(resp.id, None);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_request_times_out_against_silent_child() {
        // Consumes stdin but never answers.
        let sup = Supervisor::new(
            definition("/bin/sh", vec!["-c", "cat > /dev/null"]),
            Arc::new(LogBuffer::default()),
        );
        sup.start().await.unwrap();

        let started = Instant::now();
        let err = sup
            .send_request(RpcRequest::new(Some(RpcId::Num(1)), "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(1000)));
        assert!(started.elapsed() < Duration::from_millis(2000));

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_request_when_stopped_is_illegal_state() {
        let sup = Supervisor::new(echo_def(), Arc::new(LogBuffer::default()));
        let err = sup
            .send_request(RpcRequest::new(None, "ping", None))
            .await
            .unwrap_err();
        match err {
            GatewayError::IllegalState { status, .. } => assert_eq!(status, "stopped"),
            other => panic!("expected illegal state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_requests() {
        let sup = Supervisor::new(
            definition("/bin/sh", vec!["-c", "cat > /dev/null"]),
            Arc::new(LogBuffer::default()),
        );
        sup.start().await.unwrap();

        let sup2 = Arc::clone(&sup);
        let waiter = tokio::spawn(async move {
            sup2.send_request(RpcRequest::new(Some(RpcId::Num(1)), "slow", None))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        sup.stop().await.unwrap();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GatewayError::TransportClosed(_))));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn crash_triggers_capped_auto_restart() {
        let mut def = definition("/bin/sh", vec!["-c", "exit 1"]);
        def.auto_restart = true;
        def.max_restarts = 1;
        let sup = Supervisor::new(def, Arc::new(LogBuffer::default()));

        sup.start().await.unwrap();
        // First exit -> crashed -> restarting -> starting -> running -> exit
        // again -> cap reached -> crashed for good.
        assert!(wait_for_state(&sup, ServiceState::Crashed, 10).await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sup.state(), ServiceState::Crashed);
        let status = sup.status();
        assert_eq!(status.restart_count, 1);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn explicit_start_resets_restart_counter() {
        let mut def = definition("/bin/sh", vec!["-c", "exit 1"]);
        def.auto_restart = true;
        def.max_restarts = 0;
        let sup = Supervisor::new(def, Arc::new(LogBuffer::default()));

        sup.start().await.unwrap();
        assert!(wait_for_state(&sup, ServiceState::Crashed, 5).await);

        // A fresh user start is allowed from crashed and clears the counter.
        sup.start().await.unwrap();
        assert_eq!(sup.status().restart_count, 0);
        let _ = sup.stop().await;
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let mut last = Duration::ZERO;
        for attempt in 0..12 {
            let delay = backoff_delay(attempt);
            assert!(delay >= last, "delay regressed at attempt {attempt}");
            assert!(delay <= Duration::from_secs(30));
            last = delay;
        }
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }
}
