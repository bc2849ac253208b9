use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_MAX_LINES: usize = 1_000;
const STREAM_CAPACITY: usize = 256;

/// One captured line of child output.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Per-service ring buffer for captured stdout/stderr lines, with a
/// broadcast stream for live followers and an optional long-term file sink.
#[derive(Debug)]
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<String, VecDeque<LogLine>>>,
    streams: RwLock<HashMap<String, broadcast::Sender<LogLine>>>,
    file_dir: Option<PathBuf>,
}

impl LogBuffer {
    pub fn new(max_lines: usize, file_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &file_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                debug!("could not create log directory {}: {e}", dir.display());
            }
        }
        Self {
            max_lines,
            logs: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            file_dir,
        }
    }

    /// Append a line for the given service, trimming oldest if over capacity.
    pub fn push(&self, service: &str, level: &str, message: impl Into<String>) {
        let line = LogLine {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.into(),
        };

        {
            let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
            let entries = logs.entry(service.to_string()).or_default();
            entries.push_back(line.clone());
            while entries.len() > self.max_lines {
                entries.pop_front();
            }
        }

        {
            let streams = self.streams.read().expect("LogBuffer lock poisoned");
            if let Some(tx) = streams.get(service) {
                let _ = tx.send(line.clone());
            }
        }

        if let Some(dir) = &self.file_dir {
            self.append_to_file(dir, service, &line);
        }
    }

    /// Return the last `n` lines for a service (or all if `n` exceeds the
    /// stored count).
    pub fn tail(&self, service: &str, n: usize) -> Vec<LogLine> {
        let logs = self.logs.read().expect("LogBuffer lock poisoned");
        let Some(entries) = logs.get(service) else {
            return Vec::new();
        };
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    /// Subscribe to live log lines for a service.
    pub fn subscribe(&self, service: &str) -> broadcast::Receiver<LogLine> {
        let mut streams = self.streams.write().expect("LogBuffer lock poisoned");
        streams
            .entry(service.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_CAPACITY).0)
            .subscribe()
    }

    /// Remove all buffered logs for a service.
    pub fn clear(&self, service: &str) {
        let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
        logs.remove(service);
    }

    fn append_to_file(&self, dir: &PathBuf, service: &str, line: &LogLine) {
        let path = dir.join(format!("{service}.log"));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                writeln!(f, "{} [{}] {}", line.timestamp, line.level, line.message)
            });
        if let Err(e) = result {
            debug!("failed to append to {}: {e}", path.display());
        }
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_n_lines() {
        let buf = LogBuffer::default();
        for i in 0..10 {
            buf.push("svc", "info", format!("line {i}"));
        }
        let lines = buf.tail("svc", 3);
        let messages: Vec<&str> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn tail_unknown_service_returns_empty() {
        let buf = LogBuffer::default();
        assert!(buf.tail("unknown", 10).is_empty());
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let buf = LogBuffer::new(5, None);
        for i in 0..10 {
            buf.push("svc", "info", format!("line {i}"));
        }
        let lines = buf.tail("svc", 100);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0].message, "line 5");
        assert_eq!(lines[4].message, "line 9");
    }

    #[test]
    fn clear_removes_service_logs() {
        let buf = LogBuffer::default();
        buf.push("svc", "info", "hello");
        buf.clear("svc");
        assert!(buf.tail("svc", 10).is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_pushed_lines() {
        let buf = LogBuffer::default();
        let mut rx = buf.subscribe("svc");
        buf.push("svc", "stderr", "boom");
        let line = rx.recv().await.unwrap();
        assert_eq!(line.level, "stderr");
        assert_eq!(line.message, "boom");
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let buf = LogBuffer::new(10, Some(dir.path().to_path_buf()));
        buf.push("svc", "info", "persisted");
        let content = std::fs::read_to_string(dir.path().join("svc.log")).unwrap();
        assert!(content.contains("persisted"));
    }
}
