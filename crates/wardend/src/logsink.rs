//! Log sinks.
//!
//! Every operation streams `(component, message, stream)` events to a sink. The
//! daemon fans them out to tracing, to rolling plain-text files and to an in-memory
//! buffer that becomes the narrative of the operation report.
//!
//! File layout:
//! - `<log_dir>/<component>.log`: one file per component
//! - `<log_dir>/wardend.log`: everything
//!
//! Format: `2025-12-01T17:05:23Z [component] message` (`[component!]` for stderr)

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Aggregate log file name
pub const AGGREGATE_LOG: &str = "wardend.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

pub trait LogSink: Send + Sync {
    fn emit(&self, component: &str, message: &str, stream: Stream);

    fn info(&self, component: &str, message: &str) {
        self.emit(component, message, Stream::Stdout);
    }

    fn warn(&self, component: &str, message: &str) {
        self.emit(component, message, Stream::Stderr);
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, component: &str, message: &str, stream: Stream) {
        match stream {
            Stream::Stdout => info!(component, "{}", message),
            Stream::Stderr => warn!(component, "{}", message),
        }
    }
}

// ============================================================================
// Files
// ============================================================================

pub struct FileLogSink {
    dir: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn component_log(&self, component: &str) -> PathBuf {
        self.dir.join(format!("{}.log", sanitize(component)))
    }

    pub fn aggregate_log(&self) -> PathBuf {
        self.dir.join(AGGREGATE_LOG)
    }

    fn rotate_if_needed(&self, path: &Path) -> std::io::Result<()> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size >= self.max_bytes {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            fs::rename(path, PathBuf::from(rotated))?;
        }
        Ok(())
    }

    fn append(&self, path: &Path, line: &str) -> std::io::Result<()> {
        self.rotate_if_needed(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)
    }

    fn record(&self, component: &str, message: &str, stream: Stream) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let marker = match stream {
            Stream::Stdout => "",
            Stream::Stderr => "!",
        };
        let line = format!(
            "{} [{}{}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            component,
            marker,
            message
        );
        self.append(&self.component_log(component), &line)?;
        self.append(&self.aggregate_log(), &line)
    }
}

impl LogSink for FileLogSink {
    fn emit(&self, component: &str, message: &str, stream: Stream) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.record(component, message, stream) {
            warn!("Failed to write log for {}: {}", component, e);
        }
    }
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub component: String,
    pub message: String,
    pub stream: Stream,
}

/// Keeps events in memory; the narrative of each operation report comes from here
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Rendered lines, stderr prefixed with `!`
    pub fn lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|e| match e.stream {
                Stream::Stdout => format!("[{}] {}", e.component, e.message),
                Stream::Stderr => format!("[{}] ! {}", e.component, e.message),
            })
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn emit(&self, component: &str, message: &str, stream: Stream) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LogEvent {
                component: component.to_string(),
                message: message.to_string(),
                stream,
            });
    }
}

// ============================================================================
// Fan-out
// ============================================================================

#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl LogSink for FanoutSink {
    fn emit(&self, component: &str, message: &str, stream: Stream) {
        for sink in &self.sinks {
            sink.emit(component, message, stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_writes_component_and_aggregate() {
        let tmp = TempDir::new().unwrap();
        let sink = FileLogSink::new(tmp.path(), 1024 * 1024);
        sink.info("nginx", "installing");
        sink.warn("redis", "slow start");

        let nginx = fs::read_to_string(sink.component_log("nginx")).unwrap();
        assert!(nginx.contains("[nginx] installing"));
        let all = fs::read_to_string(sink.aggregate_log()).unwrap();
        assert!(all.contains("[nginx] installing"));
        assert!(all.contains("[redis!] slow start"));
    }

    #[test]
    fn test_file_sink_rotates() {
        let tmp = TempDir::new().unwrap();
        let sink = FileLogSink::new(tmp.path(), 64);
        for i in 0..10 {
            sink.info("postfix", &format!("line number {}", i));
        }
        assert!(tmp.path().join("postfix.log.1").exists());
        let current = fs::metadata(sink.component_log("postfix")).unwrap().len();
        assert!(current < 128);
    }

    #[test]
    fn test_sanitized_file_name() {
        let sink = FileLogSink::new("/tmp/x", 10);
        assert_eq!(sink.component_log("../evil"), PathBuf::from("/tmp/x/___evil.log"));
    }

    #[test]
    fn test_fanout_and_memory() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fan = FanoutSink::new(vec![a.clone(), b.clone()]);
        fan.warn("bind9", "checkconf failed");
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.lines(), vec!["[bind9] ! checkconf failed".to_string()]);
    }
}
