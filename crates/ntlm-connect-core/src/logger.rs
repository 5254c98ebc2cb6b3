/// Structured logging for tunnel events.

use crate::error::TunnelError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TunnelLog {
    pub timestamp: DateTime<Utc>,
    pub connection_id: String,
    pub source_addr: String,
    pub target: String,
    pub proxy: String,
    /// Handshake state reached, e.g. "authenticated" or "negotiate sent".
    pub state: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duration_ms: u64,
    pub status: String,
    pub error: Option<String>,
}

/// `status` value recorded for a failed tunnel.
pub fn failure_status(error: &TunnelError) -> &'static str {
    if error.is_protocol_violation() {
        "protocol_error"
    } else {
        "failed"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    Listening,
    AcceptFailed,
    ConnectionFailed,
}

impl RelayEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEvent::Listening => "listening",
            RelayEvent::AcceptFailed => "accept_failed",
            RelayEvent::ConnectionFailed => "connection_failed",
        }
    }

    fn is_failure(&self) -> bool {
        !matches!(self, RelayEvent::Listening)
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// JSON-lines sink; an empty path disables the file.
pub struct Logger {
    log_path: String,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl Logger {
    pub fn new(log_path: &str) -> Result<Self> {
        let writer = if !log_path.is_empty() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Logger {
            log_path: log_path.to_string(),
            writer: Mutex::new(writer),
        })
    }

    /// Write a tunnel event as a JSON line to the log file.
    pub fn log_tunnel(&self, log: &TunnelLog) {
        let line = match serde_json::to_string(log) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize TunnelLog: {}", e);
                return;
            }
        };
        self.write_line(&line);
        if log.error.is_some() {
            warn!(
                connection_id = %log.connection_id,
                target = %log.target,
                state = %log.state,
                error = log.error.as_deref().unwrap_or(""),
                "tunnel failed"
            );
        } else {
            info!(
                connection_id = %log.connection_id,
                target = %log.target,
                bytes_sent = log.bytes_sent,
                bytes_received = log.bytes_received,
                duration_ms = log.duration_ms,
                "tunnel closed"
            );
        }
    }

    /// Relay lifecycle line such as "listening" or "accept failed".
    pub fn log_relay_event(&self, event: RelayEvent, detail: &str) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event.as_str(),
            "detail": detail,
        });
        self.write_line(&entry.to_string());
        if event.is_failure() {
            error!(event = event.as_str(), "{}", detail);
        } else {
            info!(event = event.as_str(), "{}", detail);
        }
    }

    fn write_line(&self, line: &str) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(ref mut w) = *guard {
                let _ = writeln!(w, "{}", line);
                let _ = w.flush();
            }
        }
    }

    /// Empty when file logging is off.
    pub fn log_path(&self) -> &str {
        &self.log_path
    }
}
