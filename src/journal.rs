//! Append-only observability sinks: the human-readable failure logs and the
//! per-run JSONL event log. Nothing here is ever read back by the harvester.

use crate::Result;
use chrono::{DateTime, Local};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// `[YYYY-MM-DD HH:MM:SS] message` lines. Write errors go to stderr only.
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) {
        let line = format_failure_line(message, Local::now());
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = append_line(&self.path, &line) {
            eprintln!(
                "!!! cannot write failure log {}: {err}",
                self.path.to_string_lossy()
            );
        }
    }
}

pub fn format_failure_line(message: &str, at: DateTime<Local>) -> String {
    let flattened = message.replace(['\r', '\n'], " ");
    format!("[{}] {flattened}", at.format("%Y-%m-%d %H:%M:%S"))
}

/// JSONL events for one harvest run: `{ts_ms, run_id, profile, level, event, data}`.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    run_id: String,
    profile_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: PathBuf, run_id: &str, profile_id: &str) -> Self {
        Self {
            path,
            run_id: run_id.to_string(),
            profile_id: profile_id.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_line(&self, level: &str, event: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "run_id": self.run_id,
            "profile": self.profile_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        append_line(&self.path, &line)?;
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
