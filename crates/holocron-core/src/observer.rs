//! Session event sinks: tracing, an append-only transcript file, and an
//! in-memory recorder.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::reasoning_loop::{LoopOutcome, LoopState};

/// Tool output is cut to this many characters for display.
pub const DISPLAY_LIMIT: usize = 200;

/// First `max_chars` characters of `text`, with `...` appended when cut.
pub fn truncate_for_display(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
        question: String,
    },
    Transition {
        from: LoopState,
        to: LoopState,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        /// Truncated to [`DISPLAY_LIMIT`] characters.
        preview: String,
        is_error: bool,
    },
    SessionEnded {
        session_id: String,
        outcome: Option<LoopOutcome>,
        model_calls: usize,
    },
}

impl SessionEvent {
    pub fn tool_result(call_id: &str, name: &str, content: &str, is_error: bool) -> Self {
        Self::ToolResult {
            call_id: call_id.to_string(),
            name: name.to_string(),
            preview: truncate_for_display(content, DISPLAY_LIMIT),
            is_error,
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionStarted {
                session_id,
                question,
            } => write!(f, "NEW SESSION {session_id} USER INPUT: {question}"),
            Self::Transition { from, to } => write!(f, ">>> TRANSITION: {from} -> {to}"),
            Self::Reasoning { text } => write!(f, "[REASONING]: {text}"),
            Self::ToolCall {
                name, arguments, ..
            } => write!(f, "[ACTION]: Calling Tool '{name}' with args: {arguments}"),
            Self::ToolResult {
                preview, is_error, ..
            } => {
                if *is_error {
                    write!(f, "[TOOL ERROR]: {preview}")
                } else {
                    write!(f, "[TOOL RESULT]: {preview}")
                }
            }
            Self::SessionEnded {
                session_id,
                outcome,
                model_calls,
            } => {
                let outcome = outcome.map_or("failed", |o| o.as_str());
                write!(
                    f,
                    "SESSION ENDED {session_id} ({outcome}, {model_calls} model calls)"
                )
            }
        }
    }
}

/// Receives every event of a reasoning session, in order.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Emits events on the `holocron::session` target.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ToolResult { is_error: true, .. } => {
                tracing::warn!(target: "holocron::session", "{event}")
            }
            SessionEvent::SessionEnded { outcome: None, .. } => {
                tracing::warn!(target: "holocron::session", "{event}")
            }
            _ => tracing::info!(target: "holocron::session", "{event}"),
        }
    }
}

/// Timestamped, append-only text log with one line per event.
pub struct TranscriptLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TranscriptLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open transcript log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionObserver for TranscriptLog {
    fn on_event(&self, event: &SessionEvent) {
        let line = format!(
            "{} - {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            event.to_string().replace('\n', " ")
        );
        let Ok(mut file) = self.file.lock() else {
            tracing::warn!("transcript log lock poisoned");
            return;
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::warn!("failed to write transcript {}: {e}", self.path.display());
        }
    }
}

/// Keeps events in memory.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_event(&self, event: &SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
