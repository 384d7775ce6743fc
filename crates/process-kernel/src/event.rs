//! Process lifecycle states, records and events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a kernel process
///
/// Transitions are monotonic: NEW → RUNNING → STOPPING → STOPPED. A process
/// that never spawned moves from NEW straight to STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Created, OS process does not exist yet
    New,
    /// OS process spawned
    Running,
    /// Stop requested, waiting for the OS process to exit
    Stopping,
    /// OS process exited and all readers drained
    Stopped,
}

impl ProcessState {
    /// Returns true once the process can no longer emit events
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::New => "NEW",
            ProcessState::Running => "RUNNING",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Kernel-assigned process id
    pub id: u32,
    /// Service id the process was created for (0 if none)
    pub sid: u32,
    /// Service name, for display
    pub name: String,
    /// Canonical executable path
    pub path: PathBuf,
    /// OS process id once spawned
    pub pid: Option<u32>,
    /// Lifecycle state
    pub state: ProcessState,
    /// When the OS process was spawned
    pub started_at: Option<DateTime<Utc>>,
    /// When the process reached STOPPED
    pub stopped_at: Option<DateTime<Utc>>,
    /// Exit code, once stopped and only if the process exited normally
    pub exit_code: Option<i32>,
    /// Terminating signal, once stopped and only if a signal ended it
    pub signal: Option<i32>,
    /// Start or wait error carried by the terminal event
    pub error: Option<String>,
}

/// Kind of process event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEventType {
    /// OS process spawned
    Started {
        /// OS process id
        pid: u32,
    },
    /// Chunk read from standard output
    Stdout,
    /// Chunk read from standard error
    Stderr,
    /// Terminal event, always the last one for a process
    Stopped,
}

/// An event emitted by a kernel process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The type of event
    pub event_type: ProcessEventType,
    /// Snapshot of the process when the event was produced
    pub record: ProcessRecord,
    /// Raw output chunk for STDOUT/STDERR events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Vec<u8>>,
    /// Wait or start error for the terminal event; `None` on a clean exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessEvent {
    /// Create a new process event
    pub fn new(event_type: ProcessEventType, record: ProcessRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            record,
            buffer: None,
            error: None,
        }
    }

    /// Create an output event carrying a chunk
    pub fn output(source: LogSource, record: ProcessRecord, chunk: Vec<u8>) -> Self {
        let event_type = match source {
            LogSource::Stdout => ProcessEventType::Stdout,
            LogSource::Stderr => ProcessEventType::Stderr,
        };
        Self {
            buffer: Some(chunk),
            ..Self::new(event_type, record)
        }
    }

    /// Create the terminal event
    pub fn stopped(record: ProcessRecord, error: Option<String>) -> Self {
        Self {
            error,
            ..Self::new(ProcessEventType::Stopped, record)
        }
    }

    /// Id of the process that produced the event
    pub fn id(&self) -> u32 {
        self.record.id
    }

    /// Returns true for the terminal event
    pub fn is_terminal(&self) -> bool {
        self.event_type == ProcessEventType::Stopped
    }

    /// Output chunk decoded lossily as UTF-8
    pub fn text(&self) -> Option<String> {
        self.buffer
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Source of an output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Subscription filter for the kernel event stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Process id to follow; 0 follows every process
    pub id: u32,
}

impl EventFilter {
    /// Follow every process
    pub fn all() -> Self {
        Self { id: 0 }
    }

    /// Follow a single process
    pub fn process(id: u32) -> Self {
        Self { id }
    }

    /// Returns true if the event should be delivered
    ///
    /// Events attributed to id 0 are never delivered.
    pub fn matches(&self, event: &ProcessEvent) -> bool {
        event.id() != 0 && (self.id == 0 || self.id == event.id())
    }
}
