use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

/// Something a run wants its viewers to know. Rendered to a single text line
/// prefixed with the run label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started { label: String, at: String },
    Info { label: String, msg: String },
    Warning { label: String, msg: String },
    StageStarted { label: String, stage: String },
    Output { label: String, stage: String, line: String },
    StageFinished { label: String, stage: String, code: Option<i32> },
    StageFailed { label: String, stage: String, error: String },
    Telemetry { label: String, msg: String },
    Finished { label: String, at: String },
    Failed { label: String, error: String },
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::Started { label, at } => write!(f, "[{label}] 🚀 Benchmark started at {at}"),
            RunEvent::Info { label, msg } => write!(f, "[{label}] {msg}"),
            RunEvent::Warning { label, msg } => write!(f, "[{label}] ⚠️ {msg}"),
            RunEvent::StageStarted { label, stage } => write!(f, "[{label}] 🔄 Running {stage}..."),
            RunEvent::Output { label, stage, line } => write!(f, "[{label}] {stage}: {line}"),
            RunEvent::StageFinished { label, stage, code: Some(0) } => write!(f, "[{label}] ✅ {stage} completed"),
            RunEvent::StageFinished { label, stage, code: Some(c) } => {
                write!(f, "[{label}] ⚠️ {stage} completed with exit code {c}")
            }
            RunEvent::StageFinished { label, stage, code: None } => {
                write!(f, "[{label}] ⚠️ {stage} terminated by signal")
            }
            RunEvent::StageFailed { label, stage, error } => write!(f, "[{label}] ❌ {stage} failed: {error}"),
            RunEvent::Telemetry { label, msg } => write!(f, "[{label}] {msg}"),
            RunEvent::Finished { label, at } => write!(f, "[{label}] ✅ Benchmark finished at {at}"),
            RunEvent::Failed { label, error } => write!(f, "[{label}] ❌ {error}"),
        }
    }
}

pub type ViewerId = Uuid;

/// Fan-out of text lines to connected viewers.
///
/// Each viewer owns a bounded queue. Publishing never waits: a viewer whose
/// queue is full or whose receiver is gone is dropped on the spot.
pub struct Broadcaster {
    viewers: Mutex<HashMap<ViewerId, mpsc::Sender<String>>>,
    queue: usize,
}

impl Broadcaster {
    pub fn new(queue: usize) -> Self {
        Self { viewers: Mutex::new(HashMap::new()), queue: queue.max(1) }
    }

    pub fn register(&self) -> (ViewerId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue);
        let id = Uuid::new_v4();
        let total = {
            let mut viewers = self.viewers.lock();
            viewers.insert(id, tx);
            viewers.len()
        };
        debug!(viewer = %id, total, "viewer registered");
        (id, rx)
    }

    pub fn deregister(&self, id: ViewerId) {
        if self.viewers.lock().remove(&id).is_some() {
            debug!(viewer = %id, "viewer deregistered");
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Delivers `text` to every viewer registered at the time of the call and
    /// returns how many accepted it.
    pub fn publish(&self, text: impl Into<String>) -> usize {
        let text = text.into();
        let snapshot: Vec<(ViewerId, mpsc::Sender<String>)> =
            self.viewers.lock().iter().map(|(id, tx)| (*id, tx.clone())).collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => failed.push(id),
            }
        }

        if !failed.is_empty() {
            let mut viewers = self.viewers.lock();
            for id in failed {
                viewers.remove(&id);
                debug!(viewer = %id, "🧹 removed viewer after failed delivery");
            }
        }
        delivered
    }

    pub fn emit(&self, event: &RunEvent) -> usize {
        self.publish(event.to_string())
    }
}
