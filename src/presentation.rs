// Latest-instruction cell read by the UI, plus a broadcast of every change.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent::watcher::MatchRef;

/// What the UI should show right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderInstruction {
    Idle {
        message: String,
    },
    Error {
        message: String,
    },
    Live {
        battle_tag: String,
        agent: String,
        watch_url: String,
    },
}

impl RenderInstruction {
    pub fn idle(message: impl Into<String>) -> Self {
        Self::Idle {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Instruction for a battle in progress, linking to where it can be watched.
    pub fn live(match_ref: &MatchRef, view_base_url: &str) -> Self {
        Self::Live {
            battle_tag: match_ref.tag().to_string(),
            agent: match_ref.owner().to_string(),
            watch_url: format!("{}#{}", view_base_url.trim_end_matches('#'), match_ref.tag()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::Error { .. } => "error",
            Self::Live { .. } => "live",
        }
    }
}

/// A stored instruction with its revision and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub instruction: RenderInstruction,
    pub revision: u64,
    pub updated_at: String,
}

impl Snapshot {
    fn new(instruction: RenderInstruction, revision: u64) -> Self {
        Self {
            instruction,
            revision,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Single mutable cell holding the latest [`RenderInstruction`]. Last write wins.
///
/// Every render and every refresh request is also broadcast, so WebSocket clients
/// can follow along without polling.
#[derive(Clone)]
pub struct PresentationSink {
    current: Arc<Mutex<Snapshot>>,
    updates: broadcast::Sender<Snapshot>,
}

impl PresentationSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            current: Arc::new(Mutex::new(Snapshot::new(
                RenderInstruction::idle("Starting up..."),
                0,
            ))),
            updates: tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the stored instruction.
    pub fn render(&self, instruction: RenderInstruction) {
        let mut current = self.lock();
        let snapshot = Snapshot::new(instruction, current.revision + 1);
        *current = snapshot.clone();
        // Sent under the lock so subscribers see revisions in order.
        let _ = self.updates.send(snapshot);
    }

    pub fn current_snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    pub fn current_instruction(&self) -> RenderInstruction {
        self.lock().instruction.clone()
    }

    /// Re-broadcast the current snapshot. Fire-and-forget.
    pub fn request_refresh(&self) {
        let current = self.lock();
        let _ = self.updates.send(current.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }
}

impl Default for PresentationSink {
    fn default() -> Self {
        Self::new()
    }
}
