//! Events broadcast from the engine to UI observers (notices, objection modal, teleprompter).

use crate::codec::{Coaching, Objection};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    /// Session-ending; the user must restart.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    Notice { level: NoticeLevel, message: String },
    ObjectionRaised(Objection),
    Coaching(Coaching),
    Teleprompter(String),
    /// Streamed model output so far, before decoding.
    OutputPreview(String),
    TurnCompleted { turn: u32 },
    SessionStopped { record_id: Option<String> },
}

/// Fan-out of engine events. Sending with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!(target: "courtcraft::events", "no event subscribers");
        }
    }

    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(EngineEvent::Notice {
            level,
            message: message.into(),
        });
    }
}
