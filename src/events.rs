//! Outward event stream consumed by the UI layer and other collaborators.
//!
//! Events are broadcast; a bus with no subscribers drops them silently.
//! Status messages are human-readable logging, never control flow.

use serde::Serialize;
use tokio::sync::broadcast;

/// Coarse browsing activity reported to listeners. `NavigatingHome` and
/// `LikePause` both surface as `Browsing`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BrowseActivity {
    Browsing,
    Resting,
    Idle,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "event", content = "payload")]
pub enum AppEvent {
    CollectingStateChanged(bool),
    NewLikeCollected { name: String, timestamp: String },
    NewReplyCollected { name: String, timestamp: String },
    SelfRecordsCleaned(usize),
    BrowsingStateChanged(BrowseActivity),
    SessionCountdown(i64),
    LikedUser { handle: String, action_id: String },
    ReciprocateFailed { handle: String, reason: String },
    BatchFinished,
    StatusMessage(String),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(AppEvent::StatusMessage(message.into()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
