//! Per-session subscriber bookkeeping.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// One session's subscriber set. All mutation happens under the
/// broadcaster's channel-map lock, which serializes membership changes
/// against in-flight broadcasts.
pub(crate) struct BroadcastChannel {
    subscribers: HashMap<String, mpsc::Sender<String>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity: DateTime<Utc>,
}

impl BroadcastChannel {
    pub(crate) fn new() -> Self {
        let now = Utc::now();
        Self {
            subscribers: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub(crate) fn add(&mut self, subscriber_id: String, tx: mpsc::Sender<String>) {
        self.subscribers.insert(subscriber_id, tx);
        self.last_activity = Utc::now();
    }

    /// Remove a subscriber; `true` if it was present.
    pub(crate) fn remove(&mut self, subscriber_id: &str) -> bool {
        let removed = self.subscribers.remove(subscriber_id).is_some();
        if removed {
            self.last_activity = Utc::now();
        }
        removed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Enqueue a frame to every current subscriber without blocking.
    /// A full queue drops the frame for that subscriber; a closed queue
    /// gets pruned. Returns `(delivered, dropped)`.
    pub(crate) fn broadcast_frame(&mut self, frame: &str) -> (usize, usize) {
        let mut delivered = 0;
        let mut dropped = 0;
        let mut closed: Vec<String> = Vec::new();

        for (subscriber_id, tx) in &self.subscribers {
            match tx.try_send(frame.to_owned()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => closed.push(subscriber_id.clone()),
            }
        }
        for subscriber_id in &closed {
            self.subscribers.remove(subscriber_id);
        }

        self.last_activity = Utc::now();
        (delivered, dropped)
    }
}
