//! Session event model and wire encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Kind of a session event, rendered on the wire as its snake_case name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A conversation round has started.
    RoundStart,
    /// A conversation round has finished.
    RoundEnd,
    /// An agent post began processing.
    PostStart,
    /// An agent post finished processing.
    PostEnd,
    /// An agent post failed.
    PostError,
    /// Incremental message content update.
    PostMessageUpdate,
    /// Attachment produced or updated by a post.
    PostAttachmentUpdate,
    /// Post status transition.
    PostStatusUpdate,
    /// Post routing target changed.
    PostSendToUpdate,
    /// The engine wrote a downloadable file.
    FileGenerated,
    /// Liveness signal.
    Heartbeat,
    /// Service-level error notification.
    Error,
    /// Session was created.
    SessionCreated,
    /// A chat turn completed.
    ChatCompleted,
    /// The service is shutting down.
    Shutdown,
}

impl EventKind {
    /// Parse a wire name back into a kind. Unknown names yield `None`.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "round_start" => Some(Self::RoundStart),
            "round_end" => Some(Self::RoundEnd),
            "post_start" => Some(Self::PostStart),
            "post_end" => Some(Self::PostEnd),
            "post_error" => Some(Self::PostError),
            "post_message_update" => Some(Self::PostMessageUpdate),
            "post_attachment_update" => Some(Self::PostAttachmentUpdate),
            "post_status_update" => Some(Self::PostStatusUpdate),
            "post_send_to_update" => Some(Self::PostSendToUpdate),
            "file_generated" => Some(Self::FileGenerated),
            "heartbeat" => Some(Self::Heartbeat),
            "error" => Some(Self::Error),
            "session_created" => Some(Self::SessionCreated),
            "chat_completed" => Some(Self::ChatCompleted),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Wire name used for the SSE `event:` field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundStart => "round_start",
            Self::RoundEnd => "round_end",
            Self::PostStart => "post_start",
            Self::PostEnd => "post_end",
            Self::PostError => "post_error",
            Self::PostMessageUpdate => "post_message_update",
            Self::PostAttachmentUpdate => "post_attachment_update",
            Self::PostStatusUpdate => "post_status_update",
            Self::PostSendToUpdate => "post_send_to_update",
            Self::FileGenerated => "file_generated",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::SessionCreated => "session_created",
            Self::ChatCompleted => "chat_completed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One immutable event addressed to a session's subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionEvent {
    /// Unique, time-ordered identifier.
    pub id: String,
    /// Event kind.
    pub kind: EventKind,
    /// Session the event belongs to.
    pub session_id: String,
    /// Construction time.
    pub timestamp: DateTime<Utc>,
    /// Event-specific fields merged into the wire payload.
    pub payload: serde_json::Value,
}

impl SessionEvent {
    /// Construct an event stamped now with a fresh identifier.
    #[must_use]
    pub fn new(kind: EventKind, session_id: impl Into<String>, payload: serde_json::Value) -> Self {
        let timestamp = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("evt_{}_{}", timestamp.timestamp_micros(), &suffix[..8]),
            kind,
            session_id: session_id.into(),
            timestamp,
            payload,
        }
    }

    /// Wire JSON body: `session_id` and ISO-8601 `timestamp` merged with the
    /// payload fields. Payload keys win on collision; a non-object payload is
    /// nested under a `data` key.
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert(
            "session_id".into(),
            serde_json::Value::String(self.session_id.clone()),
        );
        body.insert(
            "timestamp".into(),
            serde_json::Value::String(self.timestamp.to_rfc3339()),
        );
        match &self.payload {
            serde_json::Value::Object(fields) => {
                for (key, value) in fields {
                    body.insert(key.clone(), value.clone());
                }
            }
            serde_json::Value::Null => {}
            other => {
                body.insert("data".into(), other.clone());
            }
        }
        serde_json::Value::Object(body)
    }

    /// Encode the event as one SSE frame: `id:` and `event:` lines, one
    /// `data:` line per line of JSON, terminated by a blank line.
    ///
    /// Encoding failure never propagates; a minimal substitute error frame
    /// is returned instead so the stream keeps flowing.
    #[must_use]
    pub fn to_sse(&self) -> String {
        let (event_name, data) = match serde_json::to_string(&self.body()) {
            Ok(json) => (self.kind.as_str(), json),
            Err(err) => {
                warn!(event_id = %self.id, %err, "event encoding failed, substituting error frame");
                let fallback = serde_json::json!({
                    "session_id": self.session_id,
                    "timestamp": self.timestamp.to_rfc3339(),
                    "error": "event encoding failed",
                });
                ("error", fallback.to_string())
            }
        };

        let mut frame = String::with_capacity(data.len() + 64);
        frame.push_str("id: ");
        frame.push_str(&self.id);
        frame.push_str("\nevent: ");
        frame.push_str(event_name);
        frame.push('\n');
        for line in data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}
