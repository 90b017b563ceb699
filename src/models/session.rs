//! Session record model and lifecycle helpers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentHandle;

/// Configuration keys reserved for session metadata. They are extracted at
/// create time and never forwarded into the agent engine configuration.
pub const META_KEYS: [&str; 4] = ["client_ip", "user_agent", "is_admin_session", "created_by"];

/// Lifecycle status for a managed session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session registered and serving requests.
    Active,
    /// Teardown in progress; the record is no longer selectable.
    Evicting,
    /// Teardown complete; the record has left the table.
    Closed,
}

impl SessionStatus {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Evicting) | (Self::Evicting, Self::Closed)
        )
    }
}

/// Caller-provided metadata captured at session creation, kept apart from
/// the engine configuration map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionMeta {
    /// Origin IP of the creating client.
    pub client_ip: Option<String>,
    /// User agent string of the creating client.
    pub user_agent: Option<String>,
    /// Whether the session was created through the admin surface.
    pub is_admin_session: bool,
    /// Identity of the creator, when supplied.
    pub created_by: Option<String>,
}

impl SessionMeta {
    /// Extract reserved metadata keys out of a configuration override map,
    /// leaving only genuine engine configuration behind.
    #[must_use]
    pub fn extract(config: &mut BTreeMap<String, serde_json::Value>) -> Self {
        let as_string = |value: serde_json::Value| match value {
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };
        Self {
            client_ip: config.remove("client_ip").and_then(as_string),
            user_agent: config.remove("user_agent").and_then(as_string),
            is_admin_session: config
                .remove("is_admin_session")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            created_by: config.remove("created_by").and_then(as_string),
        }
    }
}

/// Role of a transcript entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Message submitted by the end user.
    User,
    /// Reply produced by the agent engine.
    Assistant,
}

/// A single entry in a session's transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StoredMessage {
    /// Who authored the entry.
    pub role: MessageRole,
    /// Message body.
    pub content: String,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    /// Construct a transcript entry timestamped now.
    #[must_use]
    pub fn new(role: MessageRole, content: String) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Live state for one managed session. Owned exclusively by the session
/// table; callers only ever see [`SessionSnapshot`] copies.
pub struct SessionRecord {
    /// Unique session identifier.
    pub id: String,
    /// Conversation identifier reported to clients.
    pub conversation_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Metadata captured at creation.
    pub meta: SessionMeta,
    /// Engine configuration: defaults template merged with overrides.
    pub config: BTreeMap<String, serde_json::Value>,
    /// Bumped on every config update; a checked-out handle from an older
    /// generation is stopped instead of restored.
    pub config_generation: u64,
    /// Live engine handle, absent until first use. Stopped exactly once.
    pub agent: Option<Box<dyn AgentHandle>>,
    /// On-disk workspace, recorded once the engine allocates it. Deleted
    /// exactly once at teardown.
    pub workspace_path: Option<PathBuf>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last touch via any manager operation; never decreases.
    pub last_activity: DateTime<Utc>,
    /// Last explicit client heartbeat; never decreases.
    pub last_heartbeat: DateTime<Utc>,
    /// Number of teardown attempts made against this record.
    pub cleanup_attempts: u32,
    /// Engine-reported resource count, zeroed at teardown.
    pub resource_count: u32,
    /// Per-session transcript.
    pub messages: Vec<StoredMessage>,
}

impl SessionRecord {
    /// Construct a fresh active record.
    #[must_use]
    pub fn new(
        id: String,
        meta: SessionMeta,
        config: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Active,
            meta,
            config,
            config_generation: 0,
            agent: None,
            workspace_path: None,
            created_at: now,
            last_activity: now,
            last_heartbeat: now,
            cleanup_attempts: 0,
            resource_count: 0,
            messages: Vec::new(),
        }
    }

    /// Refresh `last_activity`. Timestamps never move backwards even if the
    /// wall clock does.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Refresh `last_heartbeat` together with `last_activity`.
    pub fn heartbeat(&mut self) {
        let now = Utc::now();
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Whether `last_activity` is older than `timeout` as of `now`.
    #[must_use]
    pub fn is_inactive(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_activity > to_chrono(timeout)
    }

    /// Whether `last_heartbeat` is older than `threshold` as of `now`.
    #[must_use]
    pub fn heartbeat_lost(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > to_chrono(threshold)
    }

    /// Whether the record has outlived the absolute age ceiling as of `now`.
    #[must_use]
    pub fn exceeds_age(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at > to_chrono(max_age)
    }

    /// Defensive copy handed to callers.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            status: self.status,
            meta: self.meta.clone(),
            config: self.config.clone(),
            has_agent: self.agent.is_some(),
            workspace_path: self.workspace_path.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            last_heartbeat: self.last_heartbeat,
            cleanup_attempts: self.cleanup_attempts,
            resource_count: self.resource_count,
            message_count: self.messages.len(),
        }
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("conversation_id", &self.conversation_id)
            .field("status", &self.status)
            .field("has_agent", &self.agent.is_some())
            .field("workspace_path", &self.workspace_path)
            .field("last_activity", &self.last_activity)
            .field("last_heartbeat", &self.last_heartbeat)
            .field("cleanup_attempts", &self.cleanup_attempts)
            .finish_non_exhaustive()
    }
}

/// Read-only copy of a session record, safe to hold outside the table lock.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionSnapshot {
    /// Unique session identifier.
    pub id: String,
    /// Conversation identifier reported to clients.
    pub conversation_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Metadata captured at creation.
    pub meta: SessionMeta,
    /// Engine configuration at snapshot time.
    pub config: BTreeMap<String, serde_json::Value>,
    /// Whether a live engine handle existed at snapshot time.
    pub has_agent: bool,
    /// Recorded workspace path, if any.
    pub workspace_path: Option<PathBuf>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last touch via any manager operation.
    pub last_activity: DateTime<Utc>,
    /// Last explicit client heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Number of teardown attempts made against this record.
    pub cleanup_attempts: u32,
    /// Engine-reported resource count.
    pub resource_count: u32,
    /// Transcript length at snapshot time.
    pub message_count: usize,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
