//! Session-scoped event fan-out.
//!
//! The broadcaster keeps one [`BroadcastChannel`] per session and hands each
//! streaming client an [`EventStream`] backed by a bounded queue. Broadcasts
//! never wait on a slow client: a full queue drops that subscriber's copy of
//! the frame and the drop is counted. Channels disappear as soon as their
//! last subscriber detaches; a periodic sweep catches any that slip through.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::channel::BroadcastChannel;
use crate::config::BroadcastConfig;
use crate::models::event::{EventKind, SessionEvent};

/// (session id, subscriber id) pairs queued by dropped streams.
type DetachRequest = (String, String);

// ── Statistics ───────────────────────────────────────────────────────────

/// Per-channel view reported by [`EventBroadcaster::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    /// Subscribers currently attached to the channel.
    pub subscriber_count: usize,
    /// When the channel was created.
    pub created_at: DateTime<Utc>,
    /// Last attach, detach, or broadcast on the channel.
    pub last_activity: DateTime<Utc>,
}

/// Broadcaster-wide counters and per-channel detail.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    /// False once [`EventBroadcaster::shutdown`] has run.
    pub running: bool,
    /// Number of live channels.
    pub channel_count: usize,
    /// Total subscribers across all channels.
    pub subscriber_count: usize,
    /// Events accepted for delivery since startup.
    pub messages_sent: u64,
    /// Per-subscriber frames discarded because a queue was full.
    pub messages_dropped: u64,
    /// Streams handed out since startup.
    pub connections_created: u64,
    /// Seconds since the broadcaster was built.
    pub uptime_seconds: u64,
    /// Channel detail keyed by session id.
    pub channels: BTreeMap<String, ChannelStats>,
}

// ── Broadcaster ──────────────────────────────────────────────────────────

/// Fans session events out to streaming subscribers.
pub struct EventBroadcaster {
    channels: Mutex<HashMap<String, BroadcastChannel>>,
    queue_capacity: usize,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
    running: AtomicBool,
    runtime: tokio::runtime::Handle,
    detach_tx: mpsc::UnboundedSender<DetachRequest>,
    detach_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<DetachRequest>>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    connections_created: AtomicU64,
    started: std::time::Instant,
}

impl EventBroadcaster {
    /// Build a live broadcaster. `runtime` is the handle broadcasts from
    /// non-async callers are spawned onto.
    #[must_use]
    pub fn new(config: &BroadcastConfig, runtime: tokio::runtime::Handle) -> Self {
        let (detach_tx, detach_rx) = mpsc::unbounded_channel();
        Self {
            channels: Mutex::new(HashMap::new()),
            queue_capacity: config.queue_capacity,
            heartbeat_interval: config.heartbeat_interval(),
            sweep_interval: config.channel_sweep_interval(),
            running: AtomicBool::new(true),
            runtime,
            detach_tx,
            detach_rx: std::sync::Mutex::new(Some(detach_rx)),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            connections_created: AtomicU64::new(0),
            started: std::time::Instant::now(),
        }
    }

    /// Whether the broadcaster still accepts events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a new subscriber on `session_id` and return its stream.
    ///
    /// The channel is created on first attach. A connection confirmation is
    /// broadcast so the new subscriber sees a frame right away. After
    /// shutdown this returns a stream that ends immediately.
    pub async fn attach(&self, session_id: &str) -> EventStream {
        let subscriber_id = short_id();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        if self.is_running() {
            {
                let mut channels = self.channels.lock().await;
                let channel = channels
                    .entry(session_id.to_owned())
                    .or_insert_with(|| {
                        debug!(session_id, "creating broadcast channel");
                        BroadcastChannel::new()
                    });
                channel.add(subscriber_id.clone(), tx);
            }
            self.connections_created.fetch_add(1, Ordering::Relaxed);
            info!(session_id, subscriber_id, "subscriber attached");

            self.broadcast(
                session_id,
                EventKind::Heartbeat,
                serde_json::json!({
                    "message": "connection established",
                    "subscriber_id": subscriber_id,
                }),
            )
            .await;
        }

        EventStream {
            session_id: session_id.to_owned(),
            subscriber_id,
            rx,
            idle_heartbeat: self.heartbeat_interval,
            detach_tx: self.detach_tx.clone(),
        }
    }

    /// Remove a subscriber, tearing the channel down if it was the last one.
    pub async fn detach(&self, session_id: &str, subscriber_id: &str) {
        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(session_id) else {
            return;
        };
        if channel.remove(subscriber_id) {
            debug!(session_id, subscriber_id, "subscriber detached");
        }
        if channel.is_empty() {
            channels.remove(session_id);
            debug!(session_id, "removing empty broadcast channel");
        }
    }

    /// Broadcast an event to every subscriber of `session_id`.
    ///
    /// Unknown sessions are a silent no-op. Slow subscribers lose the frame
    /// rather than stalling the caller.
    pub async fn broadcast(&self, session_id: &str, kind: EventKind, payload: serde_json::Value) {
        if !self.is_running() {
            debug!(session_id, kind = kind.as_str(), "broadcaster stopped, dropping event");
            return;
        }

        let event = SessionEvent::new(kind, session_id, payload);
        let frame = event.to_sse();

        let dropped = {
            let mut channels = self.channels.lock().await;
            let Some(channel) = channels.get_mut(session_id) else {
                debug!(session_id, kind = kind.as_str(), "no channel for event");
                return;
            };
            let (_, dropped) = channel.broadcast_frame(&frame);
            dropped
        };

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            self.messages_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(
                session_id,
                kind = kind.as_str(),
                dropped,
                "subscriber queues full, frames dropped"
            );
        }
    }

    /// Broadcast from a non-async caller by spawning onto the runtime.
    pub fn broadcast_blocking(
        self: &Arc<Self>,
        session_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) {
        if !self.is_running() {
            return;
        }
        let this = Arc::clone(self);
        let session_id = session_id.to_owned();
        self.runtime.spawn(async move {
            this.broadcast(&session_id, kind, payload).await;
        });
    }

    /// Send a heartbeat to every channel.
    pub async fn heartbeat_all(&self) {
        let session_ids: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        for session_id in session_ids {
            self.broadcast(
                &session_id,
                EventKind::Heartbeat,
                serde_json::json!({"message": "periodic heartbeat"}),
            )
            .await;
        }
    }

    /// Drop channels whose last subscriber left without a detach making it
    /// through. Returns how many were removed.
    pub async fn sweep_empty_channels(&self) -> usize {
        let mut channels = self.channels.lock().await;
        let before = channels.len();
        channels.retain(|_, channel| !channel.is_empty());
        let removed = before - channels.len();
        if removed > 0 {
            debug!(removed, "swept empty broadcast channels");
        }
        removed
    }

    /// Subscribers currently attached to `session_id`.
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(session_id)
            .map_or(0, BroadcastChannel::subscriber_count)
    }

    /// Stop accepting events, notify every subscriber, and drop all
    /// channels. Subsequent calls are no-ops.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut channels = self.channels.lock().await;
        let count = channels.len();
        for (session_id, channel) in channels.iter_mut() {
            let event = SessionEvent::new(
                EventKind::Shutdown,
                session_id,
                serde_json::json!({"message": "server shutting down"}),
            );
            channel.broadcast_frame(&event.to_sse());
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        channels.clear();
        info!(channels = count, "event broadcaster shut down");
    }

    /// Counters and per-channel detail.
    pub async fn stats(&self) -> BroadcastStats {
        let channels = self.channels.lock().await;
        let per_channel: BTreeMap<String, ChannelStats> = channels
            .iter()
            .map(|(session_id, channel)| {
                (
                    session_id.clone(),
                    ChannelStats {
                        subscriber_count: channel.subscriber_count(),
                        created_at: channel.created_at,
                        last_activity: channel.last_activity,
                    },
                )
            })
            .collect();
        let subscriber_count = per_channel.values().map(|c| c.subscriber_count).sum();

        BroadcastStats {
            running: self.is_running(),
            channel_count: per_channel.len(),
            subscriber_count,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
            channels: per_channel,
        }
    }

    fn take_detach_receiver(&self) -> Option<mpsc::UnboundedReceiver<DetachRequest>> {
        self.detach_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("running", &self.is_running())
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

// ── Subscriber stream ────────────────────────────────────────────────────

/// One subscriber's view of a session's event feed.
///
/// Frames arrive preformatted for the wire. When nothing has been queued
/// for a full heartbeat interval the stream synthesizes a heartbeat so the
/// transport can tell an idle feed from a dead one. Dropping the stream
/// queues a detach with the broadcaster.
pub struct EventStream {
    session_id: String,
    subscriber_id: String,
    rx: mpsc::Receiver<String>,
    idle_heartbeat: Duration,
    detach_tx: mpsc::UnboundedSender<DetachRequest>,
}

impl EventStream {
    /// Session this stream is attached to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Identifier assigned to this subscriber at attach time.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Next wire frame, or `None` once the feed is closed.
    pub async fn next_frame(&mut self) -> Option<String> {
        match tokio::time::timeout(self.idle_heartbeat, self.rx.recv()).await {
            Ok(frame) => frame,
            Err(_) => {
                let event = SessionEvent::new(
                    EventKind::Heartbeat,
                    &self.session_id,
                    serde_json::json!({"message": "heartbeat"}),
                );
                Some(event.to_sse())
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let _ = self
            .detach_tx
            .send((self.session_id.clone(), self.subscriber_id.clone()));
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("session_id", &self.session_id)
            .field("subscriber_id", &self.subscriber_id)
            .finish_non_exhaustive()
    }
}

// ── Background timers ────────────────────────────────────────────────────

/// Spawn the broadcaster's periodic work: heartbeats to every channel,
/// empty-channel sweeps, and detach requests queued by dropped streams.
/// Runs until `cancel` fires. Starting the timers twice is refused.
#[must_use]
pub fn spawn_broadcast_timers(
    broadcaster: Arc<EventBroadcaster>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut detach_rx) = broadcaster.take_detach_receiver() else {
            warn!("broadcast timers already started, refusing second instance");
            return;
        };

        let start = tokio::time::Instant::now();
        let mut heartbeat = tokio::time::interval_at(
            start + broadcaster.heartbeat_interval,
            broadcaster.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval_at(
            start + broadcaster.sweep_interval,
            broadcaster.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("broadcast timers shutting down");
                    break;
                }
                request = detach_rx.recv() => {
                    if let Some((session_id, subscriber_id)) = request {
                        broadcaster.detach(&session_id, &subscriber_id).await;
                    }
                }
                _ = heartbeat.tick() => broadcaster.heartbeat_all().await,
                _ = sweep.tick() => {
                    broadcaster.sweep_empty_channels().await;
                }
            }
        }
    })
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
