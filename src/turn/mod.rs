//! Turn execution over checked-out engine handles.
//!
//! A turn takes a session's engine handle out of the registry, runs one
//! request/response exchange against it, and puts it back. Progress events
//! surface through the broadcaster as they arrive. At most one turn runs
//! per session; a bounded permit pool caps turns across all sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentHandle, ProgressSink};
use crate::broadcast::EventBroadcaster;
use crate::config::TurnConfig;
use crate::models::event::EventKind;
use crate::models::session::{MessageRole, StoredMessage};
use crate::session::SessionManager;
use crate::{AppError, Result};

/// Runs conversation turns in background tasks.
pub struct TurnRunner {
    manager: Arc<SessionManager>,
    broadcaster: Arc<EventBroadcaster>,
    timeout: Duration,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TurnRunner {
    /// Build a runner over the session registry and event broadcaster.
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager>,
        broadcaster: Arc<EventBroadcaster>,
        config: &TurnConfig,
    ) -> Self {
        Self {
            manager,
            broadcaster,
            timeout: config.timeout(),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a turn for `session_id` and return once it is scheduled.
    /// The outcome is delivered through the broadcaster, not the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Turn`] when the session already has a turn in
    /// flight.
    pub fn submit(self: &Arc<Self>, session_id: &str, message: String) -> Result<()> {
        let mut flights = self.flights();
        flights.retain(|_, task| !task.is_finished());
        if flights.contains_key(session_id) {
            return Err(AppError::Turn(format!(
                "turn already in progress for {session_id}"
            )));
        }

        let this = Arc::clone(self);
        let id = session_id.to_owned();
        let task = tokio::spawn(async move {
            this.run_turn(&id, message).await;
        });
        flights.insert(session_id.to_owned(), task);
        Ok(())
    }

    /// Abort a session's in-flight turn, if any. The engine process dies
    /// with the aborted task; the next turn starts a fresh one.
    pub fn cancel(&self, session_id: &str) -> bool {
        let task = self.flights().remove(session_id);
        match task {
            Some(task) if !task.is_finished() => {
                task.abort();
                info!(session_id, "in-flight turn aborted");
                true
            }
            _ => false,
        }
    }

    /// Number of turns currently executing.
    #[must_use]
    pub fn active_turns(&self) -> usize {
        self.flights().values().filter(|task| !task.is_finished()).count()
    }

    /// Abort every in-flight turn. Engine processes are reaped by the
    /// session manager's own shutdown.
    pub fn shutdown(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = self.flights().drain().collect();
        let mut aborted = 0;
        for (session_id, task) in tasks {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
                debug!(session_id, "turn aborted at shutdown");
            }
        }
        if aborted > 0 {
            info!(aborted, "in-flight turns aborted");
        }
    }

    async fn run_turn(&self, session_id: &str, message: String) {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return, // pool is never closed
        };

        if self.manager.get_or_create(session_id, None).await.is_none() {
            warn!(session_id, "session vanished before turn start");
            return;
        }
        if !self
            .manager
            .append_message(session_id, StoredMessage::new(MessageRole::User, message.clone()))
        {
            warn!(session_id, "failed to record user message");
        }
        self.broadcaster
            .broadcast(
                session_id,
                EventKind::RoundStart,
                serde_json::json!({"message": message}),
            )
            .await;

        match self.execute(session_id, &message).await {
            Ok(reply) => {
                if !self
                    .manager
                    .append_message(session_id, StoredMessage::new(MessageRole::Assistant, reply.clone()))
                {
                    warn!(session_id, "failed to record assistant reply");
                }
                self.broadcaster
                    .broadcast(
                        session_id,
                        EventKind::ChatCompleted,
                        serde_json::json!({"reply": reply}),
                    )
                    .await;
                self.broadcaster
                    .broadcast(session_id, EventKind::RoundEnd, serde_json::Value::Null)
                    .await;
            }
            Err(err) => {
                warn!(session_id, %err, "turn failed");
                self.broadcaster
                    .broadcast(
                        session_id,
                        EventKind::Error,
                        serde_json::json!({"error": err.to_string()}),
                    )
                    .await;
            }
        }
    }

    async fn execute(&self, session_id: &str, message: &str) -> Result<String> {
        let (mut handle, generation) = self.obtain_handle(session_id).await?;

        let sink: ProgressSink = {
            let broadcaster = Arc::clone(&self.broadcaster);
            let id = session_id.to_owned();
            Arc::new(move |kind, payload| broadcaster.broadcast_blocking(&id, kind, payload))
        };

        let outcome = tokio::time::timeout(self.timeout, handle.execute_turn(message, sink)).await;

        match outcome {
            Ok(Ok(reply)) => {
                self.manager.restore_agent(session_id, handle, generation).await;
                Ok(reply)
            }
            Ok(Err(err @ AppError::Turn(_))) => {
                // The engine reported the failure in-protocol, so the
                // handle's stream is still in sync and safe to reuse.
                self.manager.restore_agent(session_id, handle, generation).await;
                Err(err)
            }
            Ok(Err(err)) => {
                if let Err(stop_err) = handle.stop().await {
                    warn!(session_id, %stop_err, "engine stop failed after turn error");
                }
                Err(err)
            }
            Err(_) => {
                if let Err(stop_err) = handle.stop().await {
                    warn!(session_id, %stop_err, "engine stop failed after timeout");
                }
                Err(AppError::Timeout(format!(
                    "turn exceeded {} seconds",
                    self.timeout.as_secs()
                )))
            }
        }
    }

    /// Check out the session's engine handle, starting one if the session
    /// has none yet.
    async fn obtain_handle(&self, session_id: &str) -> Result<(Box<dyn AgentHandle>, u64)> {
        let Some(checkout) = self.manager.checkout_agent(session_id) else {
            return Err(AppError::NotFound(format!("session {session_id}")));
        };
        if let Some(handle) = checkout.handle {
            debug!(session_id, "reusing live engine handle");
            return Ok((handle, checkout.generation));
        }

        info!(session_id, "starting engine for session");
        let handle = self
            .manager
            .runtime()
            .create_handle(session_id, &checkout.config)
            .await?;
        let _ = self
            .manager
            .record_workspace(session_id, handle.workspace_path());
        Ok((handle, checkout.generation))
    }
}

impl std::fmt::Debug for TurnRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnRunner")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
