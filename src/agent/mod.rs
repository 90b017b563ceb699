//! Agent engine abstraction.
//!
//! The [`AgentRuntime`] and [`AgentHandle`] traits decouple the session
//! lifecycle core from the concrete engine implementation (a child
//! process in production, stubs in tests). Teardown and turn execution
//! route through these traits only; nothing in the lifecycle core may
//! assume a particular engine.

pub mod process;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::models::event::EventKind;
use crate::Result;

/// Progress callback invoked by the engine while a turn executes. Called
/// from whatever task runs the turn; implementations must be cheap and
/// must never block.
pub type ProgressSink = Arc<dyn Fn(EventKind, serde_json::Value) + Send + Sync>;

/// Factory for per-session engine handles.
pub trait AgentRuntime: Send + Sync {
    /// Create a live engine handle for `session_id` using the merged
    /// engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`](crate::AppError::Engine) if the engine
    /// cannot be started or refuses the configuration.
    fn create_handle<'a>(
        &'a self,
        session_id: &'a str,
        config: &'a BTreeMap<String, serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn AgentHandle>>> + Send + 'a>>;
}

/// One live engine attached to one session. Exclusively owned by its
/// session record or by the turn that checked it out.
pub trait AgentHandle: Send {
    /// Execute one turn against the engine, forwarding progress callbacks
    /// into `progress` as they arrive. Resolves to the engine's reply.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Turn`](crate::AppError::Turn) if the engine
    /// reports a failure, or [`AppError::Engine`](crate::AppError::Engine)
    /// if the engine connection is lost mid-turn.
    fn execute_turn<'a>(
        &'a mut self,
        input: &'a str,
        progress: ProgressSink,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Workspace directory allocated for this session, if the engine has
    /// materialized one.
    fn workspace_path(&self) -> Option<PathBuf>;

    /// Stop the engine. Consumes the handle so a stop can only happen
    /// once; the handle is discarded whether or not the stop succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Engine`](crate::AppError::Engine) if the engine
    /// did not shut down cleanly. Callers on teardown paths log and
    /// continue.
    fn stop(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}
