//! Session lifecycle manager.
//!
//! Capacity-bounded registry of session records with LRU ordering and
//! cascading teardown. The table mutex is held for in-memory bookkeeping
//! only; engine stops and workspace deletion always run after the record
//! has left the table, so one slow teardown cannot stall lookups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentHandle, AgentRuntime};
use crate::config::GlobalConfig;
use crate::models::session::{SessionMeta, SessionRecord, SessionSnapshot, SessionStatus, StoredMessage};
use crate::session::memory::{MemoryReading, MemorySource};
use crate::session::workspace;
use crate::AppError;

/// Records freed by the pressure tier below which it escalates to a
/// fixed LRU batch of the same size.
const PRESSURE_MIN_FREED: usize = 3;

/// Cumulative eviction counters exposed through [`ManagerStats`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CleanupStats {
    /// Sessions created over the manager's lifetime.
    pub total_created: u64,
    /// Sessions reclaimed by any cleanup policy (not explicit deletes).
    pub total_cleaned: u64,
    /// Sweeps that ran in the memory-pressure tier.
    pub memory_cleanups: u64,
    /// Sweeps that ran in the forced-eviction tier.
    pub force_cleanups: u64,
    /// Teardown steps that failed and were skipped over.
    pub teardown_failures: u64,
}

/// Read-only manager snapshot, safe to call from any task.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ManagerStats {
    /// Records currently in the table.
    pub total_sessions: usize,
    /// Records currently in `active` status.
    pub active_sessions: usize,
    /// Configured capacity.
    pub max_sessions: usize,
    /// Configured sweep interval.
    pub cleanup_interval_minutes: u64,
    /// Fresh memory reading.
    pub memory_usage: MemoryReading,
    /// Cumulative eviction counters.
    pub cleanup_stats: CleanupStats,
}

/// Outcome of a manually triggered forced cleanup.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CleanupReport {
    /// Memory reading before eviction.
    pub before_memory: MemoryReading,
    /// Memory reading after eviction.
    pub after_memory: MemoryReading,
    /// Sessions reclaimed by this invocation.
    pub sessions_cleaned: usize,
}

/// Which policy tier a sweep pass ran in.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepTier {
    /// Usage at or above the force threshold; LRU-evicted to a third.
    Force,
    /// Usage at or above the pressure threshold; shortened timeout.
    Pressure,
    /// Normal inactivity cleanup.
    Normal,
}

/// Outcome of one background sweep pass.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SweepSummary {
    /// Tier the pass ran in.
    pub tier: SweepTier,
    /// Sessions reclaimed by the tier policy.
    pub cleaned: usize,
    /// Sessions reclaimed by the absolute max-age sweep.
    pub overage_cleaned: usize,
    /// Orphaned workspace directories removed.
    pub orphans_removed: usize,
    /// Memory reading that selected the tier.
    pub memory_before: MemoryReading,
    /// Memory reading after the pass.
    pub memory_after: MemoryReading,
}

#[derive(Default)]
struct Counters {
    total_created: AtomicU64,
    total_cleaned: AtomicU64,
    memory_cleanups: AtomicU64,
    force_cleanups: AtomicU64,
    teardown_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CleanupStats {
        CleanupStats {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_cleaned: self.total_cleaned.load(Ordering::Relaxed),
            memory_cleanups: self.memory_cleanups.load(Ordering::Relaxed),
            force_cleanups: self.force_cleanups.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
        }
    }
}

/// Record table plus LRU order. Front of `order` is least recently used;
/// `order` always contains exactly the keys of `records`.
struct SessionTable {
    records: HashMap<String, SessionRecord>,
    order: Vec<String>,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn touch_lru(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|entry| entry == id) {
            let entry = self.order.remove(pos);
            self.order.push(entry);
        }
    }

    fn insert(&mut self, record: SessionRecord) {
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &str) -> Option<SessionRecord> {
        let record = self.records.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(record)
    }

    /// Move the `count` least-recently-used records out of the table.
    fn pop_lru(&mut self, count: usize) -> Vec<SessionRecord> {
        let victims: Vec<String> = self.order.iter().take(count).cloned().collect();
        victims
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    fn drain_all(&mut self) -> Vec<SessionRecord> {
        self.order.clear();
        self.records.drain().map(|(_, record)| record).collect()
    }
}

/// Engine handle and configuration taken out of a record for one turn.
/// The handle slot stays empty until [`SessionManager::restore_agent`]
/// puts it back or teardown reclaims the session.
pub(crate) struct AgentCheckout {
    pub(crate) handle: Option<Box<dyn AgentHandle>>,
    pub(crate) generation: u64,
    pub(crate) config: BTreeMap<String, Value>,
}

/// Concurrency-safe session registry with multi-tier eviction.
pub struct SessionManager {
    config: Arc<GlobalConfig>,
    runtime: Arc<dyn AgentRuntime>,
    memory: Arc<dyn MemorySource>,
    table: Mutex<SessionTable>,
    counters: Counters,
    sweeping: AtomicBool,
}

impl SessionManager {
    /// Build a manager over the given engine runtime and memory source.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        runtime: Arc<dyn AgentRuntime>,
        memory: Arc<dyn MemorySource>,
    ) -> Self {
        Self {
            config,
            runtime,
            memory,
            table: Mutex::new(SessionTable::new()),
            counters: Counters::default(),
            sweeping: AtomicBool::new(false),
        }
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine runtime this manager creates handles with.
    #[must_use]
    pub fn runtime(&self) -> Arc<dyn AgentRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Create a session, or touch it if `id` already exists. Enforces
    /// capacity first by evicting the least-recently-used records, then
    /// merges `overrides` over a copy of the default template. Reserved
    /// metadata keys are extracted into dedicated fields, never forwarded
    /// to the engine. Returns the session id.
    pub async fn create(
        &self,
        id: Option<String>,
        overrides: Option<BTreeMap<String, Value>>,
    ) -> String {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let victims = {
            let mut table = self.table();
            if table.records.contains_key(&id) {
                debug!(session_id = id, "create on existing session, touching");
                if let Some(record) = table.records.get_mut(&id) {
                    record.touch();
                }
                table.touch_lru(&id);
                Vec::new()
            } else {
                let max = self.config.lifecycle.max_sessions;
                let victims = if table.len() >= max {
                    let excess = table.len() - max + 1;
                    table.pop_lru(excess)
                } else {
                    Vec::new()
                };

                let mut config = self.config.session_defaults.clone();
                let mut overrides = overrides.unwrap_or_default();
                let meta = SessionMeta::extract(&mut overrides);
                config.extend(overrides);

                let record = SessionRecord::new(id.clone(), meta, config);
                info!(
                    session_id = id,
                    conversation_id = record.conversation_id,
                    "session created"
                );
                table.insert(record);
                self.counters.total_created.fetch_add(1, Ordering::Relaxed);
                victims
            }
        };

        let evicted = victims.len() as u64;
        for victim in victims {
            info!(session_id = victim.id, "capacity eviction");
            self.teardown_record(victim, "capacity").await;
        }
        self.counters
            .total_cleaned
            .fetch_add(evicted, Ordering::Relaxed);

        id
    }

    /// Fetch a defensive copy of a session, touching its LRU position and
    /// `last_activity`. `None` when absent, never an error.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        let mut table = self.table();
        let record = table.records.get_mut(id)?;
        record.touch();
        let snapshot = record.snapshot();
        table.touch_lru(id);
        Some(snapshot)
    }

    /// Fetch a session, creating it first when absent. `None` only in the
    /// pathological case where the fresh record was evicted before the
    /// snapshot could be taken.
    pub async fn get_or_create(
        &self,
        id: &str,
        overrides: Option<BTreeMap<String, Value>>,
    ) -> Option<SessionSnapshot> {
        if let Some(snapshot) = self.get(id) {
            return Some(snapshot);
        }
        let created = self.create(Some(id.to_owned()), overrides).await;
        self.get(&created)
    }

    /// Merge a patch into the stored engine configuration. Any live
    /// engine handle is stopped so the next turn lazily recreates it with
    /// the new configuration. Returns `false` on unknown id.
    pub async fn update_config(&self, id: &str, patch: BTreeMap<String, Value>) -> bool {
        let stale = {
            let mut table = self.table();
            let Some(record) = table.records.get_mut(id) else {
                return false;
            };
            record.config.extend(patch);
            record.config_generation += 1;
            record.touch();
            let stale = record.agent.take();
            table.touch_lru(id);
            stale
        };

        if let Some(handle) = stale {
            info!(session_id = id, "config updated, stopping live engine for rebuild");
            if let Err(err) = handle.stop().await {
                warn!(session_id = id, %err, "engine stop failed after config update");
                self.counters
                    .teardown_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        } else {
            info!(session_id = id, "config updated, engine rebuilds on next use");
        }
        true
    }

    /// Refresh `last_heartbeat` and `last_activity`. Returns `false` on
    /// unknown id.
    #[must_use]
    pub fn heartbeat(&self, id: &str) -> bool {
        let mut table = self.table();
        let Some(record) = table.records.get_mut(id) else {
            return false;
        };
        record.heartbeat();
        table.touch_lru(id);
        debug!(session_id = id, "heartbeat updated");
        true
    }

    /// Tear down and remove a session. Idempotent: returns `false` only
    /// when the id is not present.
    pub async fn delete(&self, id: &str) -> bool {
        let record = {
            let mut table = self.table();
            table.remove(id)
        };
        let Some(record) = record else {
            warn!(session_id = id, "delete on unknown session");
            return false;
        };
        self.teardown_record(record, "deleted").await;
        true
    }

    /// Remove sessions whose `last_activity` exceeds `timeout` or whose
    /// `last_heartbeat` exceeds the configured heartbeat-loss threshold.
    /// Returns how many were reclaimed.
    pub async fn cleanup_inactive(&self, timeout: Duration) -> usize {
        let heartbeat_loss = self.config.lifecycle.heartbeat_loss();
        let now = Utc::now();

        let victims = {
            let mut table = self.table();
            let matched: Vec<String> = table
                .records
                .values()
                .filter(|record| {
                    record.is_inactive(timeout, now) || record.heartbeat_lost(heartbeat_loss, now)
                })
                .map(|record| record.id.clone())
                .collect();
            matched
                .iter()
                .filter_map(|id| table.remove(id))
                .collect::<Vec<_>>()
        };

        let cleaned = victims.len();
        for victim in victims {
            let inactive = victim.is_inactive(timeout, now);
            info!(
                session_id = victim.id,
                inactive,
                heartbeat_lost = !inactive,
                "inactivity eviction"
            );
            self.teardown_record(victim, "inactive").await;
        }
        self.counters
            .total_cleaned
            .fetch_add(cleaned as u64, Ordering::Relaxed);
        cleaned
    }

    /// Counts, memory metrics, and cumulative eviction counters.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let (total, active) = {
            let table = self.table();
            let active = table
                .records
                .values()
                .filter(|record| record.status == SessionStatus::Active)
                .count();
            (table.len(), active)
        };
        ManagerStats {
            total_sessions: total,
            active_sessions: active,
            max_sessions: self.config.lifecycle.max_sessions,
            cleanup_interval_minutes: self.config.lifecycle.cleanup_interval_minutes,
            memory_usage: self.memory.sample(),
            cleanup_stats: self.counters.snapshot(),
        }
    }

    /// Session ids in LRU order, least recently used first.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.table().order.clone()
    }

    /// Number of records currently in the table.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.table().len()
    }

    /// Session ids created from `client_ip`, optionally restricted to
    /// records still in `active` status.
    #[must_use]
    pub fn sessions_for_ip(&self, client_ip: &str, only_active: bool) -> Vec<String> {
        if client_ip.is_empty() {
            return Vec::new();
        }
        let table = self.table();
        table
            .order
            .iter()
            .filter(|id| {
                table.records.get(*id).is_some_and(|record| {
                    record.meta.client_ip.as_deref() == Some(client_ip)
                        && (!only_active || record.status == SessionStatus::Active)
                })
            })
            .cloned()
            .collect()
    }

    /// Append a transcript entry, refreshing activity. Returns `false` on
    /// unknown id.
    #[must_use]
    pub fn append_message(&self, id: &str, message: StoredMessage) -> bool {
        let mut table = self.table();
        let Some(record) = table.records.get_mut(id) else {
            return false;
        };
        record.messages.push(message);
        record.touch();
        table.touch_lru(id);
        true
    }

    /// Copy of a session's transcript; `None` on unknown id.
    #[must_use]
    pub fn history(&self, id: &str) -> Option<Vec<StoredMessage>> {
        let table = self.table();
        table.records.get(id).map(|record| record.messages.clone())
    }

    /// Manually trigger forced LRU eviction, reporting memory readings
    /// from before and after.
    pub async fn force_memory_cleanup(&self) -> CleanupReport {
        let before_memory = self.memory.sample();
        let sessions_cleaned = self.force_evict().await;
        CleanupReport {
            before_memory,
            after_memory: self.memory.sample(),
            sessions_cleaned,
        }
    }

    /// Tear down every remaining record, best-effort. Individual failures
    /// are logged and counted, never propagated.
    pub async fn shutdown(&self) {
        let victims = {
            let mut table = self.table();
            table.drain_all()
        };
        let count = victims.len();
        for victim in victims {
            self.teardown_record(victim, "shutdown").await;
        }
        info!(sessions = count, "session manager shut down");
    }

    // ── Sweep tiers ───────────────────────────────────────────────────────

    /// Run one tiered sweep pass. Returns `None` when a pass is already
    /// in flight (sweeps never overlap themselves).
    pub async fn run_sweep(&self) -> Option<SweepSummary> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sweep already in progress, skipping");
            return None;
        }
        let summary = self.sweep_once().await;
        self.sweeping.store(false, Ordering::Release);
        Some(summary)
    }

    async fn sweep_once(&self) -> SweepSummary {
        let lifecycle = &self.config.lifecycle;
        let memory_before = self.memory.sample();

        let (tier, cleaned) = if memory_before.percent >= lifecycle.force_cleanup_percent {
            warn!(
                percent = memory_before.percent,
                "memory above force threshold, evicting to a third"
            );
            let cleaned = self.force_evict().await;
            self.counters.force_cleanups.fetch_add(1, Ordering::Relaxed);
            (SweepTier::Force, cleaned)
        } else if memory_before.percent >= lifecycle.memory_pressure_percent {
            info!(
                percent = memory_before.percent,
                "memory pressure, running shortened-timeout cleanup"
            );
            let short = Duration::from_secs((lifecycle.session_timeout_minutes * 60 / 3).max(60));
            let mut cleaned = self.cleanup_inactive(short).await;
            if cleaned < PRESSURE_MIN_FREED
                && self.active_count() > lifecycle.max_sessions / 2
            {
                cleaned += self.evict_lru(PRESSURE_MIN_FREED).await;
            }
            self.counters
                .memory_cleanups
                .fetch_add(1, Ordering::Relaxed);
            (SweepTier::Pressure, cleaned)
        } else {
            let cleaned = self.cleanup_inactive(lifecycle.session_timeout()).await;
            (SweepTier::Normal, cleaned)
        };

        let overage_cleaned = self.cleanup_overage().await;
        let orphans_removed = self.sweep_orphan_workspaces().await;
        let memory_after = self.memory.sample();

        info!(
            tier = ?tier,
            cleaned,
            overage_cleaned,
            orphans_removed,
            percent_before = memory_before.percent,
            percent_after = memory_after.percent,
            "sweep complete"
        );

        SweepSummary {
            tier,
            cleaned,
            overage_cleaned,
            orphans_removed,
            memory_before,
            memory_after,
        }
    }

    /// LRU-evict down to roughly a third of the current count. The policy
    /// intentionally over-evicts rather than hovering at the threshold.
    async fn force_evict(&self) -> usize {
        let victims = {
            let mut table = self.table();
            let initial = table.len();
            if initial == 0 {
                return 0;
            }
            let target = (initial / 3).max(1);
            table.pop_lru(initial - target)
        };

        let cleaned = victims.len();
        for victim in victims {
            warn!(session_id = victim.id, "forced eviction");
            self.teardown_record(victim, "forced").await;
        }
        self.counters
            .total_cleaned
            .fetch_add(cleaned as u64, Ordering::Relaxed);
        cleaned
    }

    /// Evict a fixed number of least-recently-used records. Refuses to
    /// empty the table outright.
    async fn evict_lru(&self, count: usize) -> usize {
        let victims = {
            let mut table = self.table();
            if table.len() <= count {
                return 0;
            }
            table.pop_lru(count)
        };

        let cleaned = victims.len();
        for victim in victims {
            info!(session_id = victim.id, "lru eviction");
            self.teardown_record(victim, "lru").await;
        }
        self.counters
            .total_cleaned
            .fetch_add(cleaned as u64, Ordering::Relaxed);
        cleaned
    }

    /// Remove sessions past the absolute age ceiling regardless of
    /// activity.
    async fn cleanup_overage(&self) -> usize {
        let max_age = self.config.lifecycle.max_session_age();
        let now = Utc::now();

        let victims = {
            let mut table = self.table();
            let matched: Vec<String> = table
                .records
                .values()
                .filter(|record| record.exceeds_age(max_age, now))
                .map(|record| record.id.clone())
                .collect();
            matched
                .iter()
                .filter_map(|id| table.remove(id))
                .collect::<Vec<_>>()
        };

        let cleaned = victims.len();
        for victim in victims {
            info!(
                session_id = victim.id,
                created_at = %victim.created_at,
                "max-age eviction"
            );
            self.teardown_record(victim, "overage").await;
        }
        self.counters
            .total_cleaned
            .fetch_add(cleaned as u64, Ordering::Relaxed);
        cleaned
    }

    async fn sweep_orphan_workspaces(&self) -> usize {
        let owned: HashSet<PathBuf> = {
            let table = self.table();
            table
                .records
                .values()
                .filter_map(|record| record.workspace_path.clone())
                .collect()
        };
        workspace::sweep_orphans(
            &self.config.workspace_root,
            &owned,
            self.config.lifecycle.orphan_grace(),
        )
        .await
    }

    // ── Engine handle checkout ────────────────────────────────────────────

    /// Take the engine handle (if any) out of a record for exclusive use
    /// by one turn. `None` when the session is unknown.
    pub(crate) fn checkout_agent(&self, id: &str) -> Option<AgentCheckout> {
        let mut table = self.table();
        let record = table.records.get_mut(id)?;
        record.touch();
        let checkout = AgentCheckout {
            handle: record.agent.take(),
            generation: record.config_generation,
            config: record.config.clone(),
        };
        table.touch_lru(id);
        Some(checkout)
    }

    /// Record the workspace path the engine allocated for a session.
    pub(crate) fn record_workspace(&self, id: &str, path: Option<PathBuf>) -> bool {
        let mut table = self.table();
        let Some(record) = table.records.get_mut(id) else {
            return false;
        };
        if record.workspace_path.is_none() {
            record.workspace_path = path;
        }
        true
    }

    /// Return a checked-out handle to its record. A handle from an older
    /// config generation, or whose record is gone, is stopped instead of
    /// restored.
    pub(crate) async fn restore_agent(&self, id: &str, handle: Box<dyn AgentHandle>, generation: u64) {
        let workspace = handle.workspace_path();
        let stale = {
            let mut table = self.table();
            match table.records.get_mut(id) {
                Some(record)
                    if record.config_generation == generation && record.agent.is_none() =>
                {
                    if record.workspace_path.is_none() {
                        record.workspace_path = workspace;
                    }
                    record.agent = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };

        if let Some(stale) = stale {
            info!(session_id = id, "stopping stale engine handle");
            if let Err(err) = stale.stop().await {
                warn!(session_id = id, %err, "stale engine stop failed");
                self.counters
                    .teardown_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Cascading teardown of one record already removed from the table.
    /// Tolerates partial failure; each failed step is logged and counted,
    /// and the record is reclaimed regardless.
    async fn teardown_record(&self, mut record: SessionRecord, reason: &str) {
        if !record.status.can_transition_to(SessionStatus::Evicting) {
            warn!(
                session_id = record.id,
                status = ?record.status,
                "teardown on non-active record"
            );
        }
        record.status = SessionStatus::Evicting;
        record.cleanup_attempts += 1;

        if let Some(handle) = record.agent.take() {
            if record.workspace_path.is_none() {
                record.workspace_path = handle.workspace_path();
            }
            if let Err(err) = handle.stop().await {
                warn!(session_id = record.id, %err, "engine stop failed during teardown");
                self.counters
                    .teardown_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(path) = record.workspace_path.take() {
            match workspace::remove_workspace(&self.config.workspace_root, &path).await {
                Ok(()) => {}
                Err(AppError::PathViolation(msg)) => {
                    warn!(session_id = record.id, %msg, "refusing to delete workspace outside root");
                    self.counters
                        .teardown_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!(session_id = record.id, %err, "workspace removal failed");
                    self.counters
                        .teardown_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        record.resource_count = 0;
        record.status = SessionStatus::Closed;
        info!(
            session_id = record.id,
            reason,
            attempts = record.cleanup_attempts,
            "session torn down"
        );
    }
}
