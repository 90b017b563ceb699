//! Session lifecycle subsystem: registry, memory tiers, sweep, and
//! workspace reclamation.

pub mod manager;
pub mod memory;
pub mod sweeper;
pub mod workspace;

pub use manager::{CleanupReport, CleanupStats, ManagerStats, SessionManager, SweepSummary, SweepTier};
pub use memory::{MemoryMonitor, MemoryReading, MemorySource};
pub use sweeper::spawn_sweeper;
