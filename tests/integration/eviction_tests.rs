//! Integration tests for capacity eviction, inactivity cleanup, and the
//! tiered memory sweep.

use std::sync::Arc;
use std::time::Duration;

use tabletalk::config::GlobalConfig;
use tabletalk::session::SweepTier;

use super::test_helpers::{test_config, test_stack, MockRuntime, StaticMemory};

/// Config with a caller-supplied `[lifecycle]` table; every other knob
/// keeps its default.
fn config_with_lifecycle(workspace_root: &str, lifecycle: &str) -> Arc<GlobalConfig> {
    let toml = format!(
        r#"
workspace_root = '{workspace_root}'
engine_command = "echo"

[lifecycle]
{lifecycle}
"#
    );
    Arc::new(GlobalConfig::from_toml_str(&toml).expect("valid test config"))
}

#[tokio::test]
async fn capacity_eviction_removes_least_recently_used() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_with_lifecycle(
        temp.path().to_str().expect("utf8"),
        "max_sessions = 3\nheartbeat_loss_minutes = 30\n",
    );
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    manager.create(Some("a".into()), None).await;
    manager.create(Some("b".into()), None).await;
    manager.create(Some("c".into()), None).await;
    manager.create(Some("d".into()), None).await;

    assert_eq!(manager.active_count(), 3);
    assert!(manager.get("a").is_none(), "oldest session is evicted");
    assert_eq!(manager.list(), vec!["b", "c", "d"]);
    assert_eq!(manager.stats().cleanup_stats.total_cleaned, 1);
}

#[tokio::test]
async fn capacity_eviction_respects_lru_touch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_with_lifecycle(
        temp.path().to_str().expect("utf8"),
        "max_sessions = 3\nheartbeat_loss_minutes = 30\n",
    );
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    manager.create(Some("a".into()), None).await;
    manager.create(Some("b".into()), None).await;
    manager.create(Some("c".into()), None).await;

    // Touch "a" so "b" is now the least recently used.
    manager.get("a");
    manager.create(Some("d".into()), None).await;

    assert!(manager.get("b").is_none());
    assert!(manager.get("a").is_some());
}

#[tokio::test]
async fn eleventh_session_displaces_exactly_one_at_default_capacity() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(temp.path().to_str().expect("utf8")));
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    for n in 0..11 {
        manager.create(Some(format!("sess-{n}")), None).await;
    }

    let stats = manager.stats();
    assert_eq!(stats.active_sessions, 10);
    assert_eq!(stats.max_sessions, 10);
    assert_eq!(stats.cleanup_stats.total_created, 11);
    assert_eq!(stats.cleanup_stats.total_cleaned, 1);
    assert!(manager.get("sess-0").is_none(), "only the oldest goes");
    assert!(manager.get("sess-1").is_some());
    assert!(manager.get("sess-10").is_some());
}

#[tokio::test]
async fn cleanup_inactive_zero_timeout_reclaims_idle_sessions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(temp.path().to_str().expect("utf8")));
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    manager.create(Some("a".into()), None).await;
    manager.create(Some("b".into()), None).await;
    manager.create(Some("c".into()), None).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let cleaned = manager.cleanup_inactive(Duration::ZERO).await;

    assert_eq!(cleaned, 3);
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.stats().cleanup_stats.total_cleaned, 3);
}

#[tokio::test]
async fn heartbeat_loss_evicts_despite_generous_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_with_lifecycle(
        temp.path().to_str().expect("utf8"),
        "heartbeat_loss_minutes = 0\n",
    );
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    manager.create(Some("a".into()), None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The inactivity timeout alone would keep the session alive.
    let cleaned = manager.cleanup_inactive(Duration::from_secs(3600)).await;

    assert_eq!(cleaned, 1);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn force_memory_cleanup_evicts_to_a_third() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(temp.path().to_str().expect("utf8")));
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(60.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    for n in 0..9 {
        manager.create(Some(format!("sess-{n}")), None).await;
    }

    let report = manager.force_memory_cleanup().await;

    assert_eq!(report.sessions_cleaned, 6);
    assert_eq!(manager.active_count(), 3);
    assert!((report.before_memory.percent - 60.0).abs() < f64::EPSILON);
    assert!((report.after_memory.percent - 60.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn sweep_runs_force_tier_above_force_threshold() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(temp.path().to_str().expect("utf8")));
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(90.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    for n in 0..10 {
        manager.create(Some(format!("sess-{n}")), None).await;
    }

    let summary = manager.run_sweep().await.expect("sweep runs");

    assert_eq!(summary.tier, SweepTier::Force);
    assert_eq!(summary.cleaned, 7, "evicted down to a third of ten");
    assert_eq!(manager.active_count(), 3);
    assert_eq!(manager.stats().cleanup_stats.force_cleanups, 1);
}

#[tokio::test]
async fn sweep_runs_pressure_tier_between_thresholds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(temp.path().to_str().expect("utf8")));
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(80.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    // More than half of capacity, all fresh, so the shortened timeout
    // frees nothing and the tier falls back to a fixed LRU batch.
    for n in 0..6 {
        manager.create(Some(format!("sess-{n}")), None).await;
    }

    let summary = manager.run_sweep().await.expect("sweep runs");

    assert_eq!(summary.tier, SweepTier::Pressure);
    assert_eq!(summary.cleaned, 3);
    assert_eq!(manager.active_count(), 3);
    assert_eq!(manager.stats().cleanup_stats.memory_cleanups, 1);
}

#[tokio::test]
async fn sweep_runs_normal_tier_when_memory_low() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_with_lifecycle(
        temp.path().to_str().expect("utf8"),
        "session_timeout_minutes = 0\nheartbeat_loss_minutes = 30\n",
    );
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    manager.create(Some("a".into()), None).await;
    manager.create(Some("b".into()), None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let summary = manager.run_sweep().await.expect("sweep runs");

    assert_eq!(summary.tier, SweepTier::Normal);
    assert_eq!(summary.cleaned, 2);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn sequential_sweeps_both_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(temp.path().to_str().expect("utf8")));
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    assert!(manager.run_sweep().await.is_some());
    assert!(manager.run_sweep().await.is_some(), "flag is released");
}

#[tokio::test]
async fn sweep_reclaims_sessions_past_age_ceiling() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_with_lifecycle(
        temp.path().to_str().expect("utf8"),
        "max_session_age_minutes = 0\nheartbeat_loss_minutes = 30\n",
    );
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    manager.create(Some("a".into()), None).await;
    manager.create(Some("b".into()), None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let summary = manager.run_sweep().await.expect("sweep runs");

    // The default thirty-minute timeout keeps them active; only the age
    // ceiling reclaims them.
    assert_eq!(summary.cleaned, 0);
    assert_eq!(summary.overage_cleaned, 2);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn sweep_removes_orphaned_workspace_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_with_lifecycle(
        temp.path().to_str().expect("utf8"),
        "orphan_grace_minutes = 0\nheartbeat_loss_minutes = 30\n",
    );
    let runtime = MockRuntime::echo("ok");
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, _runner) = test_stack(&config, &runtime, &memory);

    let orphan = config.workspace_root().join("session_stale");
    std::fs::create_dir(&orphan).expect("create orphan");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let summary = manager.run_sweep().await.expect("sweep runs");

    assert_eq!(summary.orphans_removed, 1);
    assert!(!orphan.exists());
}

#[tokio::test]
async fn sweep_leaves_live_session_workspaces_alone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_with_lifecycle(
        temp.path().to_str().expect("utf8"),
        "orphan_grace_minutes = 0\nheartbeat_loss_minutes = 30\n",
    );
    let runtime = MockRuntime::echo_with_workspaces("ok", config.workspace_root());
    let memory = StaticMemory::at_percent(50.0);
    let (manager, _broadcaster, runner) = test_stack(&config, &runtime, &memory);

    manager.create(Some("sess-live".into()), None).await;
    runner
        .submit("sess-live", "hello".into())
        .expect("turn queued");
    for _ in 0..100 {
        if runner.active_turns() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let snapshot = manager.get("sess-live").expect("session exists");
    let workspace = snapshot.workspace_path.expect("workspace recorded");
    assert!(workspace.exists());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = manager.run_sweep().await.expect("sweep runs");

    assert_eq!(summary.orphans_removed, 0);
    assert!(workspace.exists(), "owned workspace survives the sweep");
}
