//! Pipeline counters and system metrics, shared across daemon components and
//! served as JSON.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot: pipeline counters plus system stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub system: SystemMetrics,
    /// Work units waiting in the local queue.
    pub queue_len: usize,
    /// Encodes currently executing in the local pool.
    pub running_jobs: usize,
    pub dispatched_jobs: u64,
    pub succeeded_jobs: u64,
    pub failed_jobs: u64,
    pub chunk_sets_concatenated: u64,
    /// Concatenations discarded because a duplicate was committed first.
    pub races_discarded: u64,
    pub hook_failures: u64,
    pub total_bytes_encoded: u64,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_metrics_start_at_zero() {
        let metrics = new_shared_metrics();
        let snapshot = metrics.read().await.clone();
        assert_eq!(snapshot, MetricsSnapshot::default());
        assert_eq!(snapshot.races_discarded, 0);
    }

    #[test]
    fn test_snapshot_field_names() {
        let json = serde_json::to_string(&MetricsSnapshot::default()).unwrap();
        for field in [
            "timestamp_unix_ms",
            "system",
            "cpu_usage_percent",
            "queue_len",
            "running_jobs",
            "dispatched_jobs",
            "succeeded_jobs",
            "failed_jobs",
            "chunk_sets_concatenated",
            "races_discarded",
            "hook_failures",
            "total_bytes_encoded",
        ] {
            assert!(json.contains(field), "missing {field}");
        }
    }

    #[test]
    fn test_system_metrics_are_percentages() {
        let system = collect_system_metrics();
        assert!((0.0..=100.0).contains(&system.mem_usage_percent));
        assert!(system.load_avg_1 >= 0.0);
    }
}
