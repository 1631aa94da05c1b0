//! Stateful metric calculator
//!
//! Turns raw cumulative runtime samples into per-sample percentages. CPU
//! usage is a rate, so it is derived from the delta against the previous
//! sample for the same container (the baseline). The first sample for a
//! container, a zero system delta and a counter that moved backwards all
//! yield 0% rather than an error.

mod baseline;
mod restart;

pub use baseline::{BaselinePolicy, BaselineStore};
pub use restart::{watch_restarts, RestartAction};

use crate::models::{CalculatedStats, RawSample};
use crate::observability::RelayMetrics;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Upper bound for CPU percent (ten fully busy cores)
pub const MAX_CPU_PERCENT: f64 = 1000.0;

/// CPU counters needed to compute a delta
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuCounters {
    cpu_usage: u64,
    system_usage: u64,
    online_cores: u32,
}

impl CpuCounters {
    fn from_sample(sample: &RawSample) -> Self {
        let cpu = &sample.cpu_stats;
        let online_cores = if !cpu.cpu_usage.percpu_usage.is_empty() {
            cpu.cpu_usage.percpu_usage.len() as u32
        } else if cpu.online_cpus > 0 {
            cpu.online_cpus
        } else {
            1
        };

        Self {
            cpu_usage: cpu.cpu_usage.total_usage,
            system_usage: cpu.system_cpu_usage,
            online_cores,
        }
    }
}

/// Calculator shared by all stats connections under the shared policy
pub struct MetricCalculator {
    baselines: BaselineStore,
    metrics: RelayMetrics,
    /// Only the shared calculator drives the baselines gauge
    report_baselines: bool,
}

impl Default for MetricCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricCalculator {
    pub fn new() -> Self {
        Self {
            baselines: BaselineStore::new(),
            metrics: RelayMetrics::new(),
            report_baselines: true,
        }
    }

    /// Private calculator for a single stats connection
    /// ([`BaselinePolicy::PerConnection`])
    pub fn for_connection() -> Self {
        Self {
            report_baselines: false,
            ..Self::new()
        }
    }

    /// Calculator to use for one stats connection under `policy`
    pub fn for_policy(shared: &Arc<MetricCalculator>, policy: BaselinePolicy) -> Arc<Self> {
        match policy {
            BaselinePolicy::Shared => Arc::clone(shared),
            BaselinePolicy::PerConnection => Arc::new(Self::for_connection()),
        }
    }

    fn report_tracked(&self) {
        if self.report_baselines {
            self.metrics.set_baselines_tracked(self.baselines.len());
        }
    }

    /// Compute stats for `sample` and make it the container's new baseline.
    ///
    /// The baseline is replaced even when the CPU percent falls back to 0,
    /// so the next sample always has a delta source.
    pub fn calculate(&self, container_id: &str, sample: RawSample) -> CalculatedStats {
        let current = CpuCounters::from_sample(&sample);

        let memory_usage = sample.memory_stats.usage;
        let memory_limit = sample.memory_stats.limit;
        let memory_percent = memory_percent(
            memory_usage,
            sample.memory_stats.cache_bytes(),
            memory_limit,
        );
        let (network_rx, network_tx) = network_totals(&sample);
        let (block_read, block_write) = block_io_totals(&sample);
        let pids = sample.pids_stats.current;

        let previous = self.baselines.replace(container_id, sample);
        let cpu_percent = match previous {
            Some(prev) => cpu_percent(&CpuCounters::from_sample(&prev), &current),
            None => {
                debug!(container_id = %container_id, "No baseline yet, reporting 0% CPU");
                0.0
            }
        };

        self.metrics.inc_samples_calculated();
        self.report_tracked();

        CalculatedStats {
            container_id: container_id.to_string(),
            timestamp: Utc::now(),
            cpu_percent,
            memory_usage,
            memory_limit,
            memory_percent,
            network_rx,
            network_tx,
            block_read,
            block_write,
            pids,
        }
    }

    /// Forget the baseline of one container (e.g. after a restart)
    pub fn reset_baseline(&self, container_id: &str) {
        if self.baselines.remove(container_id).is_some() {
            debug!(container_id = %container_id, "Reset stats baseline");
        }
        self.report_tracked();
    }

    pub fn clear_all_baselines(&self) {
        self.baselines.clear();
        self.report_tracked();
    }

    pub fn tracked_containers(&self) -> usize {
        self.baselines.len()
    }

    pub fn has_baseline(&self, container_id: &str) -> bool {
        self.baselines.contains(container_id)
    }
}

/// `(Δcpu / Δsystem) * cores * 100`, clamped to `[0, MAX_CPU_PERCENT]`
fn cpu_percent(previous: &CpuCounters, current: &CpuCounters) -> f64 {
    if current.cpu_usage < previous.cpu_usage {
        // counter reset, e.g. the container restarted
        return 0.0;
    }

    let delta_cpu = current.cpu_usage - previous.cpu_usage;
    let delta_system = current.system_usage.saturating_sub(previous.system_usage);
    if delta_system == 0 {
        return 0.0;
    }

    let percent =
        (delta_cpu as f64 / delta_system as f64) * current.online_cores as f64 * 100.0;
    percent.clamp(0.0, MAX_CPU_PERCENT)
}

/// Resident memory (usage minus page cache) as a share of the limit
fn memory_percent(usage: u64, cache: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    let rss = usage.saturating_sub(cache);
    rss as f64 / limit as f64 * 100.0
}

fn network_totals(sample: &RawSample) -> (u64, u64) {
    sample
        .networks
        .values()
        .fold((0u64, 0u64), |(rx, tx), net| {
            (rx.saturating_add(net.rx_bytes), tx.saturating_add(net.tx_bytes))
        })
}

fn block_io_totals(sample: &RawSample) -> (u64, u64) {
    let mut read = 0u64;
    let mut write = 0u64;
    for entry in &sample.blkio_stats.io_service_bytes_recursive {
        if entry.op.eq_ignore_ascii_case("read") {
            read = read.saturating_add(entry.value);
        } else if entry.op.eq_ignore_ascii_case("write") {
            write = write.saturating_add(entry.value);
        }
    }
    (read, write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlkioEntry, NetworkStats};

    fn cpu_sample(cpu: u64, system: u64, cores: usize) -> RawSample {
        let mut s = RawSample::default();
        s.cpu_stats.cpu_usage.total_usage = cpu;
        s.cpu_stats.cpu_usage.percpu_usage = vec![cpu / cores.max(1) as u64; cores];
        s.cpu_stats.system_cpu_usage = system;
        s.cpu_stats.online_cpus = cores as u32;
        s
    }

    #[test]
    fn test_first_sample_reports_zero_cpu() {
        let calc = MetricCalculator::new();
        let stats = calc.calculate("c1", cpu_sample(1_000_000_000, 2_000_000_000, 4));

        assert_eq!(stats.cpu_percent, 0.0);
        assert!(calc.has_baseline("c1"));
    }

    #[test]
    fn test_cpu_percent_from_delta() {
        let calc = MetricCalculator::new();
        calc.calculate("c1", cpu_sample(1_000_000_000, 2_000_000_000, 4));
        let stats = calc.calculate("c1", cpu_sample(2_000_000_000, 4_000_000_000, 4));

        assert!((stats.cpu_percent - 200.0).abs() <= 1.0, "got {}", stats.cpu_percent);
    }

    #[test]
    fn test_backward_counter_reports_zero_and_rebases() {
        let calc = MetricCalculator::new();
        calc.calculate("c1", cpu_sample(5_000_000_000, 10_000_000_000, 2));

        let reset = calc.calculate("c1", cpu_sample(1_000_000_000, 12_000_000_000, 2));
        assert_eq!(reset.cpu_percent, 0.0);

        // The restarted counter is now the baseline.
        let next = calc.calculate("c1", cpu_sample(2_000_000_000, 14_000_000_000, 2));
        assert!((next.cpu_percent - 100.0).abs() <= 1.0, "got {}", next.cpu_percent);
    }

    #[test]
    fn test_zero_system_delta_reports_zero() {
        let calc = MetricCalculator::new();
        calc.calculate("c1", cpu_sample(1_000, 5_000, 1));
        let stats = calc.calculate("c1", cpu_sample(2_000, 5_000, 1));
        assert_eq!(stats.cpu_percent, 0.0);
    }

    #[test]
    fn test_cpu_percent_is_clamped() {
        let previous = CpuCounters {
            cpu_usage: 0,
            system_usage: 0,
            online_cores: 64,
        };
        let current = CpuCounters {
            cpu_usage: 1_000,
            system_usage: 1_000,
            online_cores: 64,
        };
        assert_eq!(cpu_percent(&previous, &current), MAX_CPU_PERCENT);
    }

    #[test]
    fn test_core_count_fallbacks() {
        let mut sample = cpu_sample(10, 10, 0);
        sample.cpu_stats.online_cpus = 0;
        assert_eq!(CpuCounters::from_sample(&sample).online_cores, 1);

        sample.cpu_stats.online_cpus = 6;
        assert_eq!(CpuCounters::from_sample(&sample).online_cores, 6);

        sample.cpu_stats.cpu_usage.percpu_usage = vec![1, 2, 3];
        assert_eq!(CpuCounters::from_sample(&sample).online_cores, 3);
    }

    #[test]
    fn test_memory_percent_excludes_cache() {
        let calc = MetricCalculator::new();
        let mut sample = RawSample::default();
        sample.memory_stats.usage = 1_200_000_000;
        sample.memory_stats.limit = 2_000_000_000;
        sample
            .memory_stats
            .stats
            .insert("cache".to_string(), 200_000_000);

        let stats = calc.calculate("c1", sample);
        assert!((stats.memory_percent - 50.0).abs() < 0.01);
        assert_eq!(stats.memory_usage, 1_200_000_000);
        assert_eq!(stats.memory_limit, 2_000_000_000);
    }

    #[test]
    fn test_memory_percent_without_limit() {
        assert_eq!(memory_percent(100, 0, 0), 0.0);
        assert_eq!(memory_percent(100, 500, 1000), 0.0);
    }

    #[test]
    fn test_io_totals() {
        let calc = MetricCalculator::new();
        let mut sample = RawSample::default();
        sample.networks.insert(
            "eth0".to_string(),
            NetworkStats {
                rx_bytes: 1000,
                tx_bytes: 2000,
            },
        );
        sample.networks.insert(
            "eth1".to_string(),
            NetworkStats {
                rx_bytes: 500,
                tx_bytes: 250,
            },
        );
        sample.blkio_stats.io_service_bytes_recursive = vec![
            BlkioEntry { op: "Read".to_string(), value: 5000 },
            BlkioEntry { op: "write".to_string(), value: 10000 },
            BlkioEntry { op: "Sync".to_string(), value: 99 },
            BlkioEntry { op: "read".to_string(), value: 1 },
        ];
        sample.pids_stats.current = 10;

        let stats = calc.calculate("c1", sample);
        assert_eq!((stats.network_rx, stats.network_tx), (1500, 2250));
        assert_eq!((stats.block_read, stats.block_write), (5001, 10000));
        assert_eq!(stats.pids, 10);
    }

    #[test]
    fn test_reset_and_clear_behave_as_first_seen() {
        let calc = MetricCalculator::new();
        calc.calculate("c1", cpu_sample(1_000, 2_000, 1));
        calc.calculate("c2", cpu_sample(1_000, 2_000, 1));

        calc.reset_baseline("c1");
        assert_eq!(calc.calculate("c1", cpu_sample(2_000, 4_000, 1)).cpu_percent, 0.0);
        assert!(calc.calculate("c2", cpu_sample(2_000, 4_000, 1)).cpu_percent > 0.0);

        calc.clear_all_baselines();
        assert_eq!(calc.tracked_containers(), 0);
        assert_eq!(calc.calculate("c1", cpu_sample(3_000, 6_000, 1)).cpu_percent, 0.0);
        assert_eq!(calc.calculate("c2", cpu_sample(3_000, 6_000, 1)).cpu_percent, 0.0);
    }

    #[test]
    fn test_policy_selects_calculator() {
        let shared = Arc::new(MetricCalculator::new());
        let same = MetricCalculator::for_policy(&shared, BaselinePolicy::Shared);
        assert!(Arc::ptr_eq(&shared, &same));

        let own = MetricCalculator::for_policy(&shared, BaselinePolicy::PerConnection);
        assert!(!Arc::ptr_eq(&shared, &own));

        shared.calculate("c1", cpu_sample(1_000, 2_000, 1));
        assert_eq!(own.calculate("c1", cpu_sample(2_000, 4_000, 1)).cpu_percent, 0.0);
    }

    #[test]
    fn test_stats_serialize_with_wire_names() {
        let calc = MetricCalculator::new();
        let stats = calc.calculate("abc", RawSample::default());
        let json = serde_json::to_value(&stats).unwrap();

        for key in [
            "container_id",
            "timestamp",
            "cpu_percent",
            "memory_usage",
            "memory_limit",
            "memory_percent",
            "network_rx",
            "network_tx",
            "block_read",
            "block_write",
            "pids",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }
}
