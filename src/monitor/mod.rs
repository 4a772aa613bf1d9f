//! Reload counters, timings and memory samples.
//!
//! Counters are atomics so the worker records without locking. The optional
//! memory sampler is a tokio task; starting it twice or stopping it when it
//! is not running does nothing.

mod memory;
mod timer;

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use memory::{MemoryProbe, format_bytes};

pub use memory::MemorySample;
pub use timer::ReloadTimer;

/// Samples kept for the report; older ones are dropped.
const MAX_SAMPLES: usize = 120;

/// Snapshot returned by [`PerformanceMonitor::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub reload_count: u64,
    pub error_count: u64,
    pub total_reload_time_ms: f64,
    pub last_reload_duration_ms: f64,
    pub average_reload_time_ms: f64,
    /// Unix time in milliseconds.
    pub start_time_ms: u64,
    pub uptime_secs: f64,
    pub peak_rss_bytes: u64,
    pub memory_samples: Vec<MemorySample>,
}

pub struct PerformanceMonitor {
    started: Instant,
    started_at: SystemTime,
    reload_count: AtomicU64,
    error_count: AtomicU64,
    total_reload_us: AtomicU64,
    last_reload_us: AtomicU64,
    peak_rss: AtomicU64,
    samples: Mutex<VecDeque<MemorySample>>,
    probe: MemoryProbe,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: SystemTime::now(),
            reload_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_reload_us: AtomicU64::new(0),
            last_reload_us: AtomicU64::new(0),
            peak_rss: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)),
            probe: MemoryProbe::new(),
            sampler: Mutex::new(None),
        }
    }

    pub fn create_timer(&self) -> ReloadTimer {
        ReloadTimer::start()
    }

    /// Count one successful reload that took `elapsed`.
    pub fn record_reload_time(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.reload_count.fetch_add(1, Ordering::Relaxed);
        self.total_reload_us.fetch_add(us, Ordering::Relaxed);
        self.last_reload_us.store(us, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Take one memory sample now.
    pub fn sample_memory(&self) -> Option<MemorySample> {
        let (rss_bytes, virtual_bytes) = self.probe.read()?;
        let sample = MemorySample {
            at_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            rss_bytes,
            virtual_bytes,
        };
        self.peak_rss.fetch_max(rss_bytes, Ordering::Relaxed);
        let mut samples = self.samples.lock();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(sample);
        Some(sample)
    }

    /// Start periodic sampling. Returns false if already running.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start_sampler(self: &Arc<Self>, interval: Duration) -> bool {
        let mut slot = self.sampler.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        let monitor: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.sample_memory();
            }
        }));
        true
    }

    /// Stop periodic sampling. Returns false if it was not running.
    pub fn stop_sampler(&self) -> bool {
        match self.sampler.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn stats(&self) -> PerformanceStats {
        let reload_count = self.reload_count.load(Ordering::Relaxed);
        let total_us = self.total_reload_us.load(Ordering::Relaxed);
        let average_us = if reload_count == 0 {
            0.0
        } else {
            total_us as f64 / reload_count as f64
        };
        PerformanceStats {
            reload_count,
            error_count: self.error_count.load(Ordering::Relaxed),
            total_reload_time_ms: total_us as f64 / 1000.0,
            last_reload_duration_ms: self.last_reload_us.load(Ordering::Relaxed) as f64 / 1000.0,
            average_reload_time_ms: average_us / 1000.0,
            start_time_ms: self
                .started_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            peak_rss_bytes: self.peak_rss.load(Ordering::Relaxed),
            memory_samples: self.samples.lock().iter().copied().collect(),
        }
    }

    /// Human-readable multi-line report.
    pub fn report(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(out, "uptime: {:.1}s", stats.uptime_secs);
        let _ = writeln!(
            out,
            "reloads: {} (errors: {})",
            stats.reload_count, stats.error_count
        );
        let _ = writeln!(
            out,
            "reload time: total {:.1}ms, avg {:.1}ms, last {:.1}ms",
            stats.total_reload_time_ms, stats.average_reload_time_ms, stats.last_reload_duration_ms
        );
        match stats.memory_samples.last() {
            Some(latest) => {
                let _ = write!(
                    out,
                    "memory: rss {} (peak {}, {} samples)",
                    format_bytes(latest.rss_bytes),
                    format_bytes(stats.peak_rss_bytes),
                    stats.memory_samples.len()
                );
            }
            None => out.push_str("memory: not sampled"),
        }
        out
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.sampler.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_average() {
        let monitor = PerformanceMonitor::new();
        monitor.record_reload_time(Duration::from_millis(10));
        monitor.record_reload_time(Duration::from_millis(30));
        monitor.record_error();

        let stats = monitor.stats();
        assert_eq!(stats.reload_count, 2);
        assert_eq!(stats.error_count, 1);
        assert!((stats.total_reload_time_ms - 40.0).abs() < 0.01);
        assert!((stats.average_reload_time_ms - 20.0).abs() < 0.01);
        assert!((stats.last_reload_duration_ms - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_stats_have_zero_average() {
        let stats = PerformanceMonitor::new().stats();
        assert_eq!(stats.reload_count, 0);
        assert_eq!(stats.average_reload_time_ms, 0.0);
        assert!(stats.start_time_ms > 0);
    }

    #[test]
    fn test_report_mentions_counts() {
        let monitor = PerformanceMonitor::new();
        monitor.record_reload_time(Duration::from_millis(2));
        let report = monitor.report();
        assert!(report.contains("reloads: 1 (errors: 0)"));
        assert!(report.contains("uptime:"));
    }

    #[test]
    fn test_stats_serialize_as_json() {
        let monitor = PerformanceMonitor::new();
        monitor.record_error();
        let json = serde_json::to_value(monitor.stats()).unwrap();
        assert_eq!(json["error_count"], 1);
        assert!(json["memory_samples"].is_array());
    }

    #[tokio::test]
    async fn test_sampler_start_stop_idempotent() {
        let monitor = Arc::new(PerformanceMonitor::new());
        assert!(!monitor.stop_sampler());
        assert!(monitor.start_sampler(Duration::from_millis(10)));
        assert!(!monitor.start_sampler(Duration::from_millis(10)));
        assert!(monitor.is_sampling());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.stop_sampler());
        assert!(!monitor.stop_sampler());
        assert!(!monitor.is_sampling());
    }
}
