//! 计时统计与共享计数器
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

/// 单个 (stream, operation) 的区间统计
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    pub total: Duration,
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self {
            total: Duration::ZERO,
            count: 0,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }
}

impl TimingStats {
    pub fn update(&mut self, duration: Duration) {
        self.total += duration;
        self.count += 1;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }

    /// 无样本时为 0
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total.div_f64(self.count as f64)
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-stage `processed` / `dropped` counters shared between threads.
#[derive(Debug, Default)]
pub struct StageCounters {
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl StageCounters {
    pub fn add_processed(&self, n: u64) -> u64 {
        self.processed.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Returns the dropped total after this increment.
    pub fn add_dropped(&self, n: u64) -> u64 {
        self.dropped.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed(),
            dropped: self.dropped(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub dropped: u64,
}

/// 按阶段名注册的计数器表 (监控线程在报告时直接读取)
#[derive(Debug, Clone, Default)]
pub struct CounterRegistry {
    stages: Arc<Mutex<BTreeMap<String, Arc<StageCounters>>>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建某个阶段的计数器
    pub fn stage(&self, name: &str) -> Arc<StageCounters> {
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        stages
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(StageCounters::default()))
            .clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CounterSnapshot> {
        let stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        stages
            .iter()
            .map(|(name, c)| (name.clone(), c.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timing_stats_window() {
        let mut stats = TimingStats::default();
        assert_eq!(stats.average(), Duration::ZERO);

        for ms in [4, 10, 7] {
            stats.update(Duration::from_millis(ms));
        }
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(4));
        assert_eq!(stats.max, Duration::from_millis(10));
        assert_eq!(stats.average(), Duration::from_millis(7));
        assert!(stats.min <= stats.average() && stats.average() <= stats.max);

        stats.reset();
        stats.update(Duration::from_millis(2));
        assert_eq!(stats.count, 1);
        assert_eq!(stats.min, Duration::from_millis(2));
    }

    #[test]
    fn test_counters_concurrent_increments() {
        let registry = CounterRegistry::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = registry.stage("grabber");
                thread::spawn(move || {
                    for _ in 0..1000 {
                        c.add_processed(1);
                        c.add_dropped(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = registry.snapshot();
        assert_eq!(snap["grabber"], CounterSnapshot { processed: 4000, dropped: 4000 });
    }
}
