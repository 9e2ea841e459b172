//! 周期性能报告 (Performance report)
use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::stats::{CounterSnapshot, TimingStats};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub operation: String,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub count: u64,
}

impl OperationReport {
    pub fn from_stats(operation: &str, stats: &TimingStats) -> Self {
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1000.0;
        Self {
            operation: operation.to_string(),
            avg_ms: ms(stats.average()),
            min_ms: if stats.count == 0 { 0.0 } else { ms(stats.min) },
            max_ms: ms(stats.max),
            count: stats.count,
        }
    }
}

/// 一个统计窗口的报告: 每路流的操作耗时 + 各阶段计数
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub window_ms: u64,
    pub streams: BTreeMap<String, Vec<OperationReport>>,
    pub counters: BTreeMap<String, CounterSnapshot>,
}

impl PerformanceReport {
    pub fn operation(&self, stream_id: &str, operation: &str) -> Option<&OperationReport> {
        self.streams
            .get(stream_id)?
            .iter()
            .find(|op| op.operation == operation)
    }

    /// 固定宽度文本表格
    pub fn format_table(&self) -> String {
        let rule = "=".repeat(50);
        let mut out = String::new();
        for (stream_id, ops) in &self.streams {
            let _ = writeln!(out, "{}", rule);
            let _ = writeln!(out, "Stream: {}", stream_id);
            let _ = writeln!(out, "{}", rule);
            let _ = writeln!(out, "Operation Timings (ms):");
            let _ = writeln!(
                out,
                "{:<20} {:>10} {:>10} {:>10}",
                "Operation", "Average", "Min", "Max"
            );
            let _ = writeln!(out, "{}", "-".repeat(50));
            for op in ops {
                let _ = writeln!(
                    out,
                    "{:<20} {:>10.1} {:>10.1} {:>10.1}",
                    op.operation, op.avg_ms, op.min_ms, op.max_ms
                );
            }
        }
        if !self.counters.is_empty() {
            let _ = writeln!(out, "{}", rule);
            let _ = writeln!(out, "{:<20} {:>10} {:>10}", "Stage", "Processed", "Dropped");
            let _ = writeln!(out, "{}", "-".repeat(50));
            for (stage, c) in &self.counters {
                let _ = writeln!(out, "{:<20} {:>10} {:>10}", stage, c.processed, c.dropped);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_table_lists_operations_and_counters() {
        let mut stats = TimingStats::default();
        stats.update(Duration::from_millis(12));
        stats.update(Duration::from_millis(8));

        let mut streams = BTreeMap::new();
        streams.insert(
            "cam1".to_string(),
            vec![OperationReport::from_stats("frame_grab", &stats)],
        );
        let mut counters = BTreeMap::new();
        counters.insert("grabber".to_string(), CounterSnapshot { processed: 10, dropped: 2 });

        let report = PerformanceReport {
            generated_at: Utc::now(),
            window_ms: 5000,
            streams,
            counters,
        };
        let table = report.format_table();
        assert!(table.contains("Stream: cam1"));
        assert!(table.contains("frame_grab"));
        assert!(table.contains("10.0"));
        assert!(table.contains("grabber"));

        let op = report.operation("cam1", "frame_grab").unwrap();
        assert_eq!(op.count, 2);
        assert!((op.min_ms - 8.0).abs() < 1e-9);
        assert!((op.max_ms - 12.0).abs() < 1e-9);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["counters"]["grabber"]["dropped"], 2);
    }
}
