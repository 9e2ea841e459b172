/// 性能监控 (Performance Monitor)
///
/// 所有线程通过事件通道上报计时和日志,监控线程单独汇总:
/// ```text
/// grabber / worker ──PerfEvent──► [bounded channel] ──► PerformanceMonitor
///                                                          │ 每 log_interval
///                                                          ▼
///                                   PerformanceReport (tracing 表格 / JSON 通道)
/// ```
/// 计数器 (processed / dropped) 走共享原子变量,
/// 报告时直接读取,不经过事件通道。
pub mod report;
pub mod stats;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use report::{OperationReport, PerformanceReport};
pub use stats::{CounterRegistry, CounterSnapshot, StageCounters, TimingStats};

/// 事件通道容量 (满时丢弃计时事件,不阻塞热路径)
pub const PERF_EVENT_CAPACITY: usize = 8192;

const MONITOR_TICK: Duration = Duration::from_millis(50);

/// 丢帧日志节流: 第一次以及之后每 N 次
pub const DROP_LOG_EVERY: u64 = 100;

pub fn should_log_drop(dropped_total: u64) -> bool {
    dropped_total == 1 || dropped_total % DROP_LOG_EVERY == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PerfEvent {
    Timing {
        stream_id: String,
        operation: String,
        duration: Duration,
    },
    Log {
        severity: Severity,
        message: String,
    },
}

/// Write side of the monitor; cheap to clone into every thread.
#[derive(Debug, Clone)]
pub struct PerfHandle {
    tx: Sender<PerfEvent>,
}

impl PerfHandle {
    pub fn record(&self, stream_id: &str, operation: &str, duration: Duration) {
        let _ = self.tx.try_send(PerfEvent::Timing {
            stream_id: stream_id.to_string(),
            operation: operation.to_string(),
            duration,
        });
    }

    pub fn record_log(&self, severity: Severity, message: impl Into<String>) {
        let _ = self.tx.try_send(PerfEvent::Log {
            severity,
            message: message.into(),
        });
    }

    /// 计时执行闭包并上报
    pub fn measure<T>(&self, stream_id: &str, operation: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(stream_id, operation, start.elapsed());
        out
    }
}

/// 创建一对独立的事件通道 (测试和嵌入式使用)
pub fn perf_channel(capacity: usize) -> (PerfHandle, Receiver<PerfEvent>) {
    let (tx, rx) = bounded(capacity);
    (PerfHandle { tx }, rx)
}

pub struct PerformanceMonitor {
    tx: Sender<PerfEvent>,
    rx: Receiver<PerfEvent>,
    metrics: BTreeMap<String, BTreeMap<String, TimingStats>>,
    counters: CounterRegistry,
    log_interval: Duration,
    window_start: Instant,
    report_tx: Option<Sender<PerformanceReport>>,
}

impl PerformanceMonitor {
    pub fn new(log_interval: Duration, counters: CounterRegistry) -> Self {
        let (tx, rx) = bounded(PERF_EVENT_CAPACITY);
        Self {
            tx,
            rx,
            metrics: BTreeMap::new(),
            counters,
            log_interval,
            window_start: Instant::now(),
            report_tx: None,
        }
    }

    /// 每个报告同时转发到该通道 (满时丢弃)
    pub fn with_report_sink(mut self, tx: Sender<PerformanceReport>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    pub fn handle(&self) -> PerfHandle {
        PerfHandle { tx: self.tx.clone() }
    }

    /// 非阻塞处理待处理事件, 每次最多一个通道容量, 返回处理数量
    pub fn drain(&mut self) -> usize {
        let events: Vec<PerfEvent> = self.rx.try_iter().take(PERF_EVENT_CAPACITY).collect();
        let n = events.len();
        for event in events {
            self.apply(event);
        }
        n
    }

    fn apply(&mut self, event: PerfEvent) {
        match event {
            PerfEvent::Timing {
                stream_id,
                operation,
                duration,
            } => {
                self.metrics
                    .entry(stream_id)
                    .or_default()
                    .entry(operation)
                    .or_default()
                    .update(duration);
            }
            PerfEvent::Log { severity, message } => match severity {
                Severity::Debug => debug!("{}", message),
                Severity::Info => info!("{}", message),
                Severity::Warning => warn!("{}", message),
                Severity::Error => error!("{}", message),
            },
        }
    }

    /// 生成当前窗口报告并清空统计 (计数器不清零)
    pub fn build_report(&mut self) -> PerformanceReport {
        let streams = self
            .metrics
            .iter()
            .map(|(stream_id, ops)| {
                let rows = ops
                    .iter()
                    .filter(|(_, s)| s.count > 0)
                    .map(|(op, s)| OperationReport::from_stats(op, s))
                    .collect();
                (stream_id.clone(), rows)
            })
            .collect();

        let report = PerformanceReport {
            generated_at: Utc::now(),
            window_ms: self.window_start.elapsed().as_millis() as u64,
            streams,
            counters: self.counters.snapshot(),
        };
        self.metrics.clear();
        self.window_start = Instant::now();
        report
    }

    fn emit_report(&mut self) {
        let report = self.build_report();
        info!("📊 Performance report\n{}", report.format_table());
        if let Some(tx) = &self.report_tx {
            let _ = tx.try_send(report);
        }
    }

    fn run(mut self, running: Arc<AtomicBool>) {
        info!(
            interval_ms = self.log_interval.as_millis() as u64,
            "✅ Performance monitor started"
        );
        while running.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(MONITOR_TICK) {
                Ok(event) => {
                    self.apply(event);
                    self.drain();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.window_start.elapsed() >= self.log_interval {
                self.emit_report();
            }
        }
        // 最终报告
        self.drain();
        self.emit_report();
        info!("🛑 Performance monitor stopped");
    }

    pub fn spawn(self) -> std::io::Result<MonitorHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = thread::Builder::new()
            .name("perf-monitor".to_string())
            .spawn(move || self.run(flag))?;
        Ok(MonitorHandle {
            running,
            thread: Some(thread),
        })
    }
}

pub struct MonitorHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// 停止监控线程并等待最终报告输出
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("performance monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
