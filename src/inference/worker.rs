//! 一级推理 worker
//!
//! 每个 worker 独占一个检测器实例, 循环: 组批 → 推理 → 输出结果。
//! 单个批次失败只丢弃该批次, worker 继续运行。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use tracing::{info, warn};

use crate::detection::{
    detect_batch, AbortSlot, Detector, DetectorFactory, Frame, ProcessedFrame,
};
use crate::error::PipelineResult;
use crate::monitor::{should_log_drop, PerfHandle, Severity, StageCounters};

/// 连续失败多少次发出一次告警
pub const CONSECUTIVE_ERROR_WARNING: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// 组批时单次等待上限
    pub collect_timeout: Duration,
    /// 队列为空时的休眠
    pub idle_sleep: Duration,
    /// 写结果队列的等待上限, 超时即丢弃
    pub result_put_timeout: Duration,
    /// 连续失败达到该值时重建检测器
    pub max_consecutive_errors: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            collect_timeout: Duration::from_millis(10),
            idle_sleep: Duration::from_millis(10),
            result_put_timeout: Duration::from_millis(100),
            max_consecutive_errors: 5,
        }
    }
}

/// worker 入口配置 (启动时按值传入)
#[derive(Clone)]
pub struct InferenceWorkerConfig {
    pub worker_id: usize,
    pub settings: WorkerSettings,
    pub frame_rx: Receiver<Frame>,
    pub result_tx: Sender<ProcessedFrame>,
    pub factory: Arc<dyn DetectorFactory>,
    pub perf: PerfHandle,
    pub counters: Arc<StageCounters>,
    pub running: Arc<AtomicBool>,
    /// 关闭超时时由池触发
    pub abort: AbortSlot,
}

/// 单批次投递结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Healthy,
    /// 检测器重建失败, worker 退出
    Failed,
}

pub struct InferenceWorker {
    config: InferenceWorkerConfig,
    detector: Box<dyn Detector>,
    perf_stream: String,
    consecutive_errors: u32,
}

impl InferenceWorker {
    /// 加载检测器 (每个 worker 只在启动时加载一次)
    pub fn start(config: InferenceWorkerConfig) -> PipelineResult<Self> {
        let perf_stream = format!("inference-{}", config.worker_id);
        let start = Instant::now();
        let detector = config.factory.create(config.worker_id)?;
        config.perf.record(&perf_stream, "model_load", start.elapsed());
        config.abort.set(detector.abort_handle());
        info!(
            worker_id = config.worker_id,
            batch_size = config.settings.batch_size,
            "✅ Inference worker ready"
        );
        Ok(Self {
            config,
            detector,
            perf_stream,
            consecutive_errors: 0,
        })
    }

    /// 最多取 `batch_size` 帧; 某次等待超时 (队列空) 即返回已收集的部分
    pub fn collect_batch(&self) -> Vec<Frame> {
        let batch_size = self.config.settings.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match self.config.frame_rx.recv_timeout(self.config.settings.collect_timeout) {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }
        batch
    }

    /// 整批推理一次, 每个输入帧输出一个 `ProcessedFrame`
    pub fn handle_batch(&mut self, batch: Vec<Frame>) -> PipelineResult<BatchOutcome> {
        let detections = self.config.perf.measure(&self.perf_stream, "inference", || {
            detect_batch(self.detector.as_mut(), &batch)
        })?;

        let start = Instant::now();
        let mut outcome = BatchOutcome::default();
        for (frame, dets) in batch.into_iter().zip(detections) {
            let processed = ProcessedFrame::new(frame, dets);
            match self
                .config
                .result_tx
                .send_timeout(processed, self.config.settings.result_put_timeout)
            {
                Ok(()) => {
                    self.config.counters.add_processed(1);
                    outcome.delivered += 1;
                }
                Err(SendTimeoutError::Timeout(pf)) | Err(SendTimeoutError::Disconnected(pf)) => {
                    outcome.dropped += 1;
                    let total = self.config.counters.add_dropped(1);
                    if should_log_drop(total) {
                        self.config.perf.record_log(
                            Severity::Warning,
                            format!(
                                "{}: result queue full, dropped frame {} of stream {} ({} dropped)",
                                self.perf_stream,
                                pf.frame_id(),
                                pf.stream_id(),
                                total
                            ),
                        );
                    }
                }
            }
        }
        self.config.perf.record(&self.perf_stream, "post_processing", start.elapsed());
        Ok(outcome)
    }

    /// 处理一个批次并执行错误策略
    pub fn process(&mut self, batch: Vec<Frame>) -> WorkerHealth {
        let context = batch_context(&batch);
        let len = batch.len() as u64;
        match self.handle_batch(batch) {
            Ok(_) => {
                self.consecutive_errors = 0;
                WorkerHealth::Healthy
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.config.counters.add_dropped(len);
                self.config.perf.record_log(
                    Severity::Error,
                    format!("{}: batch failed [{}]: {}", self.perf_stream, context, e),
                );
                if self.consecutive_errors == CONSECUTIVE_ERROR_WARNING {
                    self.config.perf.record_log(
                        Severity::Warning,
                        format!(
                            "{}: {} consecutive inference errors",
                            self.perf_stream, self.consecutive_errors
                        ),
                    );
                }
                if self.consecutive_errors >= self.config.settings.max_consecutive_errors {
                    return self.restart_detector();
                }
                WorkerHealth::Healthy
            }
        }
    }

    /// 释放旧检测器并通过工厂重新加载
    fn restart_detector(&mut self) -> WorkerHealth {
        self.detector.release();
        let start = Instant::now();
        match self.config.factory.create(self.config.worker_id) {
            Ok(detector) => {
                self.config.abort.set(detector.abort_handle());
                self.detector = detector;
                self.consecutive_errors = 0;
                self.config.perf.record(&self.perf_stream, "model_load", start.elapsed());
                self.config.perf.record_log(
                    Severity::Warning,
                    format!("{}: detector restarted after repeated errors", self.perf_stream),
                );
                WorkerHealth::Healthy
            }
            Err(e) => {
                self.config.abort.set(None);
                self.config.perf.record_log(
                    Severity::Error,
                    format!(
                        "{}: detector restart failed, worker exiting: {}",
                        self.perf_stream, e
                    ),
                );
                WorkerHealth::Failed
            }
        }
    }

    /// 主循环, 直到停止信号或 worker 失效
    pub fn run(mut self) {
        let settings = self.config.settings.clone();
        while self.config.running.load(Ordering::Relaxed) {
            let start = Instant::now();
            let batch = self.collect_batch();
            if batch.is_empty() {
                thread::sleep(settings.idle_sleep);
                continue;
            }
            self.config.perf.record(&self.perf_stream, "batch_collection", start.elapsed());

            let had_errors = self.consecutive_errors;
            if self.process(batch) == WorkerHealth::Failed {
                warn!(worker_id = self.config.worker_id, "❌ Inference worker failed");
                break;
            }
            if self.consecutive_errors > had_errors {
                thread::sleep(settings.idle_sleep);
            }
        }
        self.config.abort.set(None);
        self.detector.release();
        info!(worker_id = self.config.worker_id, "🛑 Inference worker stopped");
    }
}

/// 错误日志里的批次上下文: `stream:frame_id,...`
fn batch_context(batch: &[Frame]) -> String {
    batch
        .iter()
        .map(|f| format!("{}:{}", f.stream_id, f.frame_id))
        .collect::<Vec<_>>()
        .join(",")
}
