/// 流水线协调器 (Pipeline Coordinator)
///
/// ```text
/// grabber-* ──► [frames] ──► inference-* ──► [results] ──► coordinator
///                                                              │
///                    ┌──────────── person ─────────────────────┤
///                    ▼                                         ▼
///            SecondaryPool ──► collect_results() ──► outputs.secondary
///                                                    outputs.primary
/// ```
/// 所有阶段的计时事件汇总到 PerformanceMonitor; 关闭顺序:
/// 停止信号 → 采集线程 → 清空帧队列并 join 推理线程 → 二级池
/// → 监控 (最后输出报告)
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::detection::{Detector, DetectorFactory, ProcessedFrame, StreamId};
use crate::error::{PipelineError, PipelineResult};
use crate::inference::BatchInferencePool;
use crate::input::{FrameGrabber, SourceConnector};
use crate::monitor::{
    should_log_drop, CounterRegistry, MonitorHandle, PerfHandle, PerformanceMonitor,
    PerformanceReport, StageCounters,
};
use crate::resources::{ResourceProbe, ResourceSizer, SystemProbe};
use crate::secondary::{next_secondary_target, SecondaryPool};

/// 结果队列单次等待上限
const RESULT_POLL: Duration = Duration::from_millis(100);
const JOIN_POLL: Duration = Duration::from_millis(10);
const COORDINATOR_STREAM: &str = "coordinator";
/// 自动缩容时等待忙碌二级 worker 的上限
const SCALE_WAIT: Duration = Duration::from_millis(50);

/// 下游消费者拿到的结果流
pub struct PipelineOutputs {
    /// 一级检测结果, 每个推理成功的帧一条
    pub primary: Receiver<ProcessedFrame>,
    /// 二级检测结果, 每个 ROI 一条
    pub secondary: Receiver<ProcessedFrame>,
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    connectors: BTreeMap<String, Arc<dyn SourceConnector>>,
    primary: Option<Arc<dyn DetectorFactory>>,
    secondary: Option<Arc<dyn DetectorFactory>>,
    probe: Arc<dyn ResourceProbe>,
    running: Arc<AtomicBool>,
    report_sink: Option<Sender<PerformanceReport>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            connectors: BTreeMap::new(),
            primary: None,
            secondary: None,
            probe: Arc::new(SystemProbe),
            running: Arc::new(AtomicBool::new(true)),
            report_sink: None,
        }
    }

    pub fn connector(
        mut self,
        stream_id: impl Into<String>,
        connector: Arc<dyn SourceConnector>,
    ) -> Self {
        self.connectors.insert(stream_id.into(), connector);
        self
    }

    pub fn primary_detector(mut self, factory: Arc<dyn DetectorFactory>) -> Self {
        self.primary = Some(factory);
        self
    }

    pub fn secondary_detector(mut self, factory: Arc<dyn DetectorFactory>) -> Self {
        self.secondary = Some(factory);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// 外部停止信号 (例如 Ctrl+C)
    pub fn stop_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn report_sink(mut self, tx: Sender<PerformanceReport>) -> Self {
        self.report_sink = Some(tx);
        self
    }

    /// 评估资源并启动所有阶段。
    ///
    /// 一级池一个 worker 都没有启动成功时返回 [`PipelineError::NoWorkers`]。
    pub fn start(self) -> PipelineResult<(Pipeline, PipelineOutputs)> {
        let config = self.config;
        config.validate()?;
        let primary = self
            .primary
            .ok_or_else(|| PipelineError::config("primary detector factory is required"))?;
        let secondary = self
            .secondary
            .ok_or_else(|| PipelineError::config("secondary detector factory is required"))?;
        if let Some(id) = config.streams.keys().find(|id| !self.connectors.contains_key(*id)) {
            return Err(PipelineError::config(format!("no source connector for stream '{}'", id)));
        }

        let (worker_count, batch_size) = size_primary_pool(&config, self.probe, primary.as_ref());
        info!(worker_count, batch_size, streams = config.streams.len(), "🚀 Starting pipeline");

        let counters = CounterRegistry::new();
        let mut monitor = PerformanceMonitor::new(config.log_interval(), counters.clone());
        if let Some(tx) = self.report_sink {
            monitor = monitor.with_report_sink(tx);
        }
        let perf = monitor.handle();
        let monitor = monitor.spawn()?;

        let (frame_tx, frame_rx) = bounded(config.frame_queue_capacity);
        let (result_tx, result_rx) = bounded(config.result_queue_capacity);
        let (primary_tx, primary_rx) = bounded(config.output_queue_capacity);
        let (secondary_tx, secondary_rx) = bounded(config.output_queue_capacity);

        let pool = BatchInferencePool::start(
            worker_count,
            config.worker_settings(batch_size),
            frame_rx,
            result_tx,
            primary,
            perf.clone(),
            counters.stage("inference"),
            self.running.clone(),
            config.shutdown_grace(),
        )?;

        let secondary_counters = counters.stage("secondary");
        let secondary = SecondaryPool::new(
            config.secondary_pool_config(),
            secondary,
            perf.clone(),
            secondary_counters.clone(),
        );
        let initial = secondary.scale(config.secondary.initial_workers);
        if initial == 0 {
            warn!("⚠️ No secondary worker could be started, person frames will be dropped");
        }

        let mut pipeline = Pipeline {
            running: self.running,
            grabbers: Vec::with_capacity(config.streams.len()),
            pool,
            secondary,
            monitor,
            perf: perf.clone(),
            result_rx,
            primary_tx,
            secondary_tx,
            output_counters: counters.stage("output"),
            secondary_counters,
            window: DispatchWindow::new(),
            results_closed: false,
            stopped: false,
            worker_count,
            batch_size,
            config,
        };

        // 启动失败时 pipeline 在 Drop 中按顺序关闭
        let grabber_config = pipeline.config.grabber_config();
        for (id, connector) in &self.connectors {
            if !pipeline.config.streams.contains_key(id) {
                continue;
            }
            let stream_id: StreamId = Arc::from(id.as_str());
            let grabber = FrameGrabber::new(
                stream_id,
                connector.clone(),
                frame_tx.clone(),
                counters.stage(&format!("grabber/{}", id)),
                perf.clone(),
                pipeline.running.clone(),
                grabber_config.clone(),
            );
            pipeline.grabbers.push((id.clone(), grabber.spawn()?));
        }

        let outputs = PipelineOutputs {
            primary: primary_rx,
            secondary: secondary_rx,
        };
        Ok((pipeline, outputs))
    }
}

/// 一个自动伸缩周期内的派发统计
#[derive(Debug, Clone, Copy)]
struct DispatchWindow {
    submitted: u64,
    rejected: u64,
    started: Instant,
}

impl DispatchWindow {
    fn new() -> Self {
        Self {
            submitted: 0,
            rejected: 0,
            started: Instant::now(),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    running: Arc<AtomicBool>,
    grabbers: Vec<(String, JoinHandle<()>)>,
    pool: BatchInferencePool,
    secondary: SecondaryPool,
    monitor: MonitorHandle,
    perf: PerfHandle,
    result_rx: Receiver<ProcessedFrame>,
    primary_tx: Sender<ProcessedFrame>,
    secondary_tx: Sender<ProcessedFrame>,
    output_counters: Arc<StageCounters>,
    secondary_counters: Arc<StageCounters>,
    window: DispatchWindow,
    results_closed: bool,
    stopped: bool,
    worker_count: usize,
    batch_size: usize,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn secondary(&self) -> &SecondaryPool {
        &self.secondary
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// 主循环: 直到停止信号被清除, 然后按顺序关闭
    pub fn run(&mut self) {
        while self.is_running() {
            self.step(RESULT_POLL);
        }
        self.shutdown();
    }

    /// 处理一轮结果 (最多等待 `timeout`), 返回取出的一级结果数量
    pub fn step(&mut self, timeout: Duration) -> usize {
        let mut drained = Vec::new();
        match self.result_rx.recv_timeout(timeout) {
            Ok(first) => {
                drained.push(first);
                drained.extend(self.result_rx.try_iter().take(self.config.result_queue_capacity));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if !self.results_closed {
                    error!("❌ All inference workers exited, result queue closed");
                    self.results_closed = true;
                }
                thread::sleep(timeout);
            }
        }

        let count = drained.len();
        let person_class = &self.config.secondary.person_class;
        let persons: Vec<ProcessedFrame> = drained
            .iter()
            .filter(|f| f.contains_class(person_class))
            .cloned()
            .collect();
        for frame in drained {
            self.forward(&self.primary_tx, frame);
        }
        if !persons.is_empty() {
            self.dispatch(persons);
        }
        for frame in self.secondary.collect_results() {
            self.forward(&self.secondary_tx, frame);
        }
        self.autoscale();
        count
    }

    fn forward(&self, tx: &Sender<ProcessedFrame>, frame: ProcessedFrame) {
        match tx.try_send(frame) {
            Ok(()) => {
                self.output_counters.add_processed(1);
            }
            Err(TrySendError::Full(frame)) => {
                let total = self.output_counters.add_dropped(1);
                if should_log_drop(total) {
                    warn!(
                        stream_id = %frame.stream_id(),
                        frame_id = frame.frame_id(),
                        dropped_total = total,
                        "output queue full, dropping result"
                    );
                }
            }
            // 没有下游消费者
            Err(TrySendError::Disconnected(_)) => {
                self.output_counters.add_dropped(1);
            }
        }
    }

    fn dispatch(&mut self, frames: Vec<ProcessedFrame>) {
        let start = Instant::now();
        let result = self.secondary.submit(frames);
        self.perf.record(COORDINATOR_STREAM, "secondary_dispatch", start.elapsed());

        match result {
            Ok(worker_id) => {
                self.window.submitted += 1;
                debug!(worker_id, "person batch dispatched");
            }
            Err(rejected) => {
                self.window.rejected += 1;
                let total = self.secondary_counters.add_dropped(rejected.len() as u64);
                if should_log_drop(total) {
                    warn!(dropped_total = total, "no idle secondary worker, person batch dropped");
                }
            }
        }
    }

    /// 每个报告周期调整一次二级池规模
    fn autoscale(&mut self) {
        if self.window.started.elapsed() < self.config.log_interval() {
            return;
        }
        let window = std::mem::replace(&mut self.window, DispatchWindow::new());
        let current = self.secondary.active_count();
        let bounds = &self.config.secondary;
        let target = next_secondary_target(
            current,
            window.submitted,
            window.rejected,
            bounds.min_workers,
            bounds.max_workers,
        );
        if target != current {
            info!(
                current,
                target,
                submitted = window.submitted,
                rejected = window.rejected,
                idle = self.secondary.idle_count(),
                "🔧 Autoscaling secondary pool"
            );
            self.secondary.scale_bounded(target, SCALE_WAIT);
        }
    }

    /// 按顺序关闭所有阶段 (可重复调用)
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("🛑 Shutting down pipeline");
        self.running.store(false, Ordering::SeqCst);

        self.join_grabbers();
        self.pool.stop();

        // 已完成推理的结果仍交给下游
        let pending: Vec<ProcessedFrame> = self.result_rx.try_iter().collect();
        for frame in pending {
            self.forward(&self.primary_tx, frame);
        }

        self.secondary.shutdown();
        for frame in self.secondary.collect_results() {
            self.forward(&self.secondary_tx, frame);
        }

        self.monitor.stop();
        info!("✅ Pipeline stopped");
    }

    fn join_grabbers(&mut self) {
        let deadline = Instant::now() + self.config.shutdown_grace();
        for (stream_id, handle) in self.grabbers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !handle.is_finished() {
                warn!(stream_id = %stream_id, "grabber did not exit in time, detaching");
            } else if handle.join().is_err() {
                error!(stream_id = %stream_id, "grabber thread panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 一级池规模: 配置中的固定值优先, 否则由 ResourceSizer 推荐。
///
/// 需要测算批大小且有加速器时, 用一个临时检测器做显存校准,
/// 用完即释放。
pub fn size_primary_pool(
    config: &PipelineConfig,
    probe: Arc<dyn ResourceProbe>,
    factory: &dyn DetectorFactory,
) -> (usize, usize) {
    let has_accelerator = probe.accelerator_memory().is_ok();
    let sizer = ResourceSizer::new(probe);
    let workers = match config.primary_workers {
        Some(n) => n,
        None => sizer.recommended_worker_count(config.reserved_cores, config.max_primary_workers),
    };
    if let Some(batch) = config.batch_size {
        return (workers, batch);
    }

    let mut sampler = if has_accelerator {
        factory
            .create(0)
            .map_err(|e| warn!(error = %e, "calibration detector unavailable"))
            .ok()
    } else {
        None
    };
    let batch = match sampler.as_mut() {
        Some(det) => {
            let det: &mut dyn Detector = &mut **det;
            sizer.recommended_batch_size(
                config.memory_fraction,
                workers,
                config.min_batch,
                config.max_batch,
                Some(det),
            )
        }
        None => sizer.recommended_batch_size(
            config.memory_fraction,
            workers,
            config.min_batch,
            config.max_batch,
            None,
        ),
    };
    if let Some(mut det) = sampler {
        det.release();
    }
    (workers, batch)
}

/// 按流记录已接受的最新 frame_id, 过滤掉乱序到达的旧结果
#[derive(Debug, Default)]
pub struct FreshnessFilter {
    latest: HashMap<StreamId, u64>,
}

impl FreshnessFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 比该流已接受的帧更新时返回 true 并记录
    pub fn accept(&mut self, frame: &ProcessedFrame) -> bool {
        match self.latest.get(frame.stream_id()) {
            Some(&latest) if frame.frame_id() <= latest => false,
            _ => {
                self.latest.insert(frame.stream_id().clone(), frame.frame_id());
                true
            }
        }
    }

    pub fn latest(&self, stream_id: &str) -> Option<u64> {
        self.latest.get(stream_id).copied()
    }
}

/// 下游消费统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub accepted: u64,
    pub stale: u64,
    pub regions: u64,
    pub reports: u64,
}

/// 已关闭的通道换成 `never()`, select 不会在断开的通道上空转
fn open_or_never<T>(rx: Option<&Receiver<T>>, open: bool) -> Receiver<T> {
    match rx {
        Some(rx) if open => rx.clone(),
        _ => never(),
    }
}

/// 消费流水线输出直到一级结果通道关闭:
/// 过滤过期帧, 每个报告交给 `on_report`
pub fn consume_outputs(
    outputs: PipelineOutputs,
    reports: Option<Receiver<PerformanceReport>>,
    mut on_report: impl FnMut(&PerformanceReport),
) -> ConsumerStats {
    let PipelineOutputs { primary, secondary } = outputs;
    let mut freshness = FreshnessFilter::new();
    let mut stats = ConsumerStats::default();
    let mut secondary_open = true;
    let mut reports_open = reports.is_some();

    loop {
        let secondary_rx = open_or_never(Some(&secondary), secondary_open);
        let report_rx = open_or_never(reports.as_ref(), reports_open);
        select! {
            recv(primary) -> msg => match msg {
                Ok(frame) => {
                    if freshness.accept(&frame) {
                        stats.accepted += 1;
                        debug!(
                            stream_id = %frame.stream_id(),
                            frame_id = frame.frame_id(),
                            detections = frame.detections.len(),
                            "frame"
                        );
                    } else {
                        stats.stale += 1;
                    }
                }
                Err(_) => break,
            },
            recv(secondary_rx) -> msg => match msg {
                Ok(region) => {
                    stats.regions += 1;
                    debug!(
                        stream_id = %region.stream_id(),
                        frame_id = region.frame_id(),
                        detections = region.detections.len(),
                        "person region"
                    );
                }
                Err(_) => secondary_open = false,
            },
            recv(report_rx) -> msg => match msg {
                Ok(report) => {
                    stats.reports += 1;
                    on_report(&report);
                }
                // 监控线程已停止
                Err(_) => reports_open = false,
            },
        }
    }

    // 监控线程退出前会输出最终报告
    if let Some(reports) = &reports {
        for report in reports.iter() {
            stats.reports += 1;
            on_report(&report);
        }
    }
    info!(
        accepted = stats.accepted,
        stale = stats.stale,
        regions = stats.regions,
        "📊 Result consumer finished"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Frame};
    use crate::resources::AcceleratorMemory;
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;

    fn processed(stream: &str, frame_id: u64) -> ProcessedFrame {
        let frame = Frame::new(Arc::from(stream), frame_id, RgbImage::new(2, 2));
        ProcessedFrame::new(frame, Vec::new())
    }

    fn empty_report() -> PerformanceReport {
        PerformanceReport {
            generated_at: chrono::Utc::now(),
            window_ms: 0,
            streams: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    #[test]
    fn test_open_or_never_hides_closed_channel() {
        let (tx, rx) = bounded::<u32>(1);
        drop(tx);
        assert_eq!(
            open_or_never(Some(&rx), true).recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Disconnected)
        );
        assert_eq!(
            open_or_never(Some(&rx), false).recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        );
        assert_eq!(
            open_or_never::<u32>(None, true).recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn test_consume_outputs_after_monitor_stops() {
        let (primary_tx, primary) = bounded(8);
        let (secondary_tx, secondary) = bounded(8);
        let (report_tx, report_rx) = bounded(4);
        report_tx.send(empty_report()).unwrap();
        drop(report_tx);
        secondary_tx.send(processed("cam1", 1)).unwrap();
        drop(secondary_tx);

        // 报告通道关闭后一级结果仍陆续到达
        let producer = thread::spawn(move || {
            for id in [1, 3, 2] {
                thread::sleep(Duration::from_millis(20));
                primary_tx.send(processed("cam1", id)).unwrap();
            }
        });
        let mut seen = 0;
        let stats = consume_outputs(PipelineOutputs { primary, secondary }, Some(report_rx), |_| {
            seen += 1
        });
        producer.join().unwrap();

        assert_eq!(seen, 1);
        assert_eq!(
            stats,
            ConsumerStats {
                accepted: 2,
                stale: 1,
                regions: 1,
                reports: 1,
            }
        );
    }

    #[test]
    fn test_freshness_filter_per_stream() {
        let mut filter = FreshnessFilter::new();
        assert!(filter.accept(&processed("a", 5)));
        assert!(!filter.accept(&processed("a", 3)));
        assert!(!filter.accept(&processed("a", 5)));
        assert!(filter.accept(&processed("b", 1)));
        assert!(filter.accept(&processed("a", 6)));
        assert_eq!(filter.latest("a"), Some(6));
        assert_eq!(filter.latest("b"), Some(1));
        assert_eq!(filter.latest("c"), None);
    }

    struct FixedProbe {
        cores: usize,
        memory: Option<AcceleratorMemory>,
    }

    impl ResourceProbe for FixedProbe {
        fn cpu_core_count(&self) -> usize {
            self.cores
        }

        fn accelerator_memory(&self) -> PipelineResult<AcceleratorMemory> {
            self.memory.ok_or_else(|| PipelineError::probe("no accelerator"))
        }
    }

    struct NullDetector;

    impl Detector for NullDetector {
        fn detect(&mut self, frames: &[Frame]) -> PipelineResult<Vec<Vec<BBox>>> {
            Ok(vec![Vec::new(); frames.len()])
        }
    }

    fn counting_factory(created: Arc<AtomicUsize>) -> impl DetectorFactory {
        move |_id: usize| -> PipelineResult<Box<dyn Detector>> {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullDetector))
        }
    }

    #[test]
    fn test_size_primary_pool_without_accelerator() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(created.clone());
        let probe = Arc::new(FixedProbe { cores: 16, memory: None });

        let (workers, batch) = size_primary_pool(&PipelineConfig::default(), probe, &factory);
        assert_eq!(workers, 2);
        assert_eq!(batch, 1);
        // 没有加速器时不加载校准检测器
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_size_primary_pool_uses_fixed_overrides() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(created.clone());
        let probe = Arc::new(FixedProbe {
            cores: 2,
            memory: Some(AcceleratorMemory { total_mb: 24000, used_mb: 0 }),
        });
        let config = PipelineConfig {
            batch_size: Some(6),
            primary_workers: Some(3),
            ..Default::default()
        };

        assert_eq!(size_primary_pool(&config, probe, &factory), (3, 6));
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_size_primary_pool_calibrates_with_accelerator() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(created.clone());
        // used_mb 不变 → 使用默认单张成本 500MB
        let probe = Arc::new(FixedProbe {
            cores: 8,
            memory: Some(AcceleratorMemory { total_mb: 10000, used_mb: 0 }),
        });

        let (workers, batch) = size_primary_pool(&PipelineConfig::default(), probe, &factory);
        assert_eq!(workers, 2);
        // 10000 * 0.6 / 2 / 500 = 6
        assert_eq!(batch, 6);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
