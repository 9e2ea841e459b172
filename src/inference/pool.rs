//! 一级推理池: 固定数量的命名线程, 启动后不再伸缩
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info, warn};

use super::worker::{InferenceWorker, InferenceWorkerConfig, WorkerSettings};
use crate::detection::{AbortSlot, DetectorFactory, Frame, ProcessedFrame};
use crate::error::{PipelineError, PipelineResult};
use crate::monitor::{PerfHandle, StageCounters};

const JOIN_POLL: Duration = Duration::from_millis(10);

type ReadySender = Sender<(usize, Result<(), String>)>;

struct PoolWorker {
    worker_id: usize,
    handle: JoinHandle<()>,
    abort: AbortSlot,
}

pub struct BatchInferencePool {
    workers: Vec<PoolWorker>,
    running: Arc<AtomicBool>,
    frame_rx: Receiver<Frame>,
    counters: Arc<StageCounters>,
    grace: Duration,
}

impl BatchInferencePool {
    /// 启动 `worker_count` 个 worker 并等待各自加载检测器。
    ///
    /// 加载失败的 worker 直接退出;
    /// 一个都没有启动成功时返回 [`PipelineError::NoWorkers`]。
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        worker_count: usize,
        settings: WorkerSettings,
        frame_rx: Receiver<Frame>,
        result_tx: Sender<ProcessedFrame>,
        factory: Arc<dyn DetectorFactory>,
        perf: PerfHandle,
        counters: Arc<StageCounters>,
        running: Arc<AtomicBool>,
        grace: Duration,
    ) -> PipelineResult<Self> {
        let (ready_tx, ready_rx) = bounded::<(usize, Result<(), String>)>(worker_count.max(1));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let config = InferenceWorkerConfig {
                worker_id,
                settings: settings.clone(),
                frame_rx: frame_rx.clone(),
                result_tx: result_tx.clone(),
                factory: factory.clone(),
                perf: perf.clone(),
                counters: counters.clone(),
                running: running.clone(),
                abort: AbortSlot::default(),
            };
            match spawn_worker(config, ready_tx.clone()) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!(worker_id, error = %e, "❌ Failed to spawn inference worker");
                    abandon(&running, workers);
                    return Err(e.into());
                }
            }
        }
        drop(ready_tx);

        let mut ready = 0;
        let mut failed = Vec::new();
        for _ in 0..worker_count {
            match ready_rx.recv() {
                Ok((_, Ok(()))) => ready += 1,
                Ok((worker_id, Err(e))) => {
                    error!(worker_id, error = %e, "❌ Inference worker failed to load detector");
                    failed.push(worker_id);
                }
                // 剩余 worker 在上报前已退出
                Err(_) => break,
            }
        }

        // 加载失败的线程上报后立即退出
        let (workers, dead): (Vec<_>, Vec<_>) = workers
            .into_iter()
            .partition(|w| !failed.contains(&w.worker_id));
        for w in dead {
            let _ = w.handle.join();
        }

        let mut pool = Self {
            workers,
            running,
            frame_rx,
            counters,
            grace,
        };

        if ready == 0 {
            pool.stop();
            return Err(PipelineError::NoWorkers);
        }
        if ready < worker_count {
            warn!(
                ready,
                requested = worker_count,
                "⚠️ Inference pool running with reduced capacity"
            );
        } else {
            info!(workers = ready, batch_size = settings.batch_size, "✅ Inference pool started");
        }
        Ok(pool)
    }

    /// 仍在运行的 worker 数量
    pub fn alive_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.handle.is_finished()).count()
    }

    /// 协作式关闭: 清除运行标志 → 清空帧队列 → 宽限期内 join。
    ///
    /// 宽限期后仍未退出的 worker 会被中断当前推理, 再给一个宽限期;
    /// 仍未退出的线程 (检测器不支持中断) 被分离。
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.running.store(false, Ordering::Relaxed);

        let drained = self.frame_rx.try_iter().count() as u64;
        if drained > 0 {
            self.counters.add_dropped(drained);
            info!(drained, "frame queue drained on shutdown");
        }

        let deadline = Instant::now() + self.grace;
        let mut stragglers = Vec::new();
        for worker in self.workers.drain(..) {
            wait_until(&worker.handle, deadline);
            if worker.handle.is_finished() {
                join_worker(worker);
            } else {
                stragglers.push(worker);
            }
        }
        if stragglers.is_empty() {
            return;
        }

        for worker in &stragglers {
            let aborted = worker.abort.abort();
            warn!(
                worker_id = worker.worker_id,
                grace_ms = self.grace.as_millis() as u64,
                aborted,
                "inference worker did not exit in time, aborting inference"
            );
        }
        let deadline = Instant::now() + self.grace;
        for worker in stragglers {
            wait_until(&worker.handle, deadline);
            if worker.handle.is_finished() {
                join_worker(worker);
            } else {
                error!(worker_id = worker.worker_id, "inference worker still running, detaching");
            }
        }
    }
}

impl Drop for BatchInferencePool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(config: InferenceWorkerConfig, ready: ReadySender) -> std::io::Result<PoolWorker> {
    let worker_id = config.worker_id;
    let abort = config.abort.clone();
    let handle = thread::Builder::new()
        .name(format!("inference-{}", worker_id))
        .spawn(move || worker_main(config, ready))?;
    Ok(PoolWorker {
        worker_id,
        handle,
        abort,
    })
}

/// 启动中途失败: 通知已启动的 worker 退出并等待
fn abandon(running: &AtomicBool, workers: Vec<PoolWorker>) {
    running.store(false, Ordering::Relaxed);
    for worker in workers {
        join_worker(worker);
    }
}

fn wait_until(handle: &JoinHandle<()>, deadline: Instant) {
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(JOIN_POLL);
    }
}

fn join_worker(worker: PoolWorker) {
    if worker.handle.join().is_err() {
        error!(worker_id = worker.worker_id, "inference worker panicked");
    }
}

fn worker_main(config: InferenceWorkerConfig, ready: ReadySender) {
    let worker_id = config.worker_id;
    match InferenceWorker::start(config) {
        Ok(worker) => {
            let _ = ready.send((worker_id, Ok(())));
            drop(ready);
            worker.run();
        }
        Err(e) => {
            let _ = ready.send((worker_id, Err(e.to_string())));
        }
    }
}
