/// 二级检测池 (Secondary Detection Pool Manager)
///
/// 动态伸缩的轻量 worker 线程, 每个 worker 一个专用输入通道:
/// ```text
/// submit ──► 空闲 worker (轮转) ──► crop ─► detect ─► results (Mutex)
///                                                        │
///                                 collect_results() ◄────┘
/// ```
/// - 扩容: 先加载检测器, 再注册 worker
/// - 缩容: 标记退役 → 等待空闲 → 发送 Stop → join → 删除记录
///   (`scale_bounded` 只等待有限时间, 仍忙碌的退役 worker 留到下次伸缩时回收)
pub mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, SendError, Sender};
use tracing::{error, info, warn};

use crate::detection::{DetectorFactory, ProcessedFrame};
use crate::error::PipelineResult;
use crate::monitor::{PerfHandle, StageCounters};

pub use worker::{crop_regions, WorkerMessage, WorkerState};
use worker::SecondaryWorker;

const IDLE_POLL: Duration = Duration::from_millis(5);

/// 退役中的 worker: (id, 状态, 输入通道, 线程句柄)
type Retiree = (usize, Arc<WorkerState>, Sender<WorkerMessage>, Option<JoinHandle<()>>);

#[derive(Debug, Clone)]
pub struct SecondaryPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// 需要二级检测的一级类别
    pub person_class: String,
}

impl Default for SecondaryPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            person_class: "person".to_string(),
        }
    }
}

/// 注册表中的一条 worker 记录
pub struct WorkerRecord {
    pub id: usize,
    handle: Option<JoinHandle<()>>,
    tx: Sender<WorkerMessage>,
    state: Arc<WorkerState>,
    retiring: bool,
}

impl WorkerRecord {
    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    pub fn last_active(&self) -> Instant {
        self.state.last_active()
    }

    fn is_available(&self) -> bool {
        !self.retiring && !self.state.is_processing()
    }
}

pub struct SecondaryPool {
    config: SecondaryPoolConfig,
    factory: Arc<dyn DetectorFactory>,
    perf: PerfHandle,
    counters: Arc<StageCounters>,
    workers: Mutex<BTreeMap<usize, WorkerRecord>>,
    results: Arc<Mutex<Vec<ProcessedFrame>>>,
    next_id: AtomicUsize,
    /// 上一次派发的 worker id
    cursor: AtomicUsize,
    scale_lock: Mutex<()>,
}

impl SecondaryPool {
    pub fn new(
        config: SecondaryPoolConfig,
        factory: Arc<dyn DetectorFactory>,
        perf: PerfHandle,
        counters: Arc<StageCounters>,
    ) -> Self {
        Self {
            config,
            factory,
            perf,
            counters,
            workers: Mutex::new(BTreeMap::new()),
            results: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicUsize::new(0),
            cursor: AtomicUsize::new(usize::MAX),
            scale_lock: Mutex::new(()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<usize, WorkerRecord>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn worker_count(&self) -> usize {
        self.registry().len()
    }

    /// 未退役的 worker 数量
    pub fn active_count(&self) -> usize {
        self.registry().values().filter(|r| !r.retiring).count()
    }

    /// 当前空闲 (可接收任务) 的 worker 数量
    pub fn idle_count(&self) -> usize {
        self.registry().values().filter(|r| r.is_available()).count()
    }

    /// 把 worker 数量调整到 `target` (先裁剪到 `[min_workers, max_workers]`),
    /// 返回调整后的数量。
    ///
    /// 缩容时等待被选中的忙碌 worker 完成当前批次。
    pub fn scale(&self, target: usize) -> usize {
        self.scale_within(target, None)
    }

    /// 同 [`SecondaryPool::scale`], 但等待忙碌 worker 最多 `wait`;
    /// 超时的 worker 保持退役标记 (不再接收任务), 返回未退役的 worker 数量
    pub fn scale_bounded(&self, target: usize, wait: Duration) -> usize {
        self.scale_within(target, Some(Instant::now() + wait))
    }

    fn scale_within(&self, target: usize, deadline: Option<Instant>) -> usize {
        let _guard = self.scale_lock.lock().unwrap_or_else(|e| e.into_inner());
        let max = self.config.max_workers.max(self.config.min_workers);
        let target = target.clamp(self.config.min_workers, max);
        self.reap_finished();
        // 先回收上次未完成的退役
        let pending = self.take_pending_retirees();
        self.retire(pending, deadline);
        let current = self.active_count();

        if target > current {
            for _ in current..target {
                if let Err(e) = self.spawn_worker() {
                    error!(error = %e, "❌ Failed to spawn secondary worker");
                    break;
                }
            }
        } else if target < current {
            let victims = self.select_for_removal(current - target);
            let deferred = self.retire(victims, deadline);
            if deferred > 0 {
                warn!(deferred, "secondary workers still busy, retirement deferred");
            }
        }

        let count = self.active_count();
        if count != current {
            info!(from = current, to = count, "🔧 Secondary pool scaled");
        }
        count
    }

    /// 创建 worker: 检测器在注册前加载完成
    fn spawn_worker(&self) -> PipelineResult<usize> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let perf_stream = format!("secondary-{}", id);

        let start = Instant::now();
        let detector = self.factory.create(id)?;
        self.perf.record(&perf_stream, "secondary_model_load", start.elapsed());

        let (tx, rx) = unbounded();
        let state = Arc::new(WorkerState::new());
        let worker = SecondaryWorker {
            id,
            detector,
            rx,
            state: state.clone(),
            results: self.results.clone(),
            perf: self.perf.clone(),
            counters: self.counters.clone(),
            person_class: self.config.person_class.clone(),
        };
        let handle = thread::Builder::new()
            .name(perf_stream)
            .spawn(move || worker.run())?;

        self.registry().insert(
            id,
            WorkerRecord {
                id,
                handle: Some(handle),
                tx,
                state,
                retiring: false,
            },
        );
        Ok(id)
    }

    /// 清理意外退出的 worker 线程
    fn reap_finished(&self) {
        let finished: Vec<WorkerRecord> = {
            let mut registry = self.registry();
            let ids: Vec<usize> = registry
                .values()
                .filter(|r| r.handle.as_ref().is_some_and(|h| h.is_finished()))
                .map(|r| r.id)
                .collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };
        for record in finished {
            warn!(worker_id = record.id, "secondary worker exited unexpectedly");
            if let Some(handle) = record.handle {
                let _ = handle.join();
            }
        }
    }

    /// 已标记退役但尚未回收的 worker (包括通道失效的记录)
    fn take_pending_retirees(&self) -> Vec<Retiree> {
        let mut registry = self.registry();
        registry
            .values_mut()
            .filter(|r| r.retiring && r.handle.is_some())
            .map(|r| (r.id, r.state.clone(), r.tx.clone(), r.handle.take()))
            .collect()
    }

    /// 选出要移除的 worker (空闲优先, 其次最久未活动), 并标记退役
    fn select_for_removal(&self, n: usize) -> Vec<Retiree> {
        let mut registry = self.registry();
        let mut candidates: Vec<(bool, Instant, usize)> = registry
            .values()
            .filter(|r| !r.retiring && r.handle.is_some())
            .map(|r| (r.is_processing(), r.last_active(), r.id))
            .collect();
        candidates.sort();

        candidates
            .into_iter()
            .take(n)
            .filter_map(|(_, _, id)| {
                let record = registry.get_mut(&id)?;
                record.retiring = true;
                Some((id, record.state.clone(), record.tx.clone(), record.handle.take()))
            })
            .collect()
    }

    /// 等待空闲 → Stop → join → 删除记录 (不持有注册表锁等待)。
    ///
    /// 超过 `deadline` 仍忙碌的 worker 交还句柄留待下次回收, 返回其数量。
    fn retire(&self, victims: Vec<Retiree>, deadline: Option<Instant>) -> usize {
        let mut deferred = 0;
        for (id, state, tx, handle) in victims {
            let busy = |h: &Option<JoinHandle<()>>| {
                state.is_processing() && !h.as_ref().map_or(true, |h| h.is_finished())
            };
            while busy(&handle) && deadline.map_or(true, |d| Instant::now() < d) {
                thread::sleep(IDLE_POLL);
            }
            if busy(&handle) {
                if let Some(record) = self.registry().get_mut(&id) {
                    record.handle = handle;
                }
                deferred += 1;
                continue;
            }
            let _ = tx.send(WorkerMessage::Stop);
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!(worker_id = id, "secondary worker panicked");
                }
            }
            self.registry().remove(&id);
        }
        deferred
    }

    /// 派发到一个空闲 worker (按 id 轮转); 没有空闲 worker 时原样退回批次
    pub fn submit(&self, frames: Vec<ProcessedFrame>) -> Result<usize, Vec<ProcessedFrame>> {
        let mut registry = self.registry();
        let last = self.cursor.load(Ordering::Relaxed);

        let chosen = registry
            .range(last.wrapping_add(1)..)
            .chain(registry.range(..))
            .find(|(_, r)| r.is_available())
            .map(|(id, _)| *id);
        let Some(id) = chosen else {
            return Err(frames);
        };
        let Some(record) = registry.get_mut(&id) else {
            return Err(frames);
        };

        record.state.mark_busy();
        match record.tx.send(WorkerMessage::Work(frames)) {
            Ok(()) => {
                self.cursor.store(id, Ordering::Relaxed);
                Ok(id)
            }
            Err(SendError(msg)) => {
                // worker 线程已退出
                record.state.mark_idle();
                record.retiring = true;
                warn!(worker_id = id, "secondary worker channel closed");
                match msg {
                    WorkerMessage::Work(frames) => Err(frames),
                    WorkerMessage::Stop => Err(Vec::new()),
                }
            }
        }
    }

    /// 取走并清空结果缓冲
    pub fn collect_results(&self) -> Vec<ProcessedFrame> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// 停止并移除所有 worker (各自释放检测器后返回)
    pub fn shutdown(&self) {
        let _guard = self.scale_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.reap_finished();
        let n = self.worker_count();
        if n == 0 {
            return;
        }
        let mut victims = self.take_pending_retirees();
        victims.extend(self.select_for_removal(n));
        self.retire(victims, None);
        info!(stopped = n, "🛑 Secondary pool shut down");
    }
}

impl Drop for SecondaryPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 自动伸缩: 有被拒绝的批次 +1, 本周期没有提交 -1, 否则保持
pub fn next_secondary_target(
    current: usize,
    submitted: u64,
    rejected: u64,
    min: usize,
    max: usize,
) -> usize {
    let target = if rejected > 0 {
        current + 1
    } else if submitted == 0 {
        current.saturating_sub(1)
    } else {
        current
    };
    target.clamp(min, max.max(min))
}
