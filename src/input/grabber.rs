//! 采集线程 (Frame Source Grabber)
//!
//! ```text
//! connect ─► grab ─► [队列满?] ─是─► dropped += 1 (跳过解码)
//!                        │否
//!                        ▼
//!                    retrieve ─► try_send ─► processed += 1 / dropped += 1
//! ```
//! 连续失败达到阈值或源报告断开时重建连接,两次连接之间有冷却时间。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, info, warn};

use super::{FrameSource, SourceConnector};
use crate::detection::{Frame, StreamId};
use crate::error::SourceError;
use crate::monitor::{should_log_drop, PerfHandle, StageCounters};

/// 关闭检查粒度
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct GrabberConfig {
    /// 单次失败后的重试间隔
    pub retry_delay: Duration,
    /// 连续失败多少次视为断线
    pub reconnect_after_failures: u32,
    /// 两次连接尝试之间的冷却时间
    pub reconnect_cooldown: Duration,
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            reconnect_after_failures: 30,
            reconnect_cooldown: Duration::from_millis(1000),
        }
    }
}

/// 单帧采集结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabOutcome {
    Enqueued,
    Dropped,
    /// 帧队列已关闭 (流水线正在退出)
    QueueClosed,
}

pub struct FrameGrabber {
    stream_id: StreamId,
    connector: Arc<dyn SourceConnector>,
    frame_tx: Sender<Frame>,
    counters: Arc<StageCounters>,
    perf: PerfHandle,
    running: Arc<AtomicBool>,
    config: GrabberConfig,
    next_frame_id: u64,
}

impl FrameGrabber {
    pub fn new(
        stream_id: StreamId,
        connector: Arc<dyn SourceConnector>,
        frame_tx: Sender<Frame>,
        counters: Arc<StageCounters>,
        perf: PerfHandle,
        running: Arc<AtomicBool>,
        config: GrabberConfig,
    ) -> Self {
        Self {
            stream_id,
            connector,
            frame_tx,
            counters,
            perf,
            running,
            config,
            next_frame_id: 0,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("grabber-{}", self.stream_id))
            .spawn(move || self.run())
    }

    /// 采集循环, 直到停止信号 / 源耗尽 / 帧队列关闭
    pub fn run(mut self) {
        info!(stream_id = %self.stream_id, "✅ Grabber started");
        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut failures: u32 = 0;

        while self.running.load(Ordering::Relaxed) {
            if source.is_none() {
                match self.connector.connect() {
                    Ok(s) => {
                        info!(stream_id = %self.stream_id, "🔗 Source connected");
                        source = Some(s);
                        failures = 0;
                    }
                    Err(e) => {
                        warn!(stream_id = %self.stream_id, error = %e, "source connect failed");
                        self.sleep_while_running(self.config.reconnect_cooldown);
                        continue;
                    }
                }
            }
            let Some(src) = source.as_mut() else {
                continue;
            };

            match self.grab_once(src.as_mut()) {
                Ok(GrabOutcome::QueueClosed) => break,
                Ok(_) => failures = 0,
                Err(SourceError::Exhausted) => {
                    info!(stream_id = %self.stream_id, "source exhausted");
                    break;
                }
                Err(SourceError::Disconnected) => {
                    warn!(stream_id = %self.stream_id, "🔌 Source disconnected, reconnecting");
                    source = None;
                    failures = 0;
                    self.sleep_while_running(self.config.reconnect_cooldown);
                }
                Err(e) => {
                    failures += 1;
                    debug!(stream_id = %self.stream_id, error = %e, failures, "grab failed");
                    if failures >= self.config.reconnect_after_failures {
                        warn!(
                            stream_id = %self.stream_id,
                            failures,
                            "🔌 Persistent grab failures, reconnecting"
                        );
                        source = None;
                        failures = 0;
                        self.sleep_while_running(self.config.reconnect_cooldown);
                    } else {
                        self.sleep_while_running(self.config.retry_delay);
                    }
                }
            }
        }
        info!(
            stream_id = %self.stream_id,
            processed = self.counters.processed(),
            dropped = self.counters.dropped(),
            "🛑 Grabber stopped"
        );
    }

    /// 抓取一帧并尝试入队; 每个成功抓取的帧要么入队, 要么计入丢帧
    pub fn grab_once(&mut self, source: &mut dyn FrameSource) -> Result<GrabOutcome, SourceError> {
        let start = Instant::now();
        source.grab()?;
        self.perf.record(&self.stream_id, "frame_grab", start.elapsed());

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        // 队列已满: 不解码, 直接丢弃
        if self.frame_tx.is_full() {
            self.count_drop(frame_id);
            return Ok(GrabOutcome::Dropped);
        }

        let start = Instant::now();
        let image = match source.retrieve() {
            Ok(image) => image,
            Err(e) => {
                self.count_drop(frame_id);
                return Err(e);
            }
        };
        self.perf.record(&self.stream_id, "frame_retrieve", start.elapsed());

        let frame = Frame::new(self.stream_id.clone(), frame_id, image);
        let start = Instant::now();
        let outcome = match self.frame_tx.try_send(frame) {
            Ok(()) => {
                self.counters.add_processed(1);
                GrabOutcome::Enqueued
            }
            Err(TrySendError::Full(_)) => {
                self.count_drop(frame_id);
                GrabOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.add_dropped(1);
                GrabOutcome::QueueClosed
            }
        };
        self.perf.record(&self.stream_id, "queue_put", start.elapsed());
        Ok(outcome)
    }

    fn count_drop(&self, frame_id: u64) {
        let total = self.counters.add_dropped(1);
        if should_log_drop(total) {
            warn!(
                stream_id = %self.stream_id,
                frame_id,
                dropped = total,
                "⚠️ Frame queue full, dropping frame"
            );
        }
    }

    fn sleep_while_running(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::perf_channel;
    use crossbeam_channel::bounded;
    use image::RgbImage;
    use std::sync::Mutex;

    /// 预设结果序列的测试源
    struct ScriptedSource {
        script: Arc<Mutex<Vec<Result<(), SourceError>>>>,
    }

    impl FrameSource for ScriptedSource {
        fn grab(&mut self) -> Result<(), SourceError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Err(SourceError::Exhausted)
            } else {
                script.remove(0)
            }
        }

        fn retrieve(&mut self) -> Result<RgbImage, SourceError> {
            Ok(RgbImage::new(4, 4))
        }
    }

    fn grabber(
        script: Vec<Result<(), SourceError>>,
        capacity: usize,
        config: GrabberConfig,
    ) -> (FrameGrabber, crossbeam_channel::Receiver<Frame>, Arc<StageCounters>, Arc<Mutex<usize>>) {
        let script = Arc::new(Mutex::new(script));
        let connects = Arc::new(Mutex::new(0usize));
        let connects_in = connects.clone();
        let connector = move || -> Result<Box<dyn FrameSource>, SourceError> {
            *connects_in.lock().unwrap() += 1;
            Ok(Box::new(ScriptedSource { script: script.clone() }))
        };
        let (tx, rx) = bounded(capacity);
        let counters = Arc::new(StageCounters::default());
        let (perf, _perf_rx) = perf_channel(1024);
        let g = FrameGrabber::new(
            Arc::from("cam1"),
            Arc::new(connector),
            tx,
            counters.clone(),
            perf,
            Arc::new(AtomicBool::new(true)),
            config,
        );
        (g, rx, counters, connects)
    }

    fn fast_config() -> GrabberConfig {
        GrabberConfig {
            retry_delay: Duration::from_millis(1),
            reconnect_after_failures: 3,
            reconnect_cooldown: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_every_grabbed_frame_is_enqueued_or_dropped() {
        let (g, rx, counters, _) = grabber(vec![Ok(()); 11], 5, fast_config());
        g.run();
        assert_eq!(rx.len(), 5);
        assert_eq!(counters.processed(), 5);
        assert_eq!(counters.dropped(), 6);

        let ids: Vec<u64> = rx.try_iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_transient_failures_trigger_reconnect() {
        let script = vec![
            Ok(()),
            Err(SourceError::Transient("timeout".into())),
            Err(SourceError::Transient("timeout".into())),
            Err(SourceError::Transient("timeout".into())),
            Ok(()),
        ];
        let (g, rx, counters, connects) = grabber(script, 10, fast_config());
        g.run();
        assert_eq!(*connects.lock().unwrap(), 2);
        assert_eq!(rx.len(), 2);
        assert_eq!(counters.dropped(), 0);
    }

    #[test]
    fn test_disconnect_reconnects_immediately() {
        let script = vec![Err(SourceError::Disconnected), Ok(())];
        let (g, rx, _, connects) = grabber(script, 10, fast_config());
        g.run();
        assert_eq!(*connects.lock().unwrap(), 2);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_stop_signal_ends_loop() {
        let (g, _rx, _, _) = grabber(vec![Ok(()); 3], 10, fast_config());
        g.running.store(false, Ordering::Relaxed);
        g.run();
    }

    #[test]
    fn test_closed_queue_ends_loop() {
        let (g, rx, counters, _) = grabber(vec![Ok(()); 100], 10, fast_config());
        drop(rx);
        g.run();
        assert_eq!(counters.processed(), 0);
        assert_eq!(counters.dropped(), 1);
    }
}
