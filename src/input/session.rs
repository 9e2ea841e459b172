//! 后台解码会话的生命周期
//!
//! 网络源的解码会话运行在独立线程中。`SessionGuard` 被 drop 时中止会话并在
//! 宽限期内等待线程退出, 保证重连前旧连接已经关闭。
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::warn;

/// 监督线程检查会话状态的间隔
const SESSION_POLL: Duration = Duration::from_millis(100);

const JOIN_POLL: Duration = Duration::from_millis(10);

pub struct SessionGuard {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    grace: Duration,
}

impl SessionGuard {
    /// 在命名线程中监督 `session`:
    /// 会话自行结束, 或 guard 被 drop 时调用 `abort`, 最后由 `finish` 回收会话。
    pub fn spawn<S, E, A, F>(
        name: impl Into<String>,
        session: S,
        is_ended: E,
        abort: A,
        finish: F,
        grace: Duration,
    ) -> std::io::Result<Self>
    where
        S: Send + 'static,
        E: Fn(&S) -> bool + Send + 'static,
        A: FnOnce(&S) + Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                match stop_rx.recv_timeout(SESSION_POLL) {
                    Err(RecvTimeoutError::Timeout) => {
                        if is_ended(&session) {
                            break;
                        }
                    }
                    // guard 已释放
                    _ => {
                        abort(&session);
                        break;
                    }
                }
            }
            finish(session);
        })?;
        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            grace,
        })
    }

    /// 会话已结束 (监督线程已退出)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + self.grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!(session = %self.name, "session did not close in time, detaching");
        }
    }
}
