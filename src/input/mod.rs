/// 视频输入系统 (Video Input System)
///
/// 每路流一个采集线程,负责抓帧、解码并非阻塞写入共享帧队列
/// - FrameSource:     单路视频源 (grab / retrieve 两步)
/// - SourceConnector: 建立 / 重建连接
/// - FrameGrabber:    采集循环 (计时 / 丢帧计数 / 断线重连)
/// - ImageDirSource:  图片目录源 (离线运行)
/// - FfmpegSource:    RTSP/UDP 等网络流 (ffmpeg 功能)
/// - SessionGuard:    后台解码会话, 断开时中止
pub mod grabber;
pub mod image_dir;
pub mod session;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use image::RgbImage;

use crate::error::SourceError;

pub use grabber::{FrameGrabber, GrabOutcome, GrabberConfig};
pub use image_dir::{ImageDirConnector, ImageDirSource};
pub use session::SessionGuard;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegConnector, FfmpegSource};

/// 单路视频源
///
/// `grab` 只推进到下一帧, `retrieve` 才解码; 队列已满时采集线程跳过解码。
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<(), SourceError>;

    fn retrieve(&mut self) -> Result<RgbImage, SourceError>;
}

/// 视频源连接器 (断线后由采集线程重新调用)
pub trait SourceConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn FrameSource>, SourceError>;
}

impl<F> SourceConnector for F
where
    F: Fn() -> Result<Box<dyn FrameSource>, SourceError> + Send + Sync,
{
    fn connect(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        self()
    }
}
