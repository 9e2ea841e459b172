/// FFmpeg 网络视频源 (RTSP / UDP / HTTP ...)
/// FFmpeg network source: a decode thread feeds a small bounded channel,
/// the grabber pulls from it through the `FrameSource` interface.
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use tracing::{info, warn};

use super::{FrameSource, SessionGuard, SourceConnector};
use crate::error::SourceError;

/// 解码线程与采集线程之间的缓冲 (只保留最新几帧)
const DECODED_BUFFER: usize = 2;

/// 超过该时间没有新帧视为一次抓取失败
const GRAB_TIMEOUT: Duration = Duration::from_secs(5);

/// 断开时等待 FFmpeg 会话关闭的上限
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// 解码过滤器: YUV420P → RGB, 推送到采集线程
struct RgbForwardFilter {
    tx: Sender<RgbImage>,
    decoded: u64,
    skipped: u64,
}

impl FrameFilter for RgbForwardFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.skipped += 1;
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as usize;
            let h = (*frame.as_ptr()).height as usize;
            let y_plane = (*frame.as_ptr()).data[0];
            let u_plane = (*frame.as_ptr()).data[1];
            let v_plane = (*frame.as_ptr()).data[2];
            let y_stride = (*frame.as_ptr()).linesize[0] as usize;
            let uv_stride = (*frame.as_ptr()).linesize[1] as usize;

            if w == 0 || h == 0 || y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                self.skipped += 1;
                return Ok(None);
            }
            if y_stride < w || uv_stride < w / 2 {
                self.skipped += 1;
                return Ok(None);
            }

            let mut rgb = vec![0u8; w * h * 3];
            yuv420p_to_rgb(y_plane, u_plane, v_plane, y_stride, uv_stride, &mut rgb, w, h);
            let Some(image) = RgbImage::from_raw(w as u32, h as u32, rgb) else {
                self.skipped += 1;
                return Ok(None);
            };

            self.decoded += 1;
            match self.tx.try_send(image) {
                // 采集线程来不及取: 丢弃最新帧
                // 由采集侧的队列策略决定延迟
                Ok(()) | Err(TrySendError::Full(_)) => Ok(Some(frame)),
                // 采集侧已断开, 结束解码
                Err(TrySendError::Disconnected(_)) => Err("frame source closed".to_string()),
            }
        }
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!(decoded = self.decoded, skipped = self.skipped, "decode filter closed");
    }
}

/// BT.601 整数近似 (YUV420P → RGB24)
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;
        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            let g = y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7);
            buffer[out + 1] = g.clamp(0, 255) as u8;
            buffer[out + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out += 3;
        }
    }
}

/// 一次连接 = 一个 FFmpeg 会话; drop 时中止会话
pub struct FfmpegSource {
    rx: Receiver<RgbImage>,
    pending: Option<RgbImage>,
    session: SessionGuard,
}

impl FrameSource for FfmpegSource {
    fn grab(&mut self) -> Result<(), SourceError> {
        match self.rx.recv_timeout(GRAB_TIMEOUT) {
            Ok(image) => {
                self.pending = Some(image);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) if self.session.is_finished() => {
                Err(SourceError::Disconnected)
            }
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Transient(format!(
                "no frame within {:?}",
                GRAB_TIMEOUT
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Disconnected),
        }
    }

    fn retrieve(&mut self) -> Result<RgbImage, SourceError> {
        self.pending
            .take()
            .ok_or_else(|| SourceError::Transient("retrieve called before grab".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegConnector {
    pub url: String,
}

impl FfmpegConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// 网络流地址 (其余按本地目录处理)
    pub fn handles(address: &str) -> bool {
        ["rtsp://", "rtmp://", "udp://", "tcp://", "http://", "https://"]
            .iter()
            .any(|scheme| address.starts_with(scheme))
    }
}

impl SourceConnector for FfmpegConnector {
    fn connect(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        let (tx, rx) = bounded(DECODED_BUFFER);
        let filter = RgbForwardFilter {
            tx,
            decoded: 0,
            skipped: 0,
        };

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("rgb_forward", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let input = if self.url.starts_with("rtsp://") {
            Input::new(self.url.clone()).set_input_opts(
                [("rtsp_transport", "tcp"), ("rtsp_flags", "prefer_tcp")].into(),
            )
        } else {
            Input::new(self.url.clone())
        };

        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_desc("format=yuv420p")
            .output(out)
            .build()
            .map_err(|e| SourceError::Transient(format!("ffmpeg build: {}", e)))?;
        let sch = ctx
            .start()
            .map_err(|e| SourceError::Transient(format!("ffmpeg start: {}", e)))?;

        let url = self.url.clone();
        info!(url = %url, "📺 FFmpeg decode started");
        let session = SessionGuard::spawn(
            "ffmpeg-decode",
            sch,
            |sch| sch.is_ended(),
            |sch| sch.abort(),
            move |sch| {
                if let Err(e) = sch.wait() {
                    warn!(url = %url, error = %e, "FFmpeg decode ended with error");
                }
            },
            TEARDOWN_GRACE,
        )
        .map_err(|e| SourceError::Transient(format!("spawn decode thread: {}", e)))?;

        Ok(Box::new(FfmpegSource {
            rx,
            pending: None,
            session,
        }))
    }
}
