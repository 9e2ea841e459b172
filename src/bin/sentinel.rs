/// 数字卫兵 (Digital Sentinel)
///
/// 多路视频批量检测服务
///
/// 系统架构:
/// 1. 采集线程: 每路流一个, 抓帧后非阻塞写入帧队列
/// 2. 推理线程: 一级 YOLOv8 批量检测 (数量由资源评估决定)
/// 3. 二级线程: 对人体区域做二级检测 (动态伸缩)
/// 4. 主线程:   结果分发与二级池自动伸缩
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::bounded;
use mimalloc::MiMalloc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_rs::detection::onnx::{OnnxDetector, OnnxDetectorConfig};
use sentinel_rs::input::ImageDirConnector;
use sentinel_rs::{
    consume_outputs, Args, Detector, DetectorFactory, Pipeline, PipelineResult, PerformanceReport,
    SourceConnector,
};

#[cfg(feature = "ffmpeg")]
use sentinel_rs::input::FfmpegConnector;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 离线图片目录的播放间隔 (约 25 FPS)
const IMAGE_DIR_FRAME_INTERVAL: Duration = Duration::from_millis(40);

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sentinel_rs=info,sentinel=info,ort=warn"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_thread_names(true))
            .with(env_filter)
            .init();
    }
}

fn detector_factory(model_path: &str) -> Arc<dyn DetectorFactory> {
    let config = OnnxDetectorConfig {
        model_path: model_path.to_string(),
        ..Default::default()
    };
    Arc::new(move |_worker_id: usize| -> PipelineResult<Box<dyn Detector>> {
        Ok(Box::new(OnnxDetector::new(config.clone())?))
    })
}

/// 网络地址走 FFmpeg, 其余按图片目录处理
fn connector_for(address: &str) -> Arc<dyn SourceConnector> {
    #[cfg(feature = "ffmpeg")]
    {
        if FfmpegConnector::handles(address) {
            return Arc::new(FfmpegConnector::new(address));
        }
    }
    Arc::new(ImageDirConnector {
        frame_interval: Some(IMAGE_DIR_FRAME_INTERVAL),
        ..ImageDirConnector::new(address)
    })
}

fn print_report(report: &PerformanceReport) {
    match serde_json::to_string(report) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "failed to serialize report"),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_json = args.log_json
        || std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
    init_tracing(log_json);

    let config = args.load_config().context("invalid configuration")?;
    info!("🚀 数字卫兵系统启动");
    info!(
        primary_model = %config.primary_model,
        secondary_model = %config.secondary_model,
        "📦 Models"
    );
    for (id, address) in &config.streams {
        info!(stream_id = %id, address = %address, "📹 Stream");
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    let mut builder = Pipeline::builder(config.clone())
        .primary_detector(detector_factory(&config.primary_model))
        .secondary_detector(detector_factory(&config.secondary_model))
        .stop_flag(running);
    for (id, address) in &config.streams {
        builder = builder.connector(id.clone(), connector_for(address));
    }
    let reports = if args.report_json {
        let (tx, rx) = bounded(16);
        builder = builder.report_sink(tx);
        Some(rx)
    } else {
        None
    };

    let (mut pipeline, outputs) = builder.start().context("failed to start pipeline")?;
    info!(
        workers = pipeline.worker_count(),
        batch_size = pipeline.batch_size(),
        "✅ Pipeline running, press Ctrl+C to stop"
    );

    let consumer = thread::Builder::new()
        .name("result-consumer".to_string())
        .spawn(move || consume_outputs(outputs, reports, print_report))
        .context("failed to spawn result consumer")?;

    pipeline.run();
    // 关闭输出通道, 消费线程随之退出
    drop(pipeline);
    if consumer.join().is_err() {
        anyhow::bail!("result consumer panicked");
    }
    Ok(())
}
