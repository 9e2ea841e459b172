// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

#![allow(clippy::type_complexity)]
//! 数字卫兵 (Digital Sentinel) 多路视频检测流水线
//!
//! 采集 → 一级批量推理 → 人体 ROI 二级检测,
//! 各阶段计时与计数由性能监控汇总。
pub mod config; // 配置文件与命令行参数
pub mod detection; // 数据模型与检测能力
pub mod error; // 错误类型
pub mod inference; // 一级批量推理池
pub mod input; // 视频输入系统
pub mod monitor; // 性能监控
pub mod pipeline; // 流水线协调器
pub mod resources; // 资源评估
pub mod secondary; // 二级检测池

pub use crate::config::{Args, PipelineConfig, SecondaryConfig};
pub use crate::detection::{
    BBox, BoundingBox, Detection, Detector, DetectorFactory, Frame, ProcessedFrame, StreamId,
};
pub use crate::error::{PipelineError, PipelineResult, SourceError};
pub use crate::inference::BatchInferencePool;
pub use crate::input::{FrameGrabber, FrameSource, SourceConnector};
pub use crate::monitor::{PerfHandle, PerformanceMonitor, PerformanceReport};
pub use crate::pipeline::{
    consume_outputs, ConsumerStats, FreshnessFilter, Pipeline, PipelineBuilder, PipelineOutputs,
};
pub use crate::resources::{ResourceProbe, ResourceSizer, SystemProbe};
pub use crate::secondary::SecondaryPool;
