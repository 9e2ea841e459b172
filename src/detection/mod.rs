/// 检测系统 (Detection System)
///
/// 推理阶段共享的数据模型和检测能力
/// - Types:    帧 / 边界框 / 检测结果
/// - Labels:   COCO 类别表 (名称 + 显示颜色)
/// - Detector: 批量检测 trait + 工厂
/// - Onnx:     YOLOv8 ONNX 后端 (onnx 功能)
pub mod detector;
pub mod labels;
pub mod types;

#[cfg(feature = "onnx")]
pub mod onnx;

pub use detector::{detect_batch, AbortSlot, Detector, DetectorAbort, DetectorFactory};
pub use labels::{coco_label, ClassLabel, COCO_LABELS, PERSON_CLASS_ID};
pub use types::{BBox, BoundingBox, Detection, Frame, ProcessedFrame, StreamId};
