/// 检测系统数据结构定义
/// Data structures shared by every pipeline stage.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;

use super::labels::ClassLabel;

/// 视频流标识 (克隆开销低)
pub type StreamId = Arc<str>;

// ========== 帧 ==========

/// 已解码帧 (采集线程 → 推理线程)
#[derive(Clone, Debug)]
pub struct Frame {
    pub frame_id: u64, // 每路流单调递增
    pub stream_id: StreamId,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<RgbImage>, // 使用Arc共享数据,避免复制
}

impl Frame {
    pub fn new(stream_id: StreamId, frame_id: u64, image: RgbImage) -> Self {
        Self {
            frame_id,
            stream_id,
            captured_at: Utc::now(),
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

// ========== 检测框 ==========

/// 检测器原始输出框 (输入图像像素坐标, 左上/右下角点)
#[derive(Clone, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// 归一化边界框 (中心点 + 宽高, 相对帧尺寸, 均在 [0,1])
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    x_center: f32,
    y_center: f32,
    width: f32,
    height: f32,
}

impl BoundingBox {
    /// Returns `None` unless all values lie in [0,1] and width/height are positive.
    pub fn new(x_center: f32, y_center: f32, width: f32, height: f32) -> Option<Self> {
        let in_unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        if !(in_unit(x_center) && in_unit(y_center) && in_unit(width) && in_unit(height)) {
            return None;
        }
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(Self {
            x_center,
            y_center,
            width,
            height,
        })
    }

    /// 像素框 → 归一化框, 先裁剪到帧范围内
    pub fn from_pixels(bbox: &BBox, frame_width: u32, frame_height: u32) -> Option<Self> {
        if frame_width == 0 || frame_height == 0 {
            return None;
        }
        let fw = frame_width as f32;
        let fh = frame_height as f32;

        let x1 = bbox.x1.min(bbox.x2).clamp(0.0, fw);
        let x2 = bbox.x1.max(bbox.x2).clamp(0.0, fw);
        let y1 = bbox.y1.min(bbox.y2).clamp(0.0, fh);
        let y2 = bbox.y1.max(bbox.y2).clamp(0.0, fh);

        let width = (x2 - x1) / fw;
        let height = (y2 - y1) / fh;
        Self::new((x1 + x2) / 2.0 / fw, (y1 + y2) / 2.0 / fh, width, height)
    }

    pub fn x_center(&self) -> f32 {
        self.x_center
    }

    pub fn y_center(&self) -> f32 {
        self.y_center
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// 归一化框 → 像素矩形 `(x, y, width, height)`, 空矩形返回 `None`
    pub fn to_pixel_rect(
        &self,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<(u32, u32, u32, u32)> {
        let fw = frame_width as f32;
        let fh = frame_height as f32;

        let x1 = ((self.x_center - self.width / 2.0) * fw).round().clamp(0.0, fw) as u32;
        let y1 = ((self.y_center - self.height / 2.0) * fh).round().clamp(0.0, fh) as u32;
        let x2 = ((self.x_center + self.width / 2.0) * fw).round().clamp(0.0, fw) as u32;
        let y2 = ((self.y_center + self.height / 2.0) * fh).round().clamp(0.0, fh) as u32;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

// ========== 检测结果 ==========

/// 单个检测结果 (创建后不可变)
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: &'static str,
    pub color: [u8; 3],
}

impl Detection {
    /// Converts a raw pixel box; degenerate boxes and non-finite scores are rejected.
    pub fn from_raw(
        raw: &BBox,
        frame_width: u32,
        frame_height: u32,
        label: ClassLabel,
    ) -> Option<Self> {
        if !raw.confidence.is_finite() {
            return None;
        }
        let bbox = BoundingBox::from_pixels(raw, frame_width, frame_height)?;
        Some(Self {
            bbox,
            confidence: raw.confidence.clamp(0.0, 1.0),
            class_id: raw.class_id,
            class_name: label.name,
            color: label.color,
        })
    }
}

/// 推理结果帧 (推理线程 → 主循环 / 二级检测)
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

impl ProcessedFrame {
    pub fn new(frame: Frame, detections: Vec<Detection>) -> Self {
        Self { frame, detections }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.frame.stream_id
    }

    pub fn contains_class(&self, class_name: &str) -> bool {
        self.detections.iter().any(|d| d.class_name == class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::labels::coco_label;

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox {
            x1,
            y1,
            x2,
            y2,
            confidence: 0.9,
            class_id: 0,
        }
    }

    #[test]
    fn test_bounding_box_rejects_out_of_range() {
        assert!(BoundingBox::new(0.5, 0.5, 0.2, 0.2).is_some());
        assert!(BoundingBox::new(1.2, 0.5, 0.2, 0.2).is_none());
        assert!(BoundingBox::new(0.5, 0.5, 0.0, 0.2).is_none());
        assert!(BoundingBox::new(f32::NAN, 0.5, 0.2, 0.2).is_none());
    }

    #[test]
    fn test_from_pixels_normalizes_and_clamps() {
        let b = BoundingBox::from_pixels(&raw(100.0, 50.0, 300.0, 250.0), 400, 500).unwrap();
        assert!((b.x_center() - 0.5).abs() < 1e-6);
        assert!((b.y_center() - 0.3).abs() < 1e-6);
        assert!((b.width() - 0.5).abs() < 1e-6);
        assert!((b.height() - 0.4).abs() < 1e-6);

        // 超出画面的部分被裁掉
        let c = BoundingBox::from_pixels(&raw(-50.0, -50.0, 200.0, 100.0), 400, 400).unwrap();
        assert!((c.width() - 0.5).abs() < 1e-6);
        assert!((c.height() - 0.25).abs() < 1e-6);

        // 完全在画面外
        assert!(BoundingBox::from_pixels(&raw(500.0, 500.0, 600.0, 600.0), 400, 400).is_none());
    }

    #[test]
    fn test_pixel_rect_round_trip_bounds() {
        let b = BoundingBox::from_pixels(&raw(40.0, 20.0, 120.0, 100.0), 200, 200).unwrap();
        assert_eq!(b.to_pixel_rect(200, 200), Some((40, 20, 80, 80)));
    }

    #[test]
    fn test_detection_from_raw_clamps_confidence() {
        let mut r = raw(0.0, 0.0, 10.0, 10.0);
        r.confidence = 1.0001;
        let det = Detection::from_raw(&r, 100, 100, coco_label(0)).unwrap();
        assert_eq!(det.confidence, 1.0);
        assert_eq!(det.class_name, "person");

        r.confidence = f32::NAN;
        assert!(Detection::from_raw(&r, 100, 100, coco_label(0)).is_none());
    }
}
