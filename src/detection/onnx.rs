// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// YOLOv8 ONNX 检测后端
/// YOLOv8 ONNX Runtime backend for the `Detector` capability.
///
/// 批量推理: N 帧 → [N, 3, S, S] → [N, 4+nc, anchors] → 每帧 NMS 后的像素框
use std::path::Path;
use std::sync::Arc;

use fast_image_resize as fr;
use ndarray::{ArrayView3, Axis};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{RunOptions, Session};
use ort::value::Tensor;
use tracing::{debug, info, warn};

use super::detector::{Detector, DetectorAbort};
use super::types::{BBox, Frame};
use crate::error::{PipelineError, PipelineResult};

const CXYWH_OFFSET: usize = 4;

#[derive(Debug, Clone)]
pub struct OnnxDetectorConfig {
    pub model_path: String,
    /// 模型输入边长 (正方形)
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for OnnxDetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "yolov8n.onnx".to_string(),
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
        }
    }
}

fn load_error(model: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::model_load(format!("{}: {}", model, e))
}

/// 终止进行中的 `Session::run`
struct OnnxAbort(Arc<RunOptions>);

impl DetectorAbort for OnnxAbort {
    fn abort(&self) {
        if let Err(e) = self.0.terminate() {
            warn!(error = %e, "failed to terminate onnx run");
        }
    }
}

pub struct OnnxDetector {
    session: Option<Session>,
    run_options: Arc<RunOptions>,
    output_name: String,
    config: OnnxDetectorConfig,
    resizer: fr::Resizer,
}

impl OnnxDetector {
    pub fn new(config: OnnxDetectorConfig) -> PipelineResult<Self> {
        let path = Path::new(&config.model_path);
        if !path.exists() {
            return Err(PipelineError::model_load(format!(
                "model file not found: {}",
                config.model_path
            )));
        }

        let model_bytes = std::fs::read(path)?;
        let model = config.model_path.as_str();
        let session = Session::builder()
            .map_err(|e| load_error(model, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(model, e))?
            .commit_from_memory(model_bytes.as_slice())
            .map_err(|e| load_error(model, e))?;

        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| PipelineError::model_load("model has no outputs"))?;
        let run_options = RunOptions::new().map_err(|e| load_error(model, e))?;

        info!(
            model_path = %config.model_path,
            input_size = config.input_size,
            "✅ ONNX detector loaded"
        );

        Ok(Self {
            session: Some(session),
            run_options: Arc::new(run_options),
            output_name,
            config,
            resizer: fr::Resizer::new(),
        })
    }

    /// 缩放到输入尺寸 (Nearest) 并写入 NCHW 缓冲区
    fn preprocess(&mut self, frames: &[Frame]) -> PipelineResult<Vec<f32>> {
        let size = self.config.input_size as usize;
        let plane = size * size;
        let mut data = vec![0f32; frames.len() * 3 * plane];

        for (idx, frame) in frames.iter().enumerate() {
            let src = fr::images::Image::from_vec_u8(
                frame.width(),
                frame.height(),
                frame.image.as_raw().clone(),
                fr::PixelType::U8x3,
            )
            .map_err(|e| PipelineError::inference(format!("resize source: {}", e)))?;
            let mut dst = fr::images::Image::new(
                self.config.input_size,
                self.config.input_size,
                fr::PixelType::U8x3,
            );
            self.resizer
                .resize(
                    &src,
                    &mut dst,
                    &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest),
                )
                .map_err(|e| PipelineError::inference(format!("resize: {}", e)))?;

            let base = idx * 3 * plane;
            for (i, px) in dst.buffer().chunks_exact(3).enumerate() {
                data[base + i] = px[0] as f32 / 255.0;
                data[base + plane + i] = px[1] as f32 / 255.0;
                data[base + 2 * plane + i] = px[2] as f32 / 255.0;
            }
        }
        Ok(data)
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, frames: &[Frame]) -> PipelineResult<Vec<Vec<BBox>>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        let size = self.config.input_size as usize;
        let input = self.preprocess(frames)?;
        let shape = vec![frames.len(), 3, size, size];
        let tensor = Tensor::from_array((shape, input.into_boxed_slice()))
            .map_err(|e| PipelineError::inference(format!("input tensor: {}", e)))?;

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| PipelineError::inference("detector already released"))?;
        let outputs = session
            .run_with_options(ort::inputs![tensor], self.run_options.as_ref())
            .map_err(|e| PipelineError::inference(e.to_string()))?;
        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| {
                PipelineError::malformed(format!("missing {} tensor", self.output_name))
            })?;
        let (shape, values) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::malformed(e.to_string()))?;

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        if dims.len() != 3 || dims[0] != frames.len() || dims[1] <= CXYWH_OFFSET {
            return Err(PipelineError::malformed(format!("unexpected output shape {:?}", dims)));
        }
        let view = ArrayView3::from_shape((dims[0], dims[1], dims[2]), values)
            .map_err(|e| PipelineError::malformed(e.to_string()))?;

        let results = decode_output(
            view,
            frames,
            self.config.input_size as f32,
            self.config.conf_threshold,
            self.config.iou_threshold,
        );
        debug!(
            batch = frames.len(),
            boxes = results.iter().map(Vec::len).sum::<usize>(),
            "onnx batch decoded"
        );
        Ok(results)
    }

    fn release(&mut self) {
        // 释放会话 (显存随之释放)
        self.session = None;
    }

    fn abort_handle(&self) -> Option<Arc<dyn DetectorAbort>> {
        Some(Arc::new(OnnxAbort(self.run_options.clone())))
    }
}

/// `[N, 4+nc, anchors]` → 每帧像素框 (cx,cy,w,h 相对输入尺寸, 按原图比例还原)
pub fn decode_output(
    preds: ArrayView3<f32>,
    frames: &[Frame],
    input_size: f32,
    conf_threshold: f32,
    iou_threshold: f32,
) -> Vec<Vec<BBox>> {
    let mut ys = Vec::with_capacity(frames.len());
    for (anchors, frame) in preds.axis_iter(Axis(0)).zip(frames) {
        let scale_x = frame.width() as f32 / input_size;
        let scale_y = frame.height() as f32 / input_size;

        let mut boxes = Vec::new();
        for pred in anchors.axis_iter(Axis(1)) {
            let best = pred
                .iter()
                .skip(CXYWH_OFFSET)
                .enumerate()
                .fold(None, |best: Option<(usize, f32)>, (id, &score)| match best {
                    Some((_, s)) if s >= score => best,
                    _ => Some((id, score)),
                });
            let Some((class_id, confidence)) = best else {
                continue;
            };
            if confidence < conf_threshold {
                continue;
            }

            let (cx, cy) = (pred[0] * scale_x, pred[1] * scale_y);
            let (w, h) = (pred[2] * scale_x, pred[3] * scale_y);
            boxes.push(BBox {
                x1: cx - w / 2.0,
                y1: cy - h / 2.0,
                x2: cx + w / 2.0,
                y2: cy + h / 2.0,
                confidence,
                class_id: class_id as u32,
            });
        }
        non_max_suppression(&mut boxes, iou_threshold);
        ys.push(boxes);
    }
    ys
}

/// 按类别的 NMS (置信度降序, 原地保留)
pub fn non_max_suppression(boxes: &mut Vec<BBox>, iou_threshold: f32) {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..boxes.len() {
        let suppressed = (0..kept).any(|prev| {
            boxes[prev].class_id == boxes[index].class_id
                && iou(&boxes[prev], &boxes[index]) > iou_threshold
        });
        if !suppressed {
            boxes.swap(kept, index);
            kept += 1;
        }
    }
    boxes.truncate(kept);
}

fn iou(a: &BBox, b: &BBox) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = a.width() * a.height() + b.width() * b.height() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use ndarray::Array3;
    use std::sync::Arc;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> BBox {
        BBox { x1, y1, x2, y2, confidence, class_id }
    }

    #[test]
    fn test_nms_suppresses_same_class_only() {
        let mut boxes = vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.6, 0),
            bbox(1.0, 1.0, 10.0, 10.0, 0.9, 0),
            bbox(1.0, 1.0, 10.0, 10.0, 0.5, 1),
            bbox(50.0, 50.0, 60.0, 60.0, 0.4, 0),
        ];
        non_max_suppression(&mut boxes, 0.45);
        assert_eq!(boxes.len(), 3);
        assert_eq!(boxes[0].confidence, 0.9);
        assert!(boxes.iter().any(|b| b.class_id == 1));
    }

    #[test]
    fn test_decode_output_scales_to_frame() {
        // 1 帧, 2 类, 2 个锚点
        let mut preds = Array3::<f32>::zeros((1, 6, 2));
        // 锚点0: 中心(32,32) 尺寸16x16, 类别1 置信度0.8
        preds[[0, 0, 0]] = 32.0;
        preds[[0, 1, 0]] = 32.0;
        preds[[0, 2, 0]] = 16.0;
        preds[[0, 3, 0]] = 16.0;
        preds[[0, 5, 0]] = 0.8;
        // 锚点1: 低于阈值
        preds[[0, 4, 1]] = 0.1;

        let frames = vec![Frame::new(Arc::from("cam"), 0, RgbImage::new(128, 64))];
        let out = decode_output(preds.view(), &frames, 64.0, 0.25, 0.45);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 1);
        let b = &out[0][0];
        assert_eq!(b.class_id, 1);
        assert!((b.x1 - 48.0).abs() < 1e-4);
        assert!((b.x2 - 80.0).abs() < 1e-4);
        assert!((b.y1 - 24.0).abs() < 1e-4);
        assert!((b.y2 - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let err = OnnxDetector::new(OnnxDetectorConfig {
            model_path: "/nonexistent/model.onnx".to_string(),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
    }
}
