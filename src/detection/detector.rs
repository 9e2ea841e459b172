//! 检测器统一接口 (Detector capability)
//!
//! 一级检测 (整帧) 和二级检测 (ROI裁剪) 都通过这个 trait 调用,
//! 具体推理引擎由实现方决定。
//!
//! ```text
//! [Frame; N] → Detector::detect → [[BBox]; N]  (像素坐标)
//!            ↓
//!      detect_batch: 校验 + 归一化 → [[Detection]; N]
//! ```
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use super::labels::{coco_label, ClassLabel};
use super::types::{BBox, Detection, Frame};
use crate::error::{PipelineError, PipelineResult};

/// 检测能力
///
/// 每个 worker 持有自己的实例,因此 `detect` 可以使用 `&mut self`。
pub trait Detector: Send {
    /// 批量检测: 每个输入帧返回一个检测框列表,顺序与输入一致
    fn detect(&mut self, frames: &[Frame]) -> PipelineResult<Vec<Vec<BBox>>>;

    /// 类别ID → 标签 (默认COCO)
    fn label(&self, class_id: u32) -> ClassLabel {
        coco_label(class_id)
    }

    /// 释放推理资源 (显存等), worker 退出前调用
    fn release(&mut self) {}

    /// 可在其他线程上中断进行中推理的句柄
    ///
    /// 不支持中断的检测器返回 `None`
    fn abort_handle(&self) -> Option<Arc<dyn DetectorAbort>> {
        None
    }
}

/// 中断正在执行的 `detect` 调用, 使其尽快返回错误
pub trait DetectorAbort: Send + Sync {
    fn abort(&self);
}

/// worker 当前检测器的中断句柄 (检测器重建时更新)
#[derive(Clone, Default)]
pub struct AbortSlot {
    handle: Arc<Mutex<Option<Arc<dyn DetectorAbort>>>>,
}

impl AbortSlot {
    pub fn set(&self, handle: Option<Arc<dyn DetectorAbort>>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    /// 触发中断, 返回是否存在可用句柄
    pub fn abort(&self) -> bool {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match handle {
            Some(h) => {
                h.abort();
                true
            }
            None => false,
        }
    }
}

/// 检测器工厂: 每个 worker 启动时各自加载一次模型
pub trait DetectorFactory: Send + Sync {
    fn create(&self, worker_id: usize) -> PipelineResult<Box<dyn Detector>>;
}

impl<F> DetectorFactory for F
where
    F: Fn(usize) -> PipelineResult<Box<dyn Detector>> + Send + Sync,
{
    fn create(&self, worker_id: usize) -> PipelineResult<Box<dyn Detector>> {
        self(worker_id)
    }
}

/// Runs one batch through `detector` and converts the raw boxes into
/// normalized [`Detection`]s per frame.
///
/// A panicking detector is reported as [`PipelineError::Inference`]; an output
/// whose length differs from the input is [`PipelineError::MalformedOutput`].
pub fn detect_batch(
    detector: &mut dyn Detector,
    frames: &[Frame],
) -> PipelineResult<Vec<Vec<Detection>>> {
    let raw = panic::catch_unwind(AssertUnwindSafe(|| detector.detect(frames)))
        .map_err(|payload| PipelineError::inference(panic_message(payload.as_ref())))??;

    if raw.len() != frames.len() {
        return Err(PipelineError::malformed(format!(
            "{} detection lists for {} frames",
            raw.len(),
            frames.len()
        )));
    }

    Ok(frames
        .iter()
        .zip(raw)
        .map(|(frame, boxes)| {
            boxes
                .iter()
                .filter_map(|b| {
                    let label = detector.label(b.class_id);
                    Detection::from_raw(b, frame.width(), frame.height(), label)
                })
                .collect()
        })
        .collect())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("detector panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("detector panicked: {}", s)
    } else {
        "detector panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::Arc;

    struct FixedDetector {
        per_frame: Vec<BBox>,
        extra_list: bool,
    }

    impl Detector for FixedDetector {
        fn detect(&mut self, frames: &[Frame]) -> PipelineResult<Vec<Vec<BBox>>> {
            let mut out: Vec<Vec<BBox>> = frames.iter().map(|_| self.per_frame.clone()).collect();
            if self.extra_list {
                out.push(Vec::new());
            }
            Ok(out)
        }
    }

    struct PanickingDetector;

    impl Detector for PanickingDetector {
        fn detect(&mut self, _frames: &[Frame]) -> PipelineResult<Vec<Vec<BBox>>> {
            panic!("tensor shape mismatch");
        }
    }

    fn frame(id: u64) -> Frame {
        Frame::new(Arc::from("cam"), id, RgbImage::new(100, 50))
    }

    #[test]
    fn test_detect_batch_normalizes_per_frame() {
        let mut det = FixedDetector {
            per_frame: vec![
                BBox { x1: 0.0, y1: 0.0, x2: 50.0, y2: 25.0, confidence: 0.8, class_id: 0 },
                // 零面积框被丢弃
                BBox { x1: 10.0, y1: 10.0, x2: 10.0, y2: 20.0, confidence: 0.8, class_id: 2 },
            ],
            extra_list: false,
        };
        let frames = vec![frame(1), frame(2)];
        let out = detect_batch(&mut det, &frames).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[0][0].class_name, "person");
        assert!((out[0][0].bbox.width() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_detect_batch_rejects_length_mismatch() {
        let mut det = FixedDetector {
            per_frame: Vec::new(),
            extra_list: true,
        };
        let err = detect_batch(&mut det, &[frame(1)]).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedOutput(_)));
    }

    #[test]
    fn test_detect_batch_catches_panic() {
        let err = detect_batch(&mut PanickingDetector, &[frame(1)]).unwrap_err();
        match err {
            PipelineError::Inference(msg) => assert!(msg.contains("tensor shape mismatch")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_closure_factory() {
        let factory = |_worker_id: usize| -> PipelineResult<Box<dyn Detector>> {
            Ok(Box::new(FixedDetector {
                per_frame: Vec::new(),
                extra_list: false,
            }))
        };
        let mut det = factory.create(3).unwrap();
        assert_eq!(det.detect(&[frame(1)]).unwrap().len(), 1);
    }

    struct CountingAbort(std::sync::atomic::AtomicUsize);

    impl DetectorAbort for CountingAbort {
        fn abort(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_abort_slot_follows_current_handle() {
        let slot = AbortSlot::default();
        assert!(!slot.abort());

        let handle = Arc::new(CountingAbort(Default::default()));
        slot.clone().set(Some(handle.clone()));
        assert!(slot.abort());
        assert_eq!(handle.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        slot.set(None);
        assert!(!slot.abort());
    }
}
