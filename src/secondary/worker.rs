//! 二级检测 worker: 裁剪人体区域 → 二级检测 → 写入共享结果缓冲
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::Receiver;
use image::imageops;
use tracing::debug;

use crate::detection::{detect_batch, Detector, Frame, ProcessedFrame};
use crate::error::PipelineResult;
use crate::monitor::{PerfHandle, Severity, StageCounters};

/// 发往单个 worker 的消息
#[derive(Debug)]
pub enum WorkerMessage {
    Work(Vec<ProcessedFrame>),
    Stop,
}

/// worker 与管理器共享的状态
#[derive(Debug)]
pub struct WorkerState {
    is_processing: AtomicBool,
    last_active: Mutex<Instant>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            is_processing: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn mark_busy(&self) {
        self.is_processing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_idle(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.is_processing.store(false, Ordering::SeqCst);
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

/// 按目标类别裁剪 ROI; 子帧沿用父帧的 stream_id / frame_id / 时间戳
pub fn crop_regions(frames: &[ProcessedFrame], class_name: &str) -> Vec<Frame> {
    let mut crops = Vec::new();
    for processed in frames {
        let parent = &processed.frame;
        for det in processed.detections.iter().filter(|d| d.class_name == class_name) {
            let Some((x, y, w, h)) = det.bbox.to_pixel_rect(parent.width(), parent.height()) else {
                continue;
            };
            let image = imageops::crop_imm(&*parent.image, x, y, w, h).to_image();
            crops.push(Frame {
                frame_id: parent.frame_id,
                stream_id: parent.stream_id.clone(),
                captured_at: parent.captured_at,
                image: Arc::new(image),
            });
        }
    }
    crops
}

pub(crate) struct SecondaryWorker {
    pub id: usize,
    pub detector: Box<dyn Detector>,
    pub rx: Receiver<WorkerMessage>,
    pub state: Arc<WorkerState>,
    pub results: Arc<Mutex<Vec<ProcessedFrame>>>,
    pub perf: PerfHandle,
    pub counters: Arc<StageCounters>,
    pub person_class: String,
}

impl SecondaryWorker {
    pub fn run(mut self) {
        let perf_stream = format!("secondary-{}", self.id);
        // 通道断开等同于 Stop
        while let Ok(WorkerMessage::Work(frames)) = self.rx.recv() {
            self.state.mark_busy();
            let count = frames.len() as u64;
            if let Err(e) = self.handle(&perf_stream, frames) {
                self.counters.add_dropped(count);
                self.perf.record_log(
                    Severity::Error,
                    format!("{}: secondary batch failed: {}", perf_stream, e),
                );
            }
            self.state.mark_idle();
        }
        self.detector.release();
        debug!(worker_id = self.id, "secondary worker exited");
    }

    fn handle(&mut self, perf_stream: &str, frames: Vec<ProcessedFrame>) -> PipelineResult<()> {
        let crops = self.perf.measure(perf_stream, "secondary_crop", || {
            crop_regions(&frames, &self.person_class)
        });
        if crops.is_empty() {
            return Ok(());
        }

        let detections = self.perf.measure(perf_stream, "secondary_inference", || {
            detect_batch(self.detector.as_mut(), &crops)
        })?;

        let out: Vec<ProcessedFrame> = crops
            .into_iter()
            .zip(detections)
            .map(|(crop, dets)| ProcessedFrame::new(crop, dets))
            .collect();
        self.counters.add_processed(out.len() as u64);
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{coco_label, BBox, Detection};
    use image::{Rgb, RgbImage};

    fn processed_with(boxes: &[(BBox, u32)]) -> ProcessedFrame {
        let mut image = RgbImage::new(200, 100);
        image.put_pixel(50, 25, Rgb([255, 0, 0]));
        let frame = Frame::new(Arc::from("cam1"), 7, image);
        let detections = boxes
            .iter()
            .filter_map(|(b, class_id)| Detection::from_raw(b, 200, 100, coco_label(*class_id)))
            .collect();
        ProcessedFrame::new(frame, detections)
    }

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox { x1, y1, x2, y2, confidence: 0.9, class_id: 0 }
    }

    #[test]
    fn test_crop_regions_only_person() {
        let frame = processed_with(&[
            (bbox(50.0, 25.0, 150.0, 75.0), 0), // person
            (bbox(0.0, 0.0, 20.0, 20.0), 2),    // car
        ]);
        let crops = crop_regions(&[frame], "person");
        assert_eq!(crops.len(), 1);
        let crop = &crops[0];
        assert_eq!(crop.image.dimensions(), (100, 50));
        assert_eq!(crop.frame_id, 7);
        assert_eq!(&*crop.stream_id, "cam1");
        // 裁剪原点对应父帧 (50,25)
        assert_eq!(crop.image.get_pixel(0, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_crop_regions_empty_without_person() {
        let frame = processed_with(&[(bbox(0.0, 0.0, 20.0, 20.0), 2)]);
        assert!(crop_regions(&[frame], "person").is_empty());
    }

    #[test]
    fn test_worker_state_transitions() {
        let state = WorkerState::new();
        let before = state.last_active();
        state.mark_busy();
        assert!(state.is_processing());
        state.mark_idle();
        assert!(!state.is_processing());
        assert!(state.last_active() >= before);
    }
}
