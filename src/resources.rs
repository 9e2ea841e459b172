//! 资源评估 (Resource Sizer)
//!
//! 启动时探测一次 CPU 核心数和显存,
//! 给一级推理池推荐 worker 数量和批大小。
//! 结果只是建议值: 实际组批仍以 `batch_size` 为上限、队列空时提前结束。
use std::process::Command;
use std::sync::Arc;

use image::RgbImage;
use tracing::{info, warn};

use crate::detection::{Detector, Frame};
use crate::error::{PipelineError, PipelineResult};

/// 未校准时每张图像的显存估计 (MB)
pub const DEFAULT_PER_IMAGE_MB: f64 = 500.0;

/// 校准用空白帧边长
const CALIBRATION_FRAME_SIZE: u32 = 640;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorMemory {
    pub total_mb: u64,
    pub used_mb: u64,
}

impl AcceleratorMemory {
    pub fn free_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.used_mb)
    }
}

/// 计算资源探测能力
pub trait ResourceProbe: Send + Sync {
    fn cpu_core_count(&self) -> usize;

    /// `Err` 表示没有可用的加速器 (或探测失败)
    fn accelerator_memory(&self) -> PipelineResult<AcceleratorMemory>;
}

impl<P: ResourceProbe + ?Sized> ResourceProbe for Arc<P> {
    fn cpu_core_count(&self) -> usize {
        (**self).cpu_core_count()
    }

    fn accelerator_memory(&self) -> PipelineResult<AcceleratorMemory> {
        (**self).accelerator_memory()
    }
}

/// `num_cpus` + `nvidia-smi`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn cpu_core_count(&self) -> usize {
        num_cpus::get()
    }

    fn accelerator_memory(&self) -> PipelineResult<AcceleratorMemory> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.total,memory.used",
                "--format=csv,nounits,noheader",
            ])
            .output()
            .map_err(|e| PipelineError::probe(format!("nvidia-smi: {}", e)))?;
        if !output.status.success() {
            return Err(PipelineError::probe(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// 解析 `total, used` (多卡时取第一行)
pub fn parse_nvidia_smi(output: &str) -> PipelineResult<AcceleratorMemory> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| PipelineError::probe("empty nvidia-smi output"))?;
    let mut fields = line.split(',').map(|f| f.trim().parse::<u64>());
    match (fields.next(), fields.next()) {
        (Some(Ok(total_mb)), Some(Ok(used_mb))) => Ok(AcceleratorMemory { total_mb, used_mb }),
        _ => Err(PipelineError::probe(format!("unexpected nvidia-smi line: {:?}", line))),
    }
}

pub struct ResourceSizer<P: ResourceProbe> {
    probe: P,
}

impl<P: ResourceProbe> ResourceSizer<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// `max(1, min(total - reserved, cap))`
    pub fn recommended_worker_count(&self, reserved_cores: usize, cap: usize) -> usize {
        let total = self.probe.cpu_core_count();
        let available = total.saturating_sub(reserved_cores).max(1);
        let recommended = available.min(cap).max(1);
        info!(
            total_cores = total,
            reserved_cores,
            available_cores = available,
            recommended_workers = recommended,
            "CPU configuration"
        );
        recommended
    }

    /// 按剩余显存推荐批大小; 探测失败时返回 `min_batch`。
    ///
    /// 传入 `sampler` 时先用批大小 1 和 2 各推理一次,
    /// 用显存差值估算单张成本。
    pub fn recommended_batch_size(
        &self,
        memory_fraction: f64,
        worker_count: usize,
        min_batch: usize,
        max_batch: usize,
        sampler: Option<&mut dyn Detector>,
    ) -> usize {
        let max_batch = max_batch.max(min_batch);
        let memory = match self.probe.accelerator_memory() {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    error = %e,
                    min_batch,
                    "accelerator memory unavailable, using minimum batch size"
                );
                return min_batch;
            }
        };

        let per_image_mb = sampler
            .and_then(|det| self.estimate_per_image_mb(det))
            .unwrap_or(DEFAULT_PER_IMAGE_MB);

        let available_mb = memory.free_mb() as f64 * memory_fraction;
        let per_worker_mb = available_mb / worker_count.max(1) as f64;
        let fit = (per_worker_mb / per_image_mb).floor().max(0.0) as usize;
        let batch = fit.max(min_batch).min(max_batch);

        info!(
            total_mb = memory.total_mb,
            used_mb = memory.used_mb,
            per_worker_mb = per_worker_mb as u64,
            per_image_mb,
            batch_size = batch,
            "Batch size configuration"
        );
        batch
    }

    /// 显存增量 = used(batch=2) - used(batch=1); 非正值视为无效
    fn estimate_per_image_mb(&self, detector: &mut dyn Detector) -> Option<f64> {
        let frame = Frame::new(
            Arc::from("calibration"),
            0,
            RgbImage::new(CALIBRATION_FRAME_SIZE, CALIBRATION_FRAME_SIZE),
        );

        let mut used_after = |n: usize| -> Option<u64> {
            let batch = vec![frame.clone(); n];
            if let Err(e) = detector.detect(&batch) {
                warn!(error = %e, batch = n, "calibration inference failed");
                return None;
            }
            self.probe.accelerator_memory().ok().map(|m| m.used_mb)
        };

        let one = used_after(1)?;
        let two = used_after(2)?;
        let delta = two as f64 - one as f64;
        if delta > 0.0 {
            info!(per_image_mb = delta, "calibrated per-image memory cost");
            Some(delta)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use std::sync::Mutex;

    struct FakeProbe {
        cores: usize,
        memory: Option<AcceleratorMemory>,
        // 每次探测返回的 used_mb 序列 (校准用)
        used_sequence: Mutex<Vec<u64>>,
    }

    impl FakeProbe {
        fn new(cores: usize, memory: Option<AcceleratorMemory>) -> Self {
            Self {
                cores,
                memory,
                used_sequence: Mutex::new(Vec::new()),
            }
        }
    }

    impl ResourceProbe for FakeProbe {
        fn cpu_core_count(&self) -> usize {
            self.cores
        }

        fn accelerator_memory(&self) -> PipelineResult<AcceleratorMemory> {
            let mut memory = self.memory.ok_or_else(|| PipelineError::probe("no gpu"))?;
            if let Some(used) = self.used_sequence.lock().unwrap().pop() {
                memory.used_mb = used;
            }
            Ok(memory)
        }
    }

    struct NoopDetector;

    impl Detector for NoopDetector {
        fn detect(&mut self, frames: &[Frame]) -> PipelineResult<Vec<Vec<BBox>>> {
            Ok(vec![Vec::new(); frames.len()])
        }
    }

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(ResourceSizer::new(FakeProbe::new(16, None)).recommended_worker_count(4, 2), 2);
        assert_eq!(ResourceSizer::new(FakeProbe::new(5, None)).recommended_worker_count(4, 2), 1);
        // 核心数少于保留数
        assert_eq!(ResourceSizer::new(FakeProbe::new(2, None)).recommended_worker_count(4, 2), 1);
        assert_eq!(ResourceSizer::new(FakeProbe::new(1, None)).recommended_worker_count(0, 0), 1);
    }

    #[test]
    fn test_batch_size_falls_back_without_accelerator() {
        let sizer = ResourceSizer::new(FakeProbe::new(8, None));
        for (fraction, workers, min, max) in [(0.6, 1, 1, 16), (1.0, 4, 3, 8), (0.1, 2, 2, 2)] {
            assert_eq!(sizer.recommended_batch_size(fraction, workers, min, max, None), min);
        }
        let mut det = NoopDetector;
        let sampler = Some(&mut det as &mut dyn Detector);
        assert_eq!(sizer.recommended_batch_size(0.6, 1, 4, 16, sampler), 4);
    }

    #[test]
    fn test_batch_size_from_free_memory() {
        let memory = AcceleratorMemory { total_mb: 8000, used_mb: 2000 };
        let sizer = ResourceSizer::new(FakeProbe::new(8, Some(memory)));
        // (6000 * 0.5) / 1 / 500 = 6
        assert_eq!(sizer.recommended_batch_size(0.5, 1, 1, 16, None), 6);
        // 两个 worker 平分
        assert_eq!(sizer.recommended_batch_size(0.5, 2, 1, 16, None), 3);
        // 上限
        assert_eq!(sizer.recommended_batch_size(1.0, 1, 1, 4, None), 4);
    }

    #[test]
    fn test_batch_size_uses_calibrated_cost() {
        let memory = AcceleratorMemory { total_mb: 8000, used_mb: 2000 };
        let probe = FakeProbe::new(8, Some(memory));
        // pop 顺序: 第一次探测 (总量), batch=1 后 3000, batch=2 后 3250
        *probe.used_sequence.lock().unwrap() = vec![3250, 3000, 2000];
        let sizer = ResourceSizer::new(probe);
        let mut det = NoopDetector;
        // (6000 * 0.5) / 250 = 12
        let sampler = Some(&mut det as &mut dyn Detector);
        assert_eq!(sizer.recommended_batch_size(0.5, 1, 1, 16, sampler), 12);
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let m = parse_nvidia_smi("24576, 1024\n8192, 0\n").unwrap();
        assert_eq!(m, AcceleratorMemory { total_mb: 24576, used_mb: 1024 });
        assert!(parse_nvidia_smi("").is_err());
        assert!(parse_nvidia_smi("N/A, N/A").is_err());
    }
}
