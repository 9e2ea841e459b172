//! 图片目录视频源 (离线运行 / 回放)
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;

use super::{FrameSource, SourceConnector};
use crate::error::SourceError;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// 按文件名顺序读取目录中的图片, 可循环播放并按帧间隔限速
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    index: usize,
    looping: bool,
    frame_interval: Option<Duration>,
    last_grab: Option<Instant>,
    pending: Option<PathBuf>,
}

impl ImageDirSource {
    pub fn open(dir: impl AsRef<Path>, looping: bool) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .map_err(|e| SourceError::Transient(format!("{}: {}", dir.display(), e)))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Transient(format!(
                "no images found in {}",
                dir.display()
            )));
        }

        Ok(Self {
            paths,
            index: 0,
            looping,
            frame_interval: None,
            last_grab: None,
            pending: None,
        })
    }

    /// 模拟摄像头帧率
    pub fn with_frame_interval(mut self, interval: Option<Duration>) -> Self {
        self.frame_interval = interval;
        self
    }
}

impl FrameSource for ImageDirSource {
    fn grab(&mut self) -> Result<(), SourceError> {
        if self.index >= self.paths.len() {
            if !self.looping {
                return Err(SourceError::Exhausted);
            }
            self.index = 0;
        }

        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_grab) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_grab = Some(Instant::now());

        self.pending = Some(self.paths[self.index].clone());
        self.index += 1;
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage, SourceError> {
        let path = self
            .pending
            .take()
            .ok_or_else(|| SourceError::Transient("retrieve called before grab".to_string()))?;
        image::open(&path)
            .map(|img| img.to_rgb8())
            .map_err(|e| SourceError::Decode(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone)]
pub struct ImageDirConnector {
    pub dir: PathBuf,
    pub looping: bool,
    pub frame_interval: Option<Duration>,
}

impl ImageDirConnector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            looping: true,
            frame_interval: None,
        }
    }
}

impl SourceConnector for ImageDirConnector {
    fn connect(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        let source = ImageDirSource::open(&self.dir, self.looping)?
            .with_frame_interval(self.frame_interval);
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_images(dir: &Path, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            let img = RgbImage::from_pixel(8, 6, Rgb([i as u8 * 40, 0, 0]));
            img.save(dir.join(name)).unwrap();
        }
    }

    #[test]
    fn test_reads_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &["b.png", "a.png"]);
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut src = ImageDirSource::open(dir.path(), false).unwrap();

        src.grab().unwrap();
        let first = src.retrieve().unwrap();
        assert_eq!(first.dimensions(), (8, 6));
        // a.png 是第二个写入的 (R=40)
        assert_eq!(first.get_pixel(0, 0)[0], 40);

        src.grab().unwrap();
        src.retrieve().unwrap();
        assert_eq!(src.grab(), Err(SourceError::Exhausted));
    }

    #[test]
    fn test_looping_restarts() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &["only.png"]);
        let mut src = ImageDirSource::open(dir.path(), true).unwrap();
        for _ in 0..3 {
            src.grab().unwrap();
            src.retrieve().unwrap();
        }
    }

    #[test]
    fn test_empty_dir_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageDirConnector::new(dir.path()).connect(),
            Err(SourceError::Transient(_))
        ));
    }

    #[test]
    fn test_retrieve_without_grab_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), &["x.png"]);
        let mut src = ImageDirSource::open(dir.path(), false).unwrap();
        assert!(src.retrieve().is_err());
    }
}
