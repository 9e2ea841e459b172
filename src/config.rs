/// 流水线配置 (Pipeline Configuration)
///
/// JSON 配置文件 + 默认值 + 命令行覆盖:
/// ```text
/// defaults ──► --config file.json ──► CLI flags ──► validate()
/// ```
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::inference::WorkerSettings;
use crate::input::GrabberConfig;
use crate::secondary::SecondaryPoolConfig;

/// 二级检测池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    pub person_class: String,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            initial_workers: 1,
            person_class: "person".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// stream_id → 源地址
    pub streams: BTreeMap<String, String>,
    pub frame_queue_capacity: usize,
    pub result_queue_capacity: usize,
    pub output_queue_capacity: usize,

    pub memory_fraction: f64,
    pub min_batch: usize,
    pub max_batch: usize,
    /// 固定批大小, 跳过显存测算
    pub batch_size: Option<usize>,
    pub reserved_cores: usize,
    pub max_primary_workers: usize,
    /// 固定一级 worker 数量
    pub primary_workers: Option<usize>,

    pub secondary: SecondaryConfig,

    pub log_interval_ms: u64,
    pub grab_retry_delay_ms: u64,
    pub reconnect_after_failures: u32,
    pub reconnect_cooldown_ms: u64,
    pub collect_timeout_ms: u64,
    pub idle_sleep_ms: u64,
    pub result_put_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_consecutive_errors: u32,

    pub primary_model: String,
    pub secondary_model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            streams: BTreeMap::new(),
            frame_queue_capacity: 120,
            result_queue_capacity: 120,
            output_queue_capacity: 120,
            memory_fraction: 0.6,
            min_batch: 1,
            max_batch: 16,
            batch_size: None,
            reserved_cores: 4,
            max_primary_workers: 2,
            primary_workers: None,
            secondary: SecondaryConfig::default(),
            log_interval_ms: 5000,
            grab_retry_delay_ms: 100,
            reconnect_after_failures: 30,
            reconnect_cooldown_ms: 1000,
            collect_timeout_ms: 10,
            idle_sleep_ms: 10,
            result_put_timeout_ms: 100,
            shutdown_grace_ms: 2000,
            max_consecutive_errors: 5,
            primary_model: "models/yolov8m.onnx".to_string(),
            secondary_model: "models/yolov8m.onnx".to_string(),
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文件加载; 缺省字段取默认值
    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.streams.is_empty() {
            return Err(PipelineError::config("at least one stream is required"));
        }
        let blank = self
            .streams
            .iter()
            .find(|(id, addr)| id.is_empty() || addr.is_empty());
        if let Some((id, _)) = blank {
            return Err(PipelineError::config(format!(
                "stream '{}' has an empty id or address",
                id
            )));
        }
        if self.frame_queue_capacity == 0
            || self.result_queue_capacity == 0
            || self.output_queue_capacity == 0
        {
            return Err(PipelineError::config("queue capacities must be positive"));
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(PipelineError::config(format!(
                "memory_fraction must be in (0, 1], got {}",
                self.memory_fraction
            )));
        }
        if self.min_batch == 0 || self.min_batch > self.max_batch {
            return Err(PipelineError::config(format!(
                "invalid batch bounds [{}, {}]",
                self.min_batch, self.max_batch
            )));
        }
        if self.batch_size == Some(0) || self.primary_workers == Some(0) {
            return Err(PipelineError::config("batch_size and primary_workers must be positive"));
        }
        if self.max_primary_workers == 0 {
            return Err(PipelineError::config("max_primary_workers must be positive"));
        }
        let s = &self.secondary;
        if s.max_workers == 0 || s.min_workers > s.max_workers {
            return Err(PipelineError::config(format!(
                "invalid secondary worker bounds [{}, {}]",
                s.min_workers, s.max_workers
            )));
        }
        if s.person_class.is_empty() {
            return Err(PipelineError::config("secondary.person_class must not be empty"));
        }
        Ok(())
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn grabber_config(&self) -> GrabberConfig {
        GrabberConfig {
            retry_delay: Duration::from_millis(self.grab_retry_delay_ms),
            reconnect_after_failures: self.reconnect_after_failures,
            reconnect_cooldown: Duration::from_millis(self.reconnect_cooldown_ms),
        }
    }

    pub fn worker_settings(&self, batch_size: usize) -> WorkerSettings {
        WorkerSettings {
            batch_size,
            collect_timeout: Duration::from_millis(self.collect_timeout_ms),
            idle_sleep: Duration::from_millis(self.idle_sleep_ms),
            result_put_timeout: Duration::from_millis(self.result_put_timeout_ms),
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }

    pub fn secondary_pool_config(&self) -> SecondaryPoolConfig {
        SecondaryPoolConfig {
            min_workers: self.secondary.min_workers,
            max_workers: self.secondary.max_workers,
            person_class: self.secondary.person_class.clone(),
        }
    }
}

/// 数字卫兵参数
#[derive(Parser, Debug, Clone, Default)]
#[command(
    author,
    version,
    about = "数字卫兵 - 多路视频批量检测服务",
    long_about = None
)]
pub struct Args {
    /// JSON 配置文件
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 视频流, 格式 id=address (可重复)
    #[arg(short, long = "stream", value_name = "ID=ADDRESS")]
    pub streams: Vec<String>,

    /// 一级检测模型
    #[arg(long)]
    pub primary_model: Option<String>,

    /// 二级检测模型
    #[arg(long)]
    pub secondary_model: Option<String>,

    /// 性能报告间隔 (毫秒)
    #[arg(long)]
    pub log_interval_ms: Option<u64>,

    /// 固定批大小
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// 固定一级 worker 数量
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// JSON 日志输出
    #[arg(long)]
    pub log_json: bool,

    /// 以 JSON 行打印性能报告
    #[arg(long)]
    pub report_json: bool,
}

impl Args {
    /// 默认值 → 配置文件 → 命令行, 最后校验
    pub fn load_config(&self) -> PipelineResult<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };
        self.apply_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut PipelineConfig) -> PipelineResult<()> {
        for arg in &self.streams {
            let (id, address) = parse_stream_arg(arg)?;
            config.streams.insert(id, address);
        }
        if let Some(model) = &self.primary_model {
            config.primary_model = model.clone();
        }
        if let Some(model) = &self.secondary_model {
            config.secondary_model = model.clone();
        }
        if let Some(ms) = self.log_interval_ms {
            config.log_interval_ms = ms;
        }
        if self.batch_size.is_some() {
            config.batch_size = self.batch_size;
        }
        if self.workers.is_some() {
            config.primary_workers = self.workers;
        }
        Ok(())
    }
}

/// 解析 `id=address`
pub fn parse_stream_arg(arg: &str) -> PipelineResult<(String, String)> {
    let (id, address) = arg
        .split_once('=')
        .ok_or_else(|| PipelineError::config(format!("expected id=address, got '{}'", arg)))?;
    let (id, address) = (id.trim(), address.trim());
    if id.is_empty() || address.is_empty() {
        return Err(PipelineError::config(format!("expected id=address, got '{}'", arg)));
    }
    Ok((id.to_string(), address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_stream() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.streams.insert("cam1".into(), "frames/cam1".into());
        config
    }

    #[test]
    fn test_defaults_match_service_constants() {
        let c = PipelineConfig::default();
        assert_eq!(c.frame_queue_capacity, 120);
        assert_eq!(c.result_queue_capacity, 120);
        assert_eq!(c.memory_fraction, 0.6);
        assert_eq!((c.min_batch, c.max_batch), (1, 16));
        assert_eq!((c.reserved_cores, c.max_primary_workers), (4, 2));
        assert_eq!(c.log_interval(), Duration::from_secs(5));
        assert_eq!(c.secondary, SecondaryConfig::default());
    }

    #[test]
    fn test_from_file_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"streams": {{"a": "rtsp://host/a"}}, "max_batch": 8, "#
        )
        .unwrap();
        write!(file, r#""secondary": {{"max_workers": 3}}}}"#).unwrap();

        let c = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(c.streams.get("a").map(String::as_str), Some("rtsp://host/a"));
        assert_eq!(c.max_batch, 8);
        assert_eq!(c.secondary.max_workers, 3);
        // 未给出的字段保持默认
        assert_eq!(c.secondary.min_workers, 1);
        assert_eq!(c.frame_queue_capacity, 120);
        c.validate().unwrap();
    }

    #[test]
    fn test_from_file_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(file.path()),
            Err(PipelineError::Json(_))
        ));
        assert!(matches!(
            PipelineConfig::from_file("/nonexistent/sentinel.json"),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rules() {
        assert!(PipelineConfig::default().validate().is_err());
        assert!(with_stream().validate().is_ok());

        let mut c = with_stream();
        c.frame_queue_capacity = 0;
        assert!(c.validate().is_err());

        let mut c = with_stream();
        c.memory_fraction = 0.0;
        assert!(c.validate().is_err());
        c.memory_fraction = 1.0;
        assert!(c.validate().is_ok());
        c.memory_fraction = 1.5;
        assert!(c.validate().is_err());

        let mut c = with_stream();
        c.min_batch = 4;
        c.max_batch = 2;
        assert!(c.validate().is_err());

        let mut c = with_stream();
        c.secondary.min_workers = 5;
        c.secondary.max_workers = 2;
        assert!(c.validate().is_err());

        let mut c = with_stream();
        c.secondary.min_workers = 0;
        c.secondary.max_workers = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_parse_stream_arg() {
        assert_eq!(
            parse_stream_arg("cam1=rtsp://u:p@host/x?a=b").unwrap(),
            ("cam1".to_string(), "rtsp://u:p@host/x?a=b".to_string())
        );
        assert!(parse_stream_arg("cam1").is_err());
        assert!(parse_stream_arg("=addr").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "sentinel",
            "--stream",
            "cam1=frames/a",
            "--stream",
            "cam2=frames/b",
            "--batch-size",
            "4",
            "--workers",
            "3",
            "--log-interval-ms",
            "1000",
        ]);
        let c = args.load_config().unwrap();
        assert_eq!(c.streams.len(), 2);
        assert_eq!(c.batch_size, Some(4));
        assert_eq!(c.primary_workers, Some(3));
        assert_eq!(c.log_interval_ms, 1000);

        let settings = c.worker_settings(4);
        assert_eq!(settings.batch_size, 4);
        assert_eq!(settings.result_put_timeout, Duration::from_millis(100));
        assert_eq!(c.grabber_config().reconnect_after_failures, 30);
        assert_eq!(c.secondary_pool_config().person_class, "person");
    }
}
