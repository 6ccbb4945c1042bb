//! Configuration management for the tracking worker.
//!
//! Configuration is layered: optional files under `config/`, then environment
//! variables prefixed with `WORKER` (e.g. `WORKER__QUEUE__QUEUE_URL`).

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the worker service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// AWS client settings shared by every client
    #[serde(default)]
    pub aws: AwsConfig,

    /// Work queue and lease settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Object store transfer settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backoff policy for every remote call
    #[serde(default)]
    pub retry: RetryConfig,

    /// Frame pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Detection model settings
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Prometheus exporter port, disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for LocalStack, MinIO, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Force path-style S3 access
    #[serde(default)]
    pub force_path_style: bool,
}

/// Work queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue URL; when absent it is read from the parameter store
    #[serde(default)]
    pub queue_url: Option<String>,

    /// Parameter store name holding the queue URL
    #[serde(default = "default_queue_url_parameter")]
    pub queue_url_parameter: String,

    /// Long-poll wait per receive call in seconds
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    /// Visibility timeout requested at receive time in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// How often the frame loop renews the lease, in seconds
    #[serde(default = "default_extension_interval_secs")]
    pub extension_interval_secs: u64,

    /// Visibility window set by each renewal, in seconds
    #[serde(default = "default_extension_duration_secs")]
    pub extension_duration_secs: u64,

    /// Sleep after an empty poll in milliseconds
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Sleep after a loop-level failure in seconds
    #[serde(default = "default_error_sleep_secs")]
    pub error_sleep_secs: u64,

    /// Queue that receives `{video, json}` completion messages
    #[serde(default)]
    pub completion_queue_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Key prefix for uploaded results
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Delay between existence checks after an upload, in milliseconds
    #[serde(default = "default_confirm_poll_interval_ms")]
    pub confirm_poll_interval_ms: u64,

    /// Existence checks before an upload is declared invisible
    #[serde(default = "default_confirm_max_attempts")]
    pub confirm_max_attempts: u32,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_factor")]
    pub base_factor: f64,

    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,

    /// Ceiling on the total time spent retrying one call
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Root directory for per-message scratch directories
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Keep only detections with this label; keep everything when unset
    #[serde(default = "default_label_filter")]
    pub label_filter: Option<String>,

    /// Produce and upload an annotated video
    #[serde(default = "default_true")]
    pub save_video: bool,

    /// Detection confidence threshold
    #[serde(default = "default_confidence")]
    pub confidence: f32,

    /// Overlap threshold for suppression
    #[serde(default = "default_iou")]
    pub iou: f32,

    /// Object key extensions treated as videos (case-insensitive)
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    /// Longest wait for the decoder to open a file or produce the next frame
    #[serde(default = "default_decode_timeout_secs")]
    pub decode_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Path to the ONNX detection model
    #[serde(default)]
    pub path: String,

    /// Label file, one class name per line
    #[serde(default)]
    pub labels_path: Option<PathBuf>,

    /// Square input size expected by the model
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    #[serde(default)]
    pub use_gpu: bool,

    #[serde(default)]
    pub device_id: i32,
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

fn default_service_name() -> String {
    "vidtrack-worker".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_queue_url_parameter() -> String {
    "/video-analytics/newvideo-sqs".to_string()
}
fn default_wait_time_secs() -> u64 {
    20
}
fn default_visibility_timeout_secs() -> u64 {
    900
}
fn default_extension_interval_secs() -> u64 {
    300
}
fn default_extension_duration_secs() -> u64 {
    900
}
fn default_idle_sleep_ms() -> u64 {
    1000
}
fn default_error_sleep_secs() -> u64 {
    5
}
fn default_output_prefix() -> String {
    "output/".to_string()
}
fn default_confirm_poll_interval_ms() -> u64 {
    5000
}
fn default_confirm_max_attempts() -> u32 {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_factor() -> f64 {
    2.0
}
fn default_initial_interval_ms() -> u64 {
    1000
}
fn default_max_interval_secs() -> u64 {
    30
}
fn default_max_elapsed_secs() -> u64 {
    300
}
fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("vidtrack")
}
fn default_label_filter() -> Option<String> {
    Some("person".to_string())
}
fn default_true() -> bool {
    true
}
fn default_confidence() -> f32 {
    0.2
}
fn default_iou() -> f32 {
    0.5
}
fn default_video_extensions() -> Vec<String> {
    vec!["mp4".to_string(), "avi".to_string(), "mov".to_string()]
}
fn default_decode_timeout_secs() -> u64 {
    30
}
fn default_input_size() -> u32 {
    640
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_url: None,
            queue_url_parameter: default_queue_url_parameter(),
            wait_time_secs: default_wait_time_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            extension_interval_secs: default_extension_interval_secs(),
            extension_duration_secs: default_extension_duration_secs(),
            idle_sleep_ms: default_idle_sleep_ms(),
            error_sleep_secs: default_error_sleep_secs(),
            completion_queue_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_prefix: default_output_prefix(),
            confirm_poll_interval_ms: default_confirm_poll_interval_ms(),
            confirm_max_attempts: default_confirm_max_attempts(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_factor: default_base_factor(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_secs: default_max_interval_secs(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            label_filter: default_label_filter(),
            save_video: true,
            confidence: default_confidence(),
            iou: default_iou(),
            video_extensions: default_video_extensions(),
            decode_timeout_secs: default_decode_timeout_secs(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            labels_path: None,
            input_size: default_input_size(),
            use_gpu: false,
            device_id: 0,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/default`
    /// 2. `config/{RUN_MODE}`
    /// 3. Environment variables prefixed with `WORKER`
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = ConfigBuilder::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("WORKER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pipeline.video_extensions"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.model.path.is_empty() {
            return Err(ConfigValidationError::MissingField("model.path".to_string()));
        }

        if self.model.input_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "model.input_size".to_string(),
                message: "Input size must be greater than 0".to_string(),
            });
        }

        if self.queue.queue_url.is_none() && self.queue.queue_url_parameter.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "queue.queue_url or queue.queue_url_parameter".to_string(),
            ));
        }

        // A renewal must land before the window set by the previous one closes,
        // with at least one full interval to spare for a slow frame.
        let min_duration = self.queue.extension_interval_secs.saturating_mul(2);
        if self.queue.extension_duration_secs < min_duration {
            return Err(ConfigValidationError::InvalidValue {
                field: "queue.extension_duration_secs".to_string(),
                message: "Must be at least twice queue.extension_interval_secs".to_string(),
            });
        }

        if self.queue.visibility_timeout_secs <= self.queue.extension_interval_secs {
            return Err(ConfigValidationError::InvalidValue {
                field: "queue.visibility_timeout_secs".to_string(),
                message: "Must be larger than queue.extension_interval_secs".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.pipeline.confidence) || self.pipeline.confidence == 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.confidence".to_string(),
                message: "Threshold must be in (0, 1]".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.pipeline.iou) || self.pipeline.iou == 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.iou".to_string(),
                message: "Threshold must be in (0, 1]".to_string(),
            });
        }

        if self.pipeline.video_extensions.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "pipeline.video_extensions".to_string(),
            ));
        }

        if self.pipeline.decode_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.decode_timeout_secs".to_string(),
                message: "Decode timeout must be greater than 0".to_string(),
            });
        }

        if self.retry.max_attempts == 0 || self.retry.base_factor < 1.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retry".to_string(),
                message: "max_attempts must be >= 1 and base_factor >= 1.0".to_string(),
            });
        }

        if self.storage.confirm_max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.confirm_max_attempts".to_string(),
                message: "At least one existence check is required".to_string(),
            });
        }

        Ok(())
    }
}

impl QueueConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn extension_interval(&self) -> Duration {
        Duration::from_secs(self.extension_interval_secs)
    }

    pub fn extension_duration(&self) -> Duration {
        Duration::from_secs(self.extension_duration_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn error_sleep(&self) -> Duration {
        Duration::from_secs(self.error_sleep_secs)
    }
}

impl PipelineConfig {
    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs)
    }
}

impl StorageConfig {
    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            aws: AwsConfig::default(),
            queue: QueueConfig {
                queue_url: Some("https://sqs.us-east-1.amazonaws.com/123/videos".to_string()),
                ..QueueConfig::default()
            },
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            pipeline: PipelineConfig::default(),
            model: ModelConfig {
                path: "models/yolov8n.onnx".to_string(),
                labels_path: None,
                input_size: 640,
                use_gpu: false,
                device_id: 0,
            },
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let queue = QueueConfig::default();
        assert_eq!(queue.extension_interval(), Duration::from_secs(300));
        assert_eq!(queue.extension_duration(), Duration::from_secs(900));
        assert_eq!(queue.queue_url_parameter, "/video-analytics/newvideo-sqs");

        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.label_filter.as_deref(), Some("person"));
        assert_eq!(pipeline.video_extensions, vec!["mp4", "avi", "mov"]);
    }

    #[test]
    fn test_missing_model_path() {
        let mut config = create_test_config();
        config.model.path = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_extension_duration_must_exceed_interval() {
        let mut config = create_test_config();
        config.queue.extension_duration_secs = config.queue.extension_interval_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_extension_duration_needs_safety_margin() {
        let mut config = create_test_config();
        config.queue.extension_interval_secs = 300;
        config.queue.extension_duration_secs = 301;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { ref field, .. })
                if field == "queue.extension_duration_secs"
        ));

        config.queue.extension_duration_secs = 600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut config = create_test_config();
        config.pipeline.confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.pipeline.iou = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_location_required() {
        let mut config = create_test_config();
        config.queue.queue_url = None;
        config.queue.queue_url_parameter = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }
}
