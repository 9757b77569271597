//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Semantically invalid value (e.g. an unknown codec in a profile)
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Encoding pipeline behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Sources longer than this (seconds) are split into chunks
    #[serde(default = "default_chunkize_video_duration")]
    pub chunkize_video_duration: u64,
    /// Target length of each chunk (seconds)
    #[serde(default = "default_video_chunks_duration")]
    pub video_chunks_duration: u64,
    /// Resolutions encoded even when the source is smaller
    #[serde(default = "default_minimum_resolutions")]
    pub minimum_resolutions_to_encode: Vec<u32>,
    /// Global switch for chunked encoding
    #[serde(default = "default_true")]
    pub chunkize: bool,
}

fn default_chunkize_video_duration() -> u64 {
    300
}

fn default_video_chunks_duration() -> u64 {
    240
}

fn default_minimum_resolutions() -> Vec<u32> {
    vec![240, 360]
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunkize_video_duration: default_chunkize_video_duration(),
            video_chunks_duration: default_video_chunks_duration(),
            minimum_resolutions_to_encode: default_minimum_resolutions(),
            chunkize: true,
        }
    }
}

/// Locations of persisted state and artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root of the artifact store
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,
    /// Directory holding media and job records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Scratch space for in-progress encodes
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Optional drop folder scanned for new uploads
    #[serde(default)]
    pub inbox: Option<PathBuf>,
}

fn default_media_root() -> PathBuf {
    PathBuf::from("./media")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_temp_dir() -> PathBuf {
    env::temp_dir().join("encode-pipeline")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_root: default_media_root(),
            state_dir: default_state_dir(),
            temp_dir: default_temp_dir(),
            inbox: None,
        }
    }
}

/// Local worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Maximum concurrent work units (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// ffmpeg threads per encode (0 = auto-derive)
    #[serde(default)]
    pub threads_per_job: u32,
    /// How many times a failed whole-file encode is re-dispatched
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    1
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            max_concurrent_jobs: 0,
            threads_per_job: 0,
            max_retries: default_max_retries(),
        }
    }
}

/// External tool locations and time bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_encode_timeout")]
    pub encode_timeout_secs: u64,
    #[serde(default = "default_concat_timeout")]
    pub concat_timeout_secs: u64,
    #[serde(default = "default_fs_timeout")]
    pub fs_timeout_secs: u64,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout() -> u64 {
    60
}

fn default_encode_timeout() -> u64 {
    86_400
}

fn default_concat_timeout() -> u64 {
    1_800
}

fn default_fs_timeout() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            probe_timeout_secs: default_probe_timeout(),
            encode_timeout_secs: default_encode_timeout(),
            concat_timeout_secs: default_concat_timeout(),
            fs_timeout_secs: default_fs_timeout(),
        }
    }
}

/// HTTP callback/status server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Base URL workers use to report back
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_callback_base_url() -> String {
    "http://127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            callback_base_url: default_callback_base_url(),
        }
    }
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by RUST_LOG
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

/// An encode profile as written in the config file.
///
/// Values are validated into typed profiles by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    pub id: u32,
    pub name: String,
    pub extension: String,
    #[serde(default)]
    pub resolution: Option<u32>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl ProfileConfig {
    fn new(id: u32, name: &str, extension: &str, resolution: Option<u32>, codec: Option<&str>) -> Self {
        Self {
            id,
            name: name.to_string(),
            extension: extension.to_string(),
            resolution,
            codec: codec.map(str::to_string),
            active: true,
        }
    }
}

/// Profile set used when the config file has no `[[profiles]]` entries
pub fn default_profiles() -> Vec<ProfileConfig> {
    vec![
        ProfileConfig::new(1, "preview", "gif", None, None),
        ProfileConfig::new(2, "h264-240", "mp4", Some(240), Some("h264")),
        ProfileConfig::new(3, "h264-360", "mp4", Some(360), Some("h264")),
        ProfileConfig::new(4, "h264-480", "mp4", Some(480), Some("h264")),
        ProfileConfig::new(5, "h264-720", "mp4", Some(720), Some("h264")),
        ProfileConfig::new(6, "h264-1080", "mp4", Some(1080), Some("h264")),
        ProfileConfig::new(7, "h265-1080", "mp4", Some(1080), Some("h265")),
        ProfileConfig::new(8, "vp9-720", "webm", Some(720), Some("vp9")),
    ]
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            workers: WorkersConfig::default(),
            tools: ToolsConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            profiles: default_profiles(),
        }
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.video_chunks_duration == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.video_chunks_duration must be greater than zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate profile id {}",
                    profile.id
                )));
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Unparseable values are ignored and the existing value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PIPELINE_CHUNKIZE_VIDEO_DURATION") {
            if let Ok(secs) = val.parse::<u64>() {
                self.pipeline.chunkize_video_duration = secs;
            }
        }

        if let Ok(val) = env::var("PIPELINE_VIDEO_CHUNKS_DURATION") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs > 0 {
                    self.pipeline.video_chunks_duration = secs;
                }
            }
        }

        if let Ok(val) = env::var("PIPELINE_MINIMUM_RESOLUTIONS") {
            let parsed: Result<Vec<u32>, _> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse::<u32>)
                .collect();
            if let Ok(resolutions) = parsed {
                self.pipeline.minimum_resolutions_to_encode = resolutions;
            }
        }

        if let Ok(val) = env::var("PIPELINE_CHUNKIZE") {
            if let Some(enabled) = parse_bool(&val) {
                self.pipeline.chunkize = enabled;
            }
        }

        if let Ok(val) = env::var("STORAGE_MEDIA_ROOT") {
            if !val.is_empty() {
                self.storage.media_root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("STORAGE_STATE_DIR") {
            if !val.is_empty() {
                self.storage.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("WORKERS_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.workers.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("WORKERS_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.workers.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("SERVER_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("SERVER_CALLBACK_BASE_URL") {
            if !val.is_empty() {
                self.server.callback_base_url = val;
            }
        }

        if let Ok(val) = env::var("FFMPEG_COMMAND") {
            if !val.is_empty() {
                self.tools.ffmpeg = val;
            }
        }

        if let Ok(val) = env::var("FFPROBE_COMMAND") {
            if !val.is_empty() {
                self.tools.ffprobe = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but falls back to defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
