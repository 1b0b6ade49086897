use rollcall_core::DEFAULT_RECOGNITION_THRESHOLD;
use rollcall_sched::{Admission, SchedulerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown admission mode {0:?} (expected \"queue\" or \"single_slot\")")]
    Admission(String),
    #[error(transparent)]
    Scheduler(#[from] rollcall_sched::ConfigError),
}

/// Daemon configuration: an optional TOML file, overridden by `ROLLCALL_*`
/// environment variables, over built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON file with enrolled signatures.
    pub gallery_path: PathBuf,
    /// External model command; receives a PNG frame on stdin and prints a
    /// JSON signature array (or `null`) on stdout.
    pub extractor_command: Vec<String>,
    /// Expected signature dimensionality, if the deployment pins one.
    pub signature_dim: Option<usize>,
    /// Maximum Euclidean distance for an accepted match.
    pub recognition_threshold: f32,
    pub scheduler: SchedulerConfig,
    /// Frame file re-read on every poll tick (single-slot capture loops).
    pub poll_frame_path: Option<PathBuf>,
    pub poll_interval: Duration,
}

/// On-disk shape of `ROLLCALL_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    recognition_threshold: Option<f32>,
    scheduler: Option<SchedulerConfig>,
    daemon: DaemonSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DaemonSection {
    gallery_path: Option<PathBuf>,
    extractor_command: Option<Vec<String>>,
    signature_dim: Option<usize>,
    poll_frame_path: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
}

impl Config {
    /// Load `ROLLCALL_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default_paths(),
        };
        config.apply_env()?;
        config.scheduler.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        let mut config = Self::default_paths();
        if let Some(threshold) = file.recognition_threshold {
            config.recognition_threshold = threshold;
        }
        if let Some(scheduler) = file.scheduler {
            config.scheduler = scheduler;
        }
        let daemon = file.daemon;
        if let Some(path) = daemon.gallery_path {
            config.gallery_path = path;
        }
        if let Some(cmd) = daemon.extractor_command {
            config.extractor_command = cmd;
        }
        config.signature_dim = daemon.signature_dim.or(config.signature_dim);
        config.poll_frame_path = daemon.poll_frame_path.or(config.poll_frame_path);
        if let Some(ms) = daemon.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }

    fn default_paths() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            gallery_path: data_dir.join("gallery.json"),
            extractor_command: vec!["rollcall-extract".to_string()],
            signature_dim: Some(128),
            recognition_threshold: DEFAULT_RECOGNITION_THRESHOLD,
            scheduler: SchedulerConfig::default(),
            poll_frame_path: None,
            poll_interval: Duration::from_millis(1000),
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("ROLLCALL_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(path);
        }
        if let Ok(cmd) = std::env::var("ROLLCALL_EXTRACTOR_CMD") {
            self.extractor_command = cmd.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(dim) = std::env::var("ROLLCALL_SIGNATURE_DIM") {
            // "0" disables the dimensionality check.
            self.signature_dim = dim.parse().ok().filter(|d: &usize| *d > 0);
        }
        if let Ok(mode) = std::env::var("ROLLCALL_ADMISSION") {
            let admission = parse_admission(&mode)?;
            if admission == Admission::SingleSlot && self.scheduler.admission != admission {
                self.scheduler = SchedulerConfig {
                    cooldown_after_success_ms: self.scheduler.cooldown_after_success_ms,
                    cooldown_after_failure_ms: self.scheduler.cooldown_after_failure_ms,
                    ..SchedulerConfig::single_slot()
                };
            }
            self.scheduler.admission = admission;
        }
        if let Ok(path) = std::env::var("ROLLCALL_POLL_FRAME") {
            self.poll_frame_path = Some(PathBuf::from(path));
        }

        self.recognition_threshold =
            env_f32("ROLLCALL_RECOGNITION_THRESHOLD", self.recognition_threshold);
        let s = &mut self.scheduler;
        s.min_time_between_detections_ms =
            env_u64("ROLLCALL_MIN_TIME_BETWEEN_MS", s.min_time_between_detections_ms);
        s.max_queue_size = env_usize("ROLLCALL_MAX_QUEUE_SIZE", s.max_queue_size);
        s.cooldown_after_success_ms =
            env_u64("ROLLCALL_COOLDOWN_SUCCESS_MS", s.cooldown_after_success_ms);
        s.cooldown_after_failure_ms =
            env_u64("ROLLCALL_COOLDOWN_FAILURE_MS", s.cooldown_after_failure_ms);
        s.max_retries_per_minute =
            env_usize("ROLLCALL_MAX_RETRIES_PER_MINUTE", s.max_retries_per_minute);
        self.poll_interval = Duration::from_millis(env_u64(
            "ROLLCALL_POLL_INTERVAL_MS",
            self.poll_interval.as_millis() as u64,
        ));
        Ok(())
    }
}

fn parse_admission(mode: &str) -> Result<Admission, ConfigError> {
    match mode.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "queue" => Ok(Admission::Queue),
        "single_slot" => Ok(Admission::SingleSlot),
        _ => Err(ConfigError::Admission(mode.to_string())),
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
