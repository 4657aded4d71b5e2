/// Relay configuration
///
/// Defaults, then an optional JSON file named by `WAKE_CONFIG`, then
/// individual `WAKE_*` overrides.

use crate::audio_buffer::{SAMPLE_RATE, VAD_FRAME};
use crate::detector::{DEFAULT_COOLDOWN, DEFAULT_THRESHOLD};
use crate::handoff::{DEFAULT_ACK_POLL, DEFAULT_SESSION_MAX_WAIT};
use crate::models::InferenceBackend;
use crate::noise_gate::DEFAULT_NOISE_FLOOR;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Environment variable naming an optional JSON config file
pub const CONFIG_FILE_VAR: &str = "WAKE_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How a suspended session returns to listening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Wait for `session_done`, bounded by the session max wait
    Ack,
    /// Resume after a fixed delay without acknowledgment
    Fixed,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ack" => Ok(Self::Ack),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("expected 'ack' or 'fixed', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub sample_rate: u32,
    pub block_ms: u64,
    pub frame_samples: usize,
    pub threshold: f32,
    pub cooldown_ms: u64,
    pub session_max_wait_s: u64,
    pub ack_poll_ms: u64,
    pub resume_mode: ResumeMode,
    pub handoff_delay_ms: u64,
    pub notify_addr: SocketAddr,
    pub bind_addr: SocketAddr,
    /// Dedicated acknowledgment socket; `None` listens on the notifier's
    pub ack_bind: Option<SocketAddr>,
    pub noise_floor: f32,
    pub model_dirs: Vec<PathBuf>,
    /// Explicit model files, bypassing discovery
    pub models: Vec<PathBuf>,
    /// Tie-break scan order
    pub labels: Vec<String>,
    pub backend: InferenceBackend,
    pub input_device: Option<String>,
    /// Replay this WAV file instead of opening a microphone
    pub input_wav: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE as u32,
            block_ms: 50,
            frame_samples: VAD_FRAME,
            threshold: DEFAULT_THRESHOLD,
            cooldown_ms: DEFAULT_COOLDOWN.as_millis() as u64,
            session_max_wait_s: DEFAULT_SESSION_MAX_WAIT.as_secs(),
            ack_poll_ms: DEFAULT_ACK_POLL.as_millis() as u64,
            resume_mode: ResumeMode::Ack,
            handoff_delay_ms: 8000,
            notify_addr: SocketAddr::from(([127, 0, 0, 1], 3939)),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ack_bind: None,
            noise_floor: DEFAULT_NOISE_FLOOR,
            model_dirs: vec![PathBuf::from("models")],
            models: Vec::new(),
            labels: Vec::new(),
            backend: InferenceBackend::Envelope,
            input_device: None,
            input_wav: None,
        }
    }
}

impl RelayConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_VAR).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };

        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("WAKE_SAMPLE_RATE") {
            config.sample_rate = parse("WAKE_SAMPLE_RATE", &v)?;
        }
        if let Some(v) = get("WAKE_BLOCK_MS") {
            config.block_ms = parse("WAKE_BLOCK_MS", &v)?;
        }
        if let Some(v) = get("WAKE_FRAME_SAMPLES") {
            config.frame_samples = parse("WAKE_FRAME_SAMPLES", &v)?;
        }
        if let Some(v) = get("WAKE_THRESHOLD") {
            config.threshold = parse("WAKE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("WAKE_COOLDOWN_MS") {
            config.cooldown_ms = parse("WAKE_COOLDOWN_MS", &v)?;
        }
        if let Some(v) = get("WAKE_SESSION_MAX_WAIT_S") {
            config.session_max_wait_s = parse("WAKE_SESSION_MAX_WAIT_S", &v)?;
        }
        if let Some(v) = get("WAKE_ACK_POLL_MS") {
            config.ack_poll_ms = parse("WAKE_ACK_POLL_MS", &v)?;
        }
        if let Some(v) = get("WAKE_RESUME_MODE") {
            config.resume_mode = parse("WAKE_RESUME_MODE", &v)?;
        }
        if let Some(v) = get("WAKE_HANDOFF_DELAY_MS") {
            config.handoff_delay_ms = parse("WAKE_HANDOFF_DELAY_MS", &v)?;
        }
        if let Some(v) = get("WAKE_NOTIFY_ADDR") {
            config.notify_addr = parse("WAKE_NOTIFY_ADDR", &v)?;
        }
        if let Some(v) = get("WAKE_BIND_ADDR") {
            config.bind_addr = parse("WAKE_BIND_ADDR", &v)?;
        }
        if let Some(v) = get("WAKE_ACK_BIND") {
            config.ack_bind = Some(parse("WAKE_ACK_BIND", &v)?);
        }
        if let Some(v) = get("WAKE_NOISE_FLOOR") {
            config.noise_floor = parse("WAKE_NOISE_FLOOR", &v)?;
        }
        if let Some(v) = get("WAKE_MODEL_DIRS") {
            config.model_dirs = split_list(&v).map(PathBuf::from).collect();
        }
        if let Some(v) = get("WAKE_MODELS") {
            config.models = split_list(&v).map(PathBuf::from).collect();
        }
        if let Some(v) = get("WAKE_LABELS") {
            config.labels = split_list(&v).map(str::to_string).collect();
        }
        if let Some(v) = get("WAKE_BACKEND") {
            config.backend = parse("WAKE_BACKEND", &v)?;
        }
        if let Some(v) = get("WAKE_INPUT_DEVICE") {
            config.input_device = Some(v);
        }
        if let Some(v) = get("WAKE_INPUT_WAV") {
            config.input_wav = Some(PathBuf::from(v));
        }

        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let body = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&body).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate as usize != SAMPLE_RATE {
            return Err(ConfigError::Invalid(format!(
                "sample rate must be {} Hz, got {}",
                SAMPLE_RATE, self.sample_rate
            )));
        }

        if self.frame_samples == 0 {
            return Err(ConfigError::Invalid("frame size must be > 0".into()));
        }

        if self.block_samples() == 0 {
            return Err(ConfigError::Invalid(format!(
                "block of {} ms holds no samples",
                self.block_ms
            )));
        }

        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::Invalid(format!("threshold {} out of range", self.threshold)));
        }

        if !self.noise_floor.is_finite() || self.noise_floor < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "noise floor {} out of range",
                self.noise_floor
            )));
        }

        if self.ack_poll_ms == 0 {
            return Err(ConfigError::Invalid("ack poll slice must be > 0".into()));
        }

        if self.session_max_wait_s == 0 {
            return Err(ConfigError::Invalid("session max wait must be > 0".into()));
        }

        if self.resume_mode == ResumeMode::Fixed && self.handoff_delay_ms == 0 {
            return Err(ConfigError::Invalid("fixed resume mode needs a non-zero delay".into()));
        }

        Ok(())
    }

    /// Samples per capture block
    pub fn block_samples(&self) -> usize {
        (self.sample_rate as u64 * self.block_ms / 1000) as usize
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn session_max_wait(&self) -> Duration {
        Duration::from_secs(self.session_max_wait_s)
    }

    pub fn ack_poll(&self) -> Duration {
        Duration::from_millis(self.ack_poll_ms)
    }

    pub fn handoff_delay(&self) -> Duration {
        Duration::from_millis(self.handoff_delay_ms)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
