/// Scoring backends and model discovery
///
/// The backend selector picks how model files are interpreted:
/// - `envelope`: JSON descriptors for a small energy-envelope scorer,
///   always available, used for bench runs and tests
/// - `rustpotter`: `.rpw` wake-word files, behind the `rustpotter` feature

use crate::audio_buffer::AudioSample;
use crate::scorer::{ScoreMap, ScorerError, WakeModel};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read model {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid model descriptor {path}: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },

    #[error("Backend '{0}' was not compiled into this build")]
    BackendUnavailable(InferenceBackend),

    #[error("Backend initialization failed: {0}")]
    Backend(String),

    #[error("Unknown inference backend: {0}")]
    UnknownBackend(String),
}

/// Inference backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Envelope,
    Rustpotter,
}

impl InferenceBackend {
    /// Model file extensions this backend loads, in preference order
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Envelope => &["json"],
            Self::Rustpotter => &["rpw"],
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope => write!(f, "envelope"),
            Self::Rustpotter => write!(f, "rustpotter"),
        }
    }
}

impl FromStr for InferenceBackend {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "envelope" => Ok(Self::Envelope),
            "rustpotter" => Ok(Self::Rustpotter),
            other => Err(ModelError::UnknownBackend(other.to_string())),
        }
    }
}

/// Find model files in the first candidate directory that has any.
///
/// Files are grouped by extension in the order given, sorted by name
/// within each group.
pub fn discover_model_files(dirs: &[PathBuf], extensions: &[&str]) -> Vec<PathBuf> {
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping model dir {}: {}", dir.display(), e);
                continue;
            }
        };

        let paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();

        let mut files = Vec::new();
        for ext in extensions {
            let mut group: Vec<PathBuf> = paths
                .iter()
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(*ext))
                .cloned()
                .collect();
            group.sort();
            files.extend(group);
        }

        if !files.is_empty() {
            debug!("Found {} model files in {}", files.len(), dir.display());
            return files;
        }
    }

    Vec::new()
}

/// Build the model for `backend` from already-resolved files
pub fn load_model(
    backend: InferenceBackend,
    files: &[PathBuf],
    threshold: f32,
) -> Result<Box<dyn WakeModel>, ModelError> {
    for file in files {
        if !file.is_file() {
            return Err(ModelError::NotFound(file.clone()));
        }
    }

    info!("Loading {} models with backend '{}'", files.len(), backend);

    match backend {
        InferenceBackend::Envelope => Ok(Box::new(EnvelopeModel::from_files(files)?)),
        #[cfg(feature = "rustpotter")]
        InferenceBackend::Rustpotter => {
            Ok(Box::new(rustpotter_backend::RustpotterModel::from_files(files, threshold)?))
        }
        #[cfg(not(feature = "rustpotter"))]
        InferenceBackend::Rustpotter => {
            let _ = threshold;
            Err(ModelError::BackendUnavailable(backend))
        }
    }
}

fn label_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Descriptor for one envelope label
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeDescriptor {
    /// Reported label; defaults to the file stem
    #[serde(default)]
    pub label: Option<String>,

    /// Frame RMS (fraction of full scale) that maps to score 1.0
    pub full_scale_rms: f32,

    /// Number of frames averaged
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_window() -> usize {
    3
}

struct EnvelopeLabel {
    label: String,
    full_scale_rms: f32,
    window: usize,
    history: VecDeque<f32>,
}

/// Energy-envelope scorer.
///
/// Each label scores the moving average of recent frame RMS against its
/// own full-scale level, clamped to [0, 1]. The moving window is the
/// model's rolling context.
pub struct EnvelopeModel {
    labels: Vec<EnvelopeLabel>,
}

impl EnvelopeModel {
    pub fn new(descriptors: Vec<(String, EnvelopeDescriptor)>) -> Self {
        let labels = descriptors
            .into_iter()
            .map(|(label, d)| EnvelopeLabel {
                label,
                full_scale_rms: d.full_scale_rms,
                window: d.window.max(1),
                history: VecDeque::with_capacity(d.window.max(1)),
            })
            .collect();

        Self { labels }
    }

    pub fn from_files(files: &[PathBuf]) -> Result<Self, ModelError> {
        let mut descriptors = Vec::with_capacity(files.len());

        for path in files {
            let raw = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
                path: path.clone(),
                source,
            })?;

            let descriptor: EnvelopeDescriptor =
                serde_json::from_str(&raw).map_err(|e| ModelError::InvalidDescriptor {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;

            if !descriptor.full_scale_rms.is_finite() || descriptor.full_scale_rms <= 0.0 {
                return Err(ModelError::InvalidDescriptor {
                    path: path.clone(),
                    reason: "full_scale_rms must be positive".to_string(),
                });
            }

            let label = descriptor
                .label
                .clone()
                .unwrap_or_else(|| label_from_path(path));
            debug!("Envelope label '{}' from {}", label, path.display());
            descriptors.push((label, descriptor));
        }

        Ok(Self::new(descriptors))
    }
}

impl WakeModel for EnvelopeModel {
    fn labels(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.label.clone()).collect()
    }

    fn predict(&mut self, frame: &[AudioSample]) -> Result<ScoreMap, ScorerError> {
        if frame.is_empty() {
            return Err(ScorerError::Inference("empty frame".to_string()));
        }

        let sum_squares: f64 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f64 / 32768.0;
                normalized * normalized
            })
            .sum();
        let level = (sum_squares / frame.len() as f64).sqrt() as f32;

        let mut scores = ScoreMap::with_capacity(self.labels.len());
        for entry in &mut self.labels {
            if entry.history.len() == entry.window {
                entry.history.pop_front();
            }
            entry.history.push_back(level);

            let mean = entry.history.iter().sum::<f32>() / entry.window as f32;
            scores.insert(entry.label.clone(), (mean / entry.full_scale_rms).clamp(0.0, 1.0));
        }

        Ok(scores)
    }

    fn reset(&mut self) {
        for entry in &mut self.labels {
            entry.history.clear();
        }
    }
}

#[cfg(feature = "rustpotter")]
mod rustpotter_backend {
    use super::{label_from_path, ModelError};
    use crate::audio_buffer::{AudioSample, SAMPLE_RATE};
    use crate::scorer::{ScoreMap, ScorerError, WakeModel};
    use rustpotter::{Rustpotter, RustpotterConfig, SampleFormat};
    use std::path::PathBuf;
    use tracing::info;

    /// `.rpw` wake-word files scored by rustpotter.
    ///
    /// rustpotter consumes its own frame size, so incoming frames are
    /// re-buffered; the best detection over the consumed chunks is
    /// reported for the frame.
    pub struct RustpotterModel {
        detector: Rustpotter,
        labels: Vec<String>,
        pending: Vec<f32>,
        samples_per_frame: usize,
    }

    impl RustpotterModel {
        pub fn from_files(files: &[PathBuf], threshold: f32) -> Result<Self, ModelError> {
            let mut config = RustpotterConfig::default();
            config.fmt.sample_rate = SAMPLE_RATE;
            config.fmt.channels = 1;
            config.fmt.sample_format = SampleFormat::F32;
            config.detector.threshold = threshold;

            let mut detector = Rustpotter::new(&config).map_err(|e| ModelError::Backend(e.to_string()))?;

            let mut labels = Vec::with_capacity(files.len());
            for path in files {
                let label = label_from_path(path);
                detector
                    .add_wakeword_from_file(&label, &path.to_string_lossy())
                    .map_err(|e| ModelError::Backend(format!("{}: {}", path.display(), e)))?;
                info!("Loaded wake-word '{}' from {}", label, path.display());
                labels.push(label);
            }

            let samples_per_frame = detector.get_samples_per_frame();

            Ok(Self {
                detector,
                labels,
                pending: Vec::with_capacity(samples_per_frame * 2),
                samples_per_frame,
            })
        }
    }

    impl WakeModel for RustpotterModel {
        fn labels(&self) -> Vec<String> {
            self.labels.clone()
        }

        fn predict(&mut self, frame: &[AudioSample]) -> Result<ScoreMap, ScorerError> {
            if self.samples_per_frame == 0 {
                return Err(ScorerError::Inference("detector reports zero frame size".into()));
            }

            self.pending.extend(frame.iter().map(|&s| s as f32 / 32768.0));

            let mut scores: ScoreMap = self.labels.iter().map(|l| (l.clone(), 0.0)).collect();

            while self.pending.len() >= self.samples_per_frame {
                let chunk: Vec<f32> = self.pending.drain(..self.samples_per_frame).collect();
                if let Some(detection) = self.detector.process_samples(chunk) {
                    let entry = scores.entry(detection.name.clone()).or_insert(0.0);
                    *entry = entry.max(detection.score);
                }
            }

            Ok(scores)
        }

        fn reset(&mut self) {
            self.pending.clear();
            self.detector.reset();
        }
    }

}

#[cfg(feature = "rustpotter")]
pub use rustpotter_backend::RustpotterModel;
