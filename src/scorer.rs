/// Scorer adapter
///
/// Wraps a wake-word model behind a fixed-frame `score()` call. The model
/// keeps rolling context across calls, so frames must arrive in order and
/// `reset()` must run whenever listening resumes after a pause.

use crate::audio_buffer::{AudioFrame, AudioSample, VAD_FRAME};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Label -> score for one frame
pub type ScoreMap = HashMap<String, f32>;

#[derive(Error, Debug)]
pub enum ScorerError {
    #[error("Frame length mismatch: expected {expected} samples, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    #[error("Unexpected model output: {0}")]
    UnexpectedOutput(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A stateful wake-word model.
#[cfg_attr(test, mockall::automock)]
pub trait WakeModel: Send {
    /// Labels this model can report, in configuration order
    fn labels(&self) -> Vec<String>;

    /// Score one frame of `VAD_FRAME` samples
    fn predict(&mut self, frame: &[AudioSample]) -> Result<ScoreMap, ScorerError>;

    /// Clear rolling context. Models without state can ignore it.
    fn reset(&mut self) {}
}

pub struct Scorer {
    model: Box<dyn WakeModel>,
    frame_len: usize,
    failures: u64,
}

impl Scorer {
    pub fn new(model: Box<dyn WakeModel>) -> Self {
        Self::with_frame_len(model, VAD_FRAME)
    }

    pub fn with_frame_len(model: Box<dyn WakeModel>, frame_len: usize) -> Self {
        Self {
            model,
            frame_len,
            failures: 0,
        }
    }

    /// Score a frame. Any model failure is logged and reported as `None`,
    /// which callers treat as "no detection this frame".
    pub fn score(&mut self, frame: &AudioFrame) -> Option<ScoreMap> {
        match self.try_score(frame) {
            Ok(scores) => Some(scores),
            Err(e) => {
                self.failures += 1;
                warn!("Scoring failed (#{}): {}", self.failures, e);
                None
            }
        }
    }

    fn try_score(&mut self, frame: &AudioFrame) -> Result<ScoreMap, ScorerError> {
        if frame.len() != self.frame_len {
            return Err(ScorerError::FrameLength {
                expected: self.frame_len,
                actual: frame.len(),
            });
        }

        let scores = self.model.predict(frame.samples())?;

        if let Some((label, score)) = scores.iter().find(|(_, s)| !s.is_finite()) {
            return Err(ScorerError::UnexpectedOutput(format!(
                "non-finite score {} for '{}'",
                score, label
            )));
        }

        Ok(scores)
    }

    pub fn reset(&mut self) {
        self.model.reset();
        debug!("Scorer state reset");
    }

    pub fn labels(&self) -> Vec<String> {
        self.model.labels()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}
