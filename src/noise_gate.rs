/// Noise gate
///
/// Zeroes capture blocks whose RMS falls below a fixed floor before they
/// are converted to 16-bit PCM, so the scorer sees digital silence instead
/// of room noise. Stateless, no look-ahead.

use crate::audio_buffer::AudioSample;
use thiserror::Error;
use tracing::trace;

/// Default gate floor as a fraction of full scale
pub const DEFAULT_NOISE_FLOOR: f32 = 0.0015;

#[derive(Error, Debug)]
pub enum NoiseGateError {
    #[error("Invalid noise floor: {0}")]
    InvalidFloor(f32),
}

/// Outcome for one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Block passed through, scaled to int16
    Open,

    /// Block was below the floor and replaced with zeros
    Closed,
}

#[derive(Debug, Clone)]
pub struct NoiseGate {
    floor: f32,
}

impl NoiseGate {
    pub fn new(floor: f32) -> Result<Self, NoiseGateError> {
        if !floor.is_finite() || floor < 0.0 {
            return Err(NoiseGateError::InvalidFloor(floor));
        }
        Ok(Self { floor })
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    /// Gate `block` and write the int16 result into `out` (cleared first).
    pub fn apply(&self, block: &[f32], out: &mut Vec<AudioSample>) -> GateDecision {
        out.clear();

        let level = rms(block);
        if level < self.floor {
            trace!("Gate closed: rms={:.5} floor={:.5}", level, self.floor);
            out.resize(block.len(), 0);
            return GateDecision::Closed;
        }

        out.extend(block.iter().map(|&s| to_pcm16(s)));
        GateDecision::Open
    }
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self {
            floor: DEFAULT_NOISE_FLOOR,
        }
    }
}

/// Root-mean-square amplitude; 0 for an empty block
pub fn rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = block.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / block.len() as f64).sqrt() as f32
}

/// Scale to the int16 range and hard-clip
fn to_pcm16(sample: f32) -> AudioSample {
    (sample * 32768.0).clamp(-32768.0, 32767.0) as AudioSample
}
