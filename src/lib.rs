/// Wake-word relay library
///
/// Listens to a 16 kHz microphone stream, scores fixed-size frames with a
/// wake-word model and hands each confirmed detection to a downstream
/// consumer over UDP, staying deaf until the consumer reports the session
/// is done.

pub mod audio_buffer;
pub mod capture;
pub mod config;
pub mod detector;
pub mod handoff;
pub mod models;
pub mod noise_gate;
pub mod notifier;
pub mod pipeline;
pub mod protocol;
pub mod scorer;

// Re-export main types
pub use audio_buffer::{AudioFrame, AudioSample, Resegmenter, SAMPLE_RATE, VAD_FRAME};
pub use capture::{pick_input_device, read_wav_mono, CaptureControl, CaptureError, MicCapture, WavReplay};
pub use config::{ConfigError, RelayConfig, ResumeMode};
pub use detector::{DetectionPolicy, DetectionState, DetectorError, WakeEvent};
pub use handoff::{
    AckChannel, FixedDelay, HandoffCoordinator, HandoffError, HandoffState, HandoffStats, ResumeReason,
    ResumeTrigger,
};
pub use models::{discover_model_files, load_model, EnvelopeModel, InferenceBackend, ModelError};
pub use noise_gate::{GateDecision, NoiseGate, NoiseGateError};
pub use notifier::{Notifier, NotifierError};
pub use pipeline::{BlockStatus, CaptureSignals, CaptureSink, Flow, FramePipeline, PipelineStats};
pub use protocol::Message;
pub use scorer::{ScoreMap, Scorer, ScorerError, WakeModel};
