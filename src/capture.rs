/// Audio capture backends
///
/// Both backends drive a `CaptureSink` with mono f32 blocks at 16 kHz:
/// - `MicCapture`: a cpal input stream
/// - `WavReplay`: a WAV file replayed on a worker thread

use crate::audio_buffer::SAMPLE_RATE;
use crate::pipeline::{BlockStatus, CaptureSink};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, FromSample, Host, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedBufferSize,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No input audio device found")]
    NoDevice,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Failed to read WAV file {path}: {source}")]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("Unsupported WAV file {path}: {reason}")]
    UnsupportedWav { path: PathBuf, reason: String },
}

/// Stop/start control used by the handoff coordinator
#[cfg_attr(test, mockall::automock)]
pub trait CaptureControl {
    fn pause(&mut self) -> Result<(), CaptureError>;
    fn resume(&mut self) -> Result<(), CaptureError>;
}

/// A device as seen by the selection logic
struct Candidate<D> {
    name: String,
    has_input: bool,
    device: D,
}

/// Preferred name substring, then the default input, then the first
/// device reporting any input configuration.
fn choose_device<D>(candidates: Vec<Candidate<D>>, default: Option<D>, preferred: Option<&str>) -> Option<D> {
    let mut candidates = candidates;

    if let Some(wanted) = preferred.map(str::to_lowercase) {
        if let Some(pos) = candidates
            .iter()
            .position(|c| c.has_input && c.name.to_lowercase().contains(&wanted))
        {
            return Some(candidates.swap_remove(pos).device);
        }
        warn!("No input device matching '{}'", wanted);
    }

    if default.is_some() {
        return default;
    }

    candidates.into_iter().find(|c| c.has_input).map(|c| c.device)
}

/// Pick the capture device on `host`
pub fn pick_input_device(host: &Host, preferred: Option<&str>) -> Option<Device> {
    let candidates = match host.input_devices() {
        Ok(devices) => devices
            .map(|device| Candidate {
                name: device.name().unwrap_or_default(),
                has_input: device
                    .supported_input_configs()
                    .map(|mut configs| configs.next().is_some())
                    .unwrap_or(false),
                device,
            })
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate input devices: {}", e);
            Vec::new()
        }
    };

    let device = choose_device(candidates, host.default_input_device(), preferred)?;
    info!("Using input device: {}", device.name().unwrap_or_else(|_| "<unnamed>".into()));
    Some(device)
}

/// Microphone capture on a cpal input stream
pub struct MicCapture {
    stream: Stream,
    device_name: String,
}

impl MicCapture {
    /// Open and start the stream; blocks go straight into `sink`.
    pub fn open(preferred: Option<&str>, block_samples: usize, sink: CaptureSink) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = pick_input_device(&host, preferred).ok_or(CaptureError::NoDevice)?;
        let device_name = device.name().unwrap_or_default();

        let (stream_config, sample_format) = Self::find_config(&device, block_samples)?;
        info!(
            "Capture config: {} Hz, {} ch, {:?}, buffer {:?}",
            stream_config.sample_rate.0, stream_config.channels, sample_format, stream_config.buffer_size
        );

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &stream_config, block_samples, sink)?,
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &stream_config, block_samples, sink)?,
            format => {
                return Err(CaptureError::Device(format!("Unsupported sample format: {:?}", format)));
            }
        };

        stream
            .play()
            .map_err(|e| CaptureError::Stream(format!("Failed to start stream: {}", e)))?;

        Ok(Self { stream, device_name })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// 16 kHz input, preferring mono f32 and a fixed block-sized buffer
    fn find_config(device: &Device, block_samples: usize) -> Result<(StreamConfig, SampleFormat), CaptureError> {
        let rate = SampleRate(SAMPLE_RATE as u32);

        let best = device
            .supported_input_configs()
            .map_err(|e| CaptureError::Device(format!("Failed to query configs: {}", e)))?
            .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
            .filter(|range| matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16))
            .min_by_key(|range| {
                (
                    range.channels() != 1,
                    range.sample_format() != SampleFormat::F32,
                    range.channels(),
                )
            })
            .ok_or_else(|| CaptureError::Device(format!("Device does not support {} Hz input", SAMPLE_RATE)))?;

        let frames = block_samples as u32;
        let buffer_size = match best.buffer_size() {
            SupportedBufferSize::Range { min, max } if *min <= frames && frames <= *max => BufferSize::Fixed(frames),
            _ => {
                debug!("Fixed buffer of {} frames unsupported, using device default", frames);
                BufferSize::Default
            }
        };

        let stream_config = StreamConfig {
            channels: best.channels(),
            sample_rate: rate,
            buffer_size,
        };

        Ok((stream_config, best.sample_format()))
    }

    fn build_stream<T>(
        device: &Device,
        config: &StreamConfig,
        block_samples: usize,
        mut sink: CaptureSink,
    ) -> Result<Stream, CaptureError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels as usize;
        let signals = sink.signals();
        let mut mono: Vec<f32> = Vec::with_capacity(block_samples);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    if channels == 1 {
                        mono.extend(data.iter().map(|s| s.to_sample::<f32>()));
                    } else {
                        mono.extend(data.chunks(channels).map(|frame| {
                            frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                        }));
                    }
                    sink.on_block(&mono, BlockStatus::Ok);
                },
                move |err| {
                    warn!("Capture stream error: {}", err);
                    signals.raise_glitch();
                },
                None,
            )
            .map_err(|e| CaptureError::Stream(format!("Failed to build input stream: {}", e)))
    }
}

impl CaptureControl for MicCapture {
    fn pause(&mut self) -> Result<(), CaptureError> {
        self.stream
            .pause()
            .map_err(|e| CaptureError::Stream(format!("Failed to pause stream: {}", e)))
    }

    fn resume(&mut self) -> Result<(), CaptureError> {
        self.stream
            .play()
            .map_err(|e| CaptureError::Stream(format!("Failed to resume stream: {}", e)))
    }
}

/// Read a 16 kHz WAV file as mono f32 in [-1, 1]
pub fn read_wav_mono(path: &Path) -> Result<Vec<f32>, CaptureError> {
    let wav_err = |source| CaptureError::Wav {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();

    if spec.sample_rate as usize != SAMPLE_RATE {
        return Err(CaptureError::UnsupportedWav {
            path: path.to_path_buf(),
            reason: format!("sample rate {} Hz, expected {}", spec.sample_rate, SAMPLE_RATE),
        });
    }
    if spec.channels == 0 {
        return Err(CaptureError::UnsupportedWav {
            path: path.to_path_buf(),
            reason: "no channels".into(),
        });
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(wav_err)?
        }
    };

    let channels = spec.channels as usize;
    if channels == 1 {
        return Ok(interleaved);
    }

    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect())
}

/// Replays a WAV file into a `CaptureSink` in block-sized chunks
pub struct WavReplay {
    paused: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavReplay {
    const PAUSE_POLL: Duration = Duration::from_millis(10);

    /// Start replaying `path`. With `paced`, blocks are spaced at real time.
    pub fn spawn(path: &Path, block_samples: usize, paced: bool, sink: CaptureSink) -> Result<Self, CaptureError> {
        let samples = read_wav_mono(path)?;
        info!(
            "Replaying {} ({:.1} s) in blocks of {}",
            path.display(),
            samples.len() as f32 / SAMPLE_RATE as f32,
            block_samples
        );
        Self::spawn_samples(samples, block_samples, paced, sink)
    }

    pub fn spawn_samples(
        samples: Vec<f32>,
        block_samples: usize,
        paced: bool,
        mut sink: CaptureSink,
    ) -> Result<Self, CaptureError> {
        let block_samples = block_samples.max(1);
        let block_time = Duration::from_secs_f64(block_samples as f64 / SAMPLE_RATE as f64);

        let paused = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let worker_paused = Arc::clone(&paused);
        let worker_stop = Arc::clone(&stop);

        let worker = thread::Builder::new()
            .name("wav-replay".into())
            .spawn(move || {
                for block in samples.chunks(block_samples) {
                    while worker_paused.load(Ordering::SeqCst) {
                        if worker_stop.load(Ordering::SeqCst) {
                            return;
                        }
                        thread::sleep(Self::PAUSE_POLL);
                    }
                    if worker_stop.load(Ordering::SeqCst) {
                        return;
                    }

                    sink.on_block(block, BlockStatus::Ok);

                    if paced {
                        thread::sleep(block_time);
                    }
                }
                info!("WAV replay finished");
            })
            .map_err(|e| CaptureError::Stream(format!("Failed to start replay thread: {}", e)))?;

        Ok(Self {
            paused,
            stop,
            worker: Some(worker),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }
}

impl CaptureControl for WavReplay {
    fn pause(&mut self) -> Result<(), CaptureError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), CaptureError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for WavReplay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("WAV replay thread panicked");
            }
        }
    }
}
