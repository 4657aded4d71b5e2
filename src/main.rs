/// Wake-word relay service binary
///
/// Listens for wake-words and relays each detection to the downstream
/// voice consumer over UDP.

use anyhow::{bail, Context};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wakeword_relay::{
    discover_model_files, load_model, AckChannel, CaptureControl, CaptureSignals, CaptureSink, DetectionPolicy,
    FixedDelay, FramePipeline, HandoffCoordinator, MicCapture, NoiseGate, Notifier, RelayConfig, Resegmenter,
    ResumeMode, ResumeTrigger, Scorer, WavReplay,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakeword_relay=info".parse().unwrap()),
        )
        .init();

    info!("Starting wake-word relay");

    // Load configuration
    let config = match RelayConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    // Model and frame pipeline
    let pipeline = match build_pipeline(&config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to load wake-word models: {:#}", e);
            error!(
                "Put model files in one of {:?} or list them in WAKE_MODELS",
                config.model_dirs
            );
            std::process::exit(1);
        }
    };

    let signals = CaptureSignals::new();
    let (sink, mut events) = CaptureSink::new(pipeline, signals.clone());

    // Notification and acknowledgment sockets
    let notifier = match Notifier::bind(config.bind_addr, config.notify_addr).await {
        Ok(notifier) => notifier,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let trigger = match build_trigger(&config, &notifier).await {
        Ok(trigger) => trigger,
        Err(e) => {
            error!("Failed to set up session handoff: {:#}", e);
            std::process::exit(1);
        }
    };

    let mut coordinator = HandoffCoordinator::new(notifier, trigger, signals);

    // Audio input
    let mut capture: Box<dyn CaptureControl> = match open_capture(&config, sink) {
        Ok(capture) => capture,
        Err(e) => {
            error!("Failed to open audio input: {:#}", e);
            error!(
                "If running in Docker, pass --device /dev/snd --group-add audio, or set WAKE_INPUT_DEVICE"
            );
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
        ctrl_c.cancel();
    });

    info!(
        "Listening (threshold {:.2}, cooldown {:?}, consumer {})",
        config.threshold,
        config.cooldown(),
        config.notify_addr
    );

    coordinator.run(capture.as_mut(), &mut events, shutdown).await;

    drop(capture);
    info!("Wake-word relay stopped");
}

fn build_pipeline(config: &RelayConfig) -> anyhow::Result<FramePipeline> {
    let files = resolve_model_files(config)?;
    let model = load_model(config.backend, &files, config.threshold)?;

    let labels = if config.labels.is_empty() {
        model.labels()
    } else {
        config.labels.clone()
    };
    info!("Wake labels: {:?}", labels);

    let gate = NoiseGate::new(config.noise_floor)?;
    let policy = DetectionPolicy::new(config.threshold, config.cooldown(), labels)?;

    Ok(FramePipeline::new(
        gate,
        Resegmenter::with_frame_len(config.frame_samples),
        Scorer::with_frame_len(model, config.frame_samples),
        policy,
    ))
}

fn resolve_model_files(config: &RelayConfig) -> anyhow::Result<Vec<PathBuf>> {
    if !config.models.is_empty() {
        return Ok(config.models.clone());
    }

    let files = discover_model_files(&config.model_dirs, config.backend.extensions());
    if files.is_empty() {
        bail!(
            "no {:?} model files found for backend '{}'",
            config.backend.extensions(),
            config.backend
        );
    }

    for file in &files {
        info!("Model: {}", file.display());
    }
    Ok(files)
}

async fn build_trigger(config: &RelayConfig, notifier: &Notifier) -> anyhow::Result<Box<dyn ResumeTrigger>> {
    let trigger: Box<dyn ResumeTrigger> = match (config.resume_mode, config.ack_bind) {
        (ResumeMode::Fixed, _) => {
            warn!(
                "Fixed-delay resume: listening restarts after {:?} regardless of the consumer",
                config.handoff_delay()
            );
            Box::new(FixedDelay::new(config.handoff_delay()))
        }
        (ResumeMode::Ack, Some(addr)) => Box::new(
            AckChannel::bind(addr, config.session_max_wait(), config.ack_poll())
                .await
                .context("dedicated acknowledgment socket")?,
        ),
        (ResumeMode::Ack, None) => Box::new(AckChannel::on_notifier(
            notifier,
            config.session_max_wait(),
            config.ack_poll(),
        )?),
    };
    Ok(trigger)
}

fn open_capture(config: &RelayConfig, sink: CaptureSink) -> anyhow::Result<Box<dyn CaptureControl>> {
    match &config.input_wav {
        Some(path) => {
            let replay = WavReplay::spawn(path, config.block_samples(), true, sink)
                .with_context(|| format!("replaying {}", path.display()))?;
            Ok(Box::new(replay))
        }
        None => {
            let mic = MicCapture::open(config.input_device.as_deref(), config.block_samples(), sink)?;
            info!("Capturing from {}", mic.device_name());
            Ok(Box::new(mic))
        }
    }
}
