/// Capture-callback processing
///
/// Everything here runs in the capture callback context: noise gate,
/// re-segmentation, scoring and the detection policy. It is the only
/// writer of the carry buffer, the cooldown state and the scorer's rolling
/// context. The handoff coordinator talks to it only through
/// `CaptureSignals`.

use crate::audio_buffer::{AudioSample, Resegmenter};
use crate::detector::{DetectionPolicy, WakeEvent};
use crate::noise_gate::{GateDecision, NoiseGate};
use crate::scorer::Scorer;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Per-block status reported by the capture backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    /// Overrun or backend error; the block is not audio
    Glitch,
}

/// What the callback should do after a block
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    /// A detection was confirmed; capture must stop
    Stop(WakeEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub blocks: u64,
    pub dropped_blocks: u64,
    pub gated_blocks: u64,
    pub frames_scored: u64,
    pub scoring_failures: u64,
    pub detections: u64,
}

pub struct FramePipeline {
    gate: NoiseGate,
    segmenter: Resegmenter,
    scorer: Scorer,
    policy: DetectionPolicy,
    pcm: Vec<AudioSample>,
    stats: PipelineStats,
}

impl FramePipeline {
    pub fn new(gate: NoiseGate, segmenter: Resegmenter, scorer: Scorer, policy: DetectionPolicy) -> Self {
        Self {
            gate,
            segmenter,
            scorer,
            policy,
            pcm: Vec::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Process one capture block.
    ///
    /// Stops at the first confirmed detection: remaining frames of the
    /// block and the carried tail are discarded, so nothing captured
    /// before the handoff leaks into the next session.
    pub fn process_block(&mut self, block: &[f32], status: BlockStatus, now: Instant) -> Flow {
        self.stats.blocks += 1;

        if status == BlockStatus::Glitch {
            self.stats.dropped_blocks += 1;
            debug!("Dropping block of {} samples (capture glitch)", block.len());
            return Flow::Continue;
        }

        if self.gate.apply(block, &mut self.pcm) == GateDecision::Closed {
            self.stats.gated_blocks += 1;
        }

        let Self {
            segmenter,
            scorer,
            policy,
            pcm,
            stats,
            ..
        } = self;

        let flow = segmenter.feed(pcm, |frame| {
            let Some(scores) = scorer.score(&frame) else {
                stats.scoring_failures += 1;
                return ControlFlow::Continue(());
            };
            stats.frames_scored += 1;

            if stats.frames_scored % 1000 == 0 {
                debug!(
                    "Scored {} frames, {} detections, {} dropped blocks",
                    stats.frames_scored, stats.detections, stats.dropped_blocks
                );
            }

            match policy.evaluate(&scores, now) {
                Some(event) => ControlFlow::Break(event),
                None => ControlFlow::Continue(()),
            }
        });

        match flow {
            ControlFlow::Continue(()) => Flow::Continue,
            ControlFlow::Break(event) => {
                self.stats.detections += 1;
                self.segmenter.clear();
                Flow::Stop(event)
            }
        }
    }

    /// Clear the scorer's rolling context and any carried samples
    pub fn reset(&mut self) {
        self.scorer.reset();
        self.segmenter.clear();
    }

    pub fn carry_len(&self) -> usize {
        self.segmenter.carry_len()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn policy(&self) -> &DetectionPolicy {
        &self.policy
    }
}

/// Flags shared between the capture callback and the coordinator
#[derive(Debug, Default)]
pub struct CaptureSignals {
    suspended: AtomicBool,
    reset_pending: AtomicBool,
    glitch: AtomicBool,
}

impl CaptureSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    /// Request a scorer reset before the next frame, then let blocks in
    pub fn resume_with_reset(&self) {
        self.reset_pending.store(true, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::SeqCst)
    }

    fn take_reset(&self) -> bool {
        self.reset_pending.swap(false, Ordering::SeqCst)
    }

    /// Mark the next block as a glitch (called from backend error paths)
    pub fn raise_glitch(&self) {
        self.glitch.store(true, Ordering::SeqCst);
    }

    fn take_glitch(&self) -> bool {
        self.glitch.swap(false, Ordering::SeqCst)
    }
}

/// The capture backend's per-block callback target.
///
/// Owns the pipeline; a detection suspends the sink within the same call,
/// so later blocks are ignored even before the backend actually stops.
pub struct CaptureSink {
    pipeline: FramePipeline,
    signals: Arc<CaptureSignals>,
    events: mpsc::UnboundedSender<WakeEvent>,
}

impl CaptureSink {
    pub fn new(
        pipeline: FramePipeline,
        signals: Arc<CaptureSignals>,
    ) -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                pipeline,
                signals,
                events,
            },
            rx,
        )
    }

    /// Feed one block; never blocks and never panics on pipeline errors
    pub fn on_block(&mut self, block: &[f32], status: BlockStatus) {
        if self.signals.is_suspended() {
            trace!("Ignoring block while suspended");
            return;
        }

        if self.signals.take_reset() {
            self.pipeline.reset();
        }

        let status = if self.signals.take_glitch() {
            BlockStatus::Glitch
        } else {
            status
        };

        if let Flow::Stop(event) = self.pipeline.process_block(block, status, Instant::now()) {
            self.signals.suspend();
            if self.events.send(event).is_err() {
                error!("Handoff coordinator is gone; wake event dropped");
            }
        }
    }

    pub fn signals(&self) -> Arc<CaptureSignals> {
        Arc::clone(&self.signals)
    }

    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }
}

impl Drop for CaptureSink {
    fn drop(&mut self) {
        let stats = self.pipeline.stats();
        if stats.blocks > 0 {
            debug!("Capture sink closed: {:?}", stats);
        }
        if self.pipeline.carry_len() > 0 {
            warn!("Discarding {} carried samples at shutdown", self.pipeline.carry_len());
        }
    }
}
