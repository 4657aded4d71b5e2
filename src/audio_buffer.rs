/// Frame re-segmentation
///
/// Capture blocks arrive at whatever size the backend delivers. The scorer
/// needs fixed `VAD_FRAME`-sample frames in strict temporal order, so the
/// re-segmenter keeps the unconsumed tail in a carry buffer and slices
/// frames off its head.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::ops::{ControlFlow, Deref};
use tracing::{debug, trace};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

pub const SAMPLE_RATE: usize = 16000;

/// Samples per scored frame: 32ms at 16kHz
pub const VAD_FRAME: usize = 512;

/// One fixed-length frame, handed to the scorer exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Vec<AudioSample>);

impl AudioFrame {
    pub fn samples(&self) -> &[AudioSample] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<AudioSample> {
        self.0
    }
}

impl Deref for AudioFrame {
    type Target = [AudioSample];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Re-chunks arbitrary-length PCM into `frame_len`-sample frames.
///
/// The carry ring holds at most two frames. Blocks larger than the free
/// space are pushed in pieces, popping frames in between, so any block
/// length is accepted without dropping samples.
pub struct Resegmenter {
    producer: HeapProd<AudioSample>,
    consumer: HeapCons<AudioSample>,
    frame_len: usize,
    frames_emitted: u64,
}

impl Resegmenter {
    /// Create a re-segmenter for the default `VAD_FRAME` size
    pub fn new() -> Self {
        Self::with_frame_len(VAD_FRAME)
    }

    pub fn with_frame_len(frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        debug!("Creating re-segmenter with frame length: {} samples", frame_len);

        let (producer, consumer) = HeapRb::<AudioSample>::new(frame_len * 2).split();

        Self {
            producer,
            consumer,
            frame_len,
            frames_emitted: 0,
        }
    }

    /// Append `samples` to the carry buffer and hand every complete frame
    /// to `on_frame`, oldest first.
    ///
    /// If `on_frame` breaks, the remaining input of this call is not
    /// consumed and the break value is returned. Callers that stop on a
    /// break are expected to `clear()` before feeding again.
    pub fn feed<B, F>(&mut self, samples: &[AudioSample], mut on_frame: F) -> ControlFlow<B>
    where
        F: FnMut(AudioFrame) -> ControlFlow<B>,
    {
        let mut rest = samples;

        loop {
            let pushed = self.producer.push_slice(rest);
            rest = &rest[pushed..];

            while self.consumer.occupied_len() >= self.frame_len {
                let mut frame = vec![0; self.frame_len];
                let read = self.consumer.pop_slice(&mut frame);
                debug_assert_eq!(read, self.frame_len);

                self.frames_emitted += 1;
                trace!("Emitting frame #{}", self.frames_emitted);

                if let ControlFlow::Break(stop) = on_frame(AudioFrame(frame)) {
                    return ControlFlow::Break(stop);
                }
            }

            if rest.is_empty() {
                return ControlFlow::Continue(());
            }
        }
    }

    /// Number of carried samples not yet part of a frame
    pub fn carry_len(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Drop the carried tail without emitting it
    pub fn clear(&mut self) {
        let carried = self.consumer.occupied_len();
        self.consumer.skip(carried);
        if carried > 0 {
            debug!("Discarded {} carried samples", carried);
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }
}

impl Default for Resegmenter {
    fn default() -> Self {
        Self::new()
    }
}
