//! Client-side batching of decoded segments before they reach the ring buffer.
//!
//! A turn starts in a pre-buffer phase (flush on threshold or fallback delay,
//! whichever comes first) and switches to a steady-state phase after its first
//! flush (smaller batches, shorter idle delay). Segments merged into one flush
//! are joined with a linear cross-fade.

use std::time::{Duration, Instant};

use crate::config::SchedulerConfig;

/// One merged payload destined for a single ring buffer write.
#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub samples: Vec<f32>,
    /// First flush of the turn; playback is about to become audible.
    pub first: bool,
    pub segments: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prebuffer,
    Streaming,
}

pub struct ChunkScheduler {
    prebuffer_samples: usize,
    prebuffer_timeout: Duration,
    stream_chunk_samples: usize,
    merge_delay: Duration,
    fade_samples: usize,
    started: bool,
    pending: Vec<Vec<f32>>,
    pending_samples: usize,
    deadline: Option<Instant>,
    dropped: usize,
}

impl ChunkScheduler {
    #[must_use]
    pub fn new(config: &SchedulerConfig, sample_rate: u32) -> Self {
        let ms_to_samples = |ms: u64| (u64::from(sample_rate) * ms / 1000) as usize;

        Self {
            prebuffer_samples: ms_to_samples(config.prebuffer_ms),
            prebuffer_timeout: Duration::from_millis(config.prebuffer_timeout_ms),
            stream_chunk_samples: ms_to_samples(config.stream_chunk_ms),
            merge_delay: Duration::from_millis(config.merge_delay_ms),
            fade_samples: config.fade_samples,
            started: false,
            pending: Vec::new(),
            pending_samples: 0,
            deadline: None,
            dropped: 0,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        if self.started {
            Phase::Streaming
        } else {
            Phase::Prebuffer
        }
    }

    /// When the pending batch must be flushed even if no threshold is crossed.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub const fn pending_samples(&self) -> usize {
        self.pending_samples
    }

    /// Segments lost to decode failures since the last reset.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }

    pub const fn record_drop(&mut self) {
        self.dropped += 1;
    }

    /// Queue a decoded segment, flushing if a size threshold is crossed.
    pub fn push(&mut self, segment: Vec<f32>, now: Instant) -> Option<Flush> {
        if segment.is_empty() {
            return None;
        }

        self.pending_samples += segment.len();
        self.pending.push(segment);

        if self.started {
            if self.pending_samples >= self.stream_chunk_samples {
                return self.flush();
            }
            if self.deadline.is_none() {
                self.deadline = Some(now + self.merge_delay);
            }
        } else {
            if self.pending.len() == 1 {
                self.deadline = Some(now + self.prebuffer_timeout);
            }
            if self.pending_samples >= self.prebuffer_samples {
                return self.flush();
            }
        }

        None
    }

    /// Flush if the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<Flush> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// End of turn: flush everything and start the next turn in pre-buffer.
    pub fn finish(&mut self) -> Option<Flush> {
        let flush = self.flush();
        self.started = false;
        flush
    }

    /// Drop pending audio without flushing.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_samples = 0;
        self.deadline = None;
        self.started = false;
        self.dropped = 0;
    }

    fn flush(&mut self) -> Option<Flush> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }

        let segments = std::mem::take(&mut self.pending);
        let count = segments.len();
        let first = !self.started;
        self.pending_samples = 0;
        self.started = true;

        Some(Flush {
            samples: merge(segments, self.fade_samples, first),
            first,
            segments: count,
        })
    }
}

/// Concatenate segments, cross-fading each join over `fade` samples.
///
/// Joins overlap, so the result is shorter than the sum of the inputs by the
/// total overlap. The first segment fades in from silence when `fade_in` is
/// set and the tail of the result always fades out.
#[must_use]
pub fn merge(segments: Vec<Vec<f32>>, fade: usize, fade_in: bool) -> Vec<f32> {
    let total = segments.iter().map(Vec::len).sum();
    let mut out: Vec<f32> = Vec::with_capacity(total);
    let mut last_len = 0;

    for (i, mut segment) in segments.into_iter().enumerate() {
        if i == 0 {
            if fade_in {
                fade_in_head(&mut segment, fade);
            }
            out.extend_from_slice(&segment);
        } else {
            let overlap = fade.min(out.len()).min(segment.len());
            let start = out.len() - overlap;
            for j in 0..overlap {
                let t = ramp_position(j, overlap);
                out[start + j] = out[start + j].mul_add(1.0 - t, segment[j] * t);
            }
            out.extend_from_slice(&segment[overlap..]);
        }
        last_len = segment.len();
    }

    let tail = fade.min(last_len);
    fade_out_tail(&mut out, tail);
    out
}

/// 0.0 at `j == 0`, 1.0 at `j == len - 1`.
fn ramp_position(j: usize, len: usize) -> f32 {
    if len <= 1 {
        1.0
    } else {
        j as f32 / (len - 1) as f32
    }
}

fn fade_in_head(samples: &mut [f32], fade: usize) {
    let len = fade.min(samples.len());
    for (j, sample) in samples.iter_mut().take(len).enumerate() {
        *sample *= ramp_position(j, len);
    }
}

fn fade_out_tail(samples: &mut [f32], fade: usize) {
    let len = fade.min(samples.len());
    let start = samples.len() - len;
    for (j, sample) in samples[start..].iter_mut().enumerate() {
        *sample *= ramp_position(len - 1 - j, len);
    }
}
