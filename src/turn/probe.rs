//! Best-effort evidence of audio that is still rendering.
//!
//! Every source here is biased toward false positives: when in doubt a probe
//! reports audio remaining, which only delays the end-of-turn acknowledgement.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::audio::ring::RingStats;
use crate::config::ProbeConfig;

/// Turn state a probe may take into account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeContext {
    pub generation_ended: bool,
}

pub trait PlaybackProbe: Send {
    fn has_remaining_audio(&self, ctx: ProbeContext) -> bool;

    /// Time left on a short clip that is still rendering, if there is one.
    fn short_audio_remaining(&self) -> Option<Duration> {
        None
    }
}

/// Transport loading state of a rendering track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkState {
    #[default]
    Empty,
    Idle,
    Loading,
    NoSource,
}

/// Point-in-time view of one remote audio track as reported by its renderer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackSnapshot {
    pub position_secs: f64,
    /// `None` for an unbounded live stream.
    pub duration_secs: Option<f64>,
    /// End of every buffered range, in seconds.
    pub buffered_ends: Vec<f64>,
    pub paused: bool,
    pub ended: bool,
    /// 0..=4, with 2 meaning current data is available.
    pub ready_state: u8,
    pub network: NetworkState,
}

impl TrackSnapshot {
    /// Largest amount of buffered audio ahead of the playhead.
    #[must_use]
    pub fn buffered_ahead(&self) -> f64 {
        self.buffered_ends
            .iter()
            .map(|end| end - self.position_secs)
            .fold(0.0, f64::max)
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.duration_secs.is_none_or(|d| !d.is_finite())
    }

    /// Playhead is moving over real data.
    #[must_use]
    pub fn is_advancing(&self) -> bool {
        !self.paused && !self.ended && self.position_secs > 0.0 && self.ready_state >= 2
    }

    #[must_use]
    pub fn remaining_secs(&self) -> Option<f64> {
        self.duration_secs
            .filter(|d| d.is_finite())
            .map(|d| (d - self.position_secs).max(0.0))
    }

    #[must_use]
    pub fn is_active(&self, ctx: ProbeContext, config: &ProbeConfig) -> bool {
        let ahead = self.buffered_ahead();
        if ahead > config.buffered_ahead_epsilon() {
            return true;
        }

        // Loading with nothing buffered yet only counts while generation is
        // still running; afterwards it is usually a stale network state.
        if self.network == NetworkState::Loading && (ahead > 0.0 || !ctx.generation_ended) {
            return true;
        }

        if self.is_streaming() {
            return false;
        }

        let near_end = self
            .remaining_secs()
            .is_some_and(|r| self.position_secs > 0.0 && r < config.near_end_epsilon());
        self.is_advancing() && !near_end
    }
}

/// Probe over track snapshots pushed in by the transport layer.
///
/// Clones share one snapshot store: keep a clone to call [`TrackProbe::update`]
/// after handing the probe to a [`crate::turn::TurnMachine`].
#[derive(Clone)]
pub struct TrackProbe {
    tracks: Arc<RwLock<Vec<TrackSnapshot>>>,
    config: Arc<ProbeConfig>,
}

impl TrackProbe {
    #[must_use]
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            tracks: Arc::new(RwLock::new(Vec::new())),
            config: Arc::new(config),
        }
    }

    /// Replace every snapshot with the transport's latest view.
    pub fn update(&self, tracks: Vec<TrackSnapshot>) {
        *self.tracks.write().unwrap_or_else(PoisonError::into_inner) = tracks;
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<TrackSnapshot> {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PlaybackProbe for TrackProbe {
    fn has_remaining_audio(&self, ctx: ProbeContext) -> bool {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| t.is_active(ctx, &self.config))
    }

    fn short_audio_remaining(&self) -> Option<Duration> {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.is_advancing())
            .filter(|t| {
                t.duration_secs
                    .is_some_and(|d| d > 0.0 && d < self.config.short_audio_secs)
            })
            .filter_map(TrackSnapshot::remaining_secs)
            .filter(|&r| r > 0.0)
            .map(Duration::from_secs_f64)
            .max()
    }
}

/// Samples the scheduler is holding back from the ring.
#[derive(Debug, Default)]
pub struct PendingSamples(AtomicUsize);

impl PendingSamples {
    pub fn set(&self, samples: usize) {
        self.0.store(samples, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Probe over the engine's own buffers: unplayed ring audio plus whatever the
/// scheduler has not flushed yet.
pub struct RingProbe {
    stats: Arc<RingStats>,
    pending: Arc<PendingSamples>,
    sample_rate: u32,
    short_audio: Duration,
}

impl RingProbe {
    #[must_use]
    pub fn new(
        stats: Arc<RingStats>,
        pending: Arc<PendingSamples>,
        sample_rate: u32,
        config: &ProbeConfig,
    ) -> Self {
        Self {
            stats,
            pending,
            sample_rate,
            short_audio: Duration::from_secs_f64(config.short_audio_secs),
        }
    }

    fn unplayed(&self) -> usize {
        self.stats.unplayed() + self.pending.get()
    }
}

impl PlaybackProbe for RingProbe {
    fn has_remaining_audio(&self, _ctx: ProbeContext) -> bool {
        self.unplayed() > 0
    }

    fn short_audio_remaining(&self) -> Option<Duration> {
        let unplayed = self.unplayed();
        if unplayed == 0 || self.sample_rate == 0 {
            return None;
        }
        let remaining = Duration::from_secs_f64(unplayed as f64 / f64::from(self.sample_rate));
        (remaining < self.short_audio).then_some(remaining)
    }
}

/// Reports audio remaining if any inner probe does.
#[derive(Default)]
pub struct AnyProbe {
    probes: Vec<Box<dyn PlaybackProbe>>,
}

impl AnyProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, probe: impl PlaybackProbe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }
}

impl PlaybackProbe for AnyProbe {
    fn has_remaining_audio(&self, ctx: ProbeContext) -> bool {
        self.probes.iter().any(|p| p.has_remaining_audio(ctx))
    }

    fn short_audio_remaining(&self) -> Option<Duration> {
        self.probes
            .iter()
            .filter_map(|p| p.short_audio_remaining())
            .max()
    }
}
