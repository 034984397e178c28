//! Turn lifecycle tracking.
//!
//! [`TurnMachine`] reconciles three unreliable sources (per-participant
//! speaking activity, generation markers from the peer and playback evidence
//! from a [`PlaybackProbe`]) into a single end-of-turn decision. It is
//! synchronous and never sleeps: callers pass the current [`Instant`] in and
//! drain [`Effect`]s out, realising timers with a [`timer::TimerWheel`] and
//! feeding expiries back through [`TurnMachine::timer_fired`].

pub mod probe;
pub mod round;
pub mod signal;
pub mod timer;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::{SilenceProfile, TurnConfig};

use self::probe::{PlaybackProbe, ProbeContext};
use self::round::RoundHistory;
use self::signal::TurnSignal;
use self::timer::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Initializing,
    Listening,
    Thinking,
    Talking,
    /// Moderation stopped the session. Terminal until [`TurnMachine::reset`].
    Forbidden,
    Ended,
}

impl Phase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Forbidden | Self::Ended)
    }

    /// No audible output has been produced for the current turn yet.
    const fn awaits_audio(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Connecting | Self::Initializing | Self::Thinking
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Talking => "talking",
            Self::Forbidden => "forbidden",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Side effects requested by the machine, in the order they were produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send the end-of-turn acknowledgement to the peer.
    SendEndOfTurn,
    Schedule { id: TimerId, after: Duration },
    Cancel(TimerId),
    /// Silence (`true`) or restore (`false`) inbound remote audio.
    MuteRemoteAudio(bool),
    /// Drop everything buffered for playback.
    StopPlayback,
    PhaseChanged { from: Phase, to: Phase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckStage {
    /// First check after the silence timeout (or a drained ring).
    Settle,
    /// Further clear checks until the required count is reached.
    Confirm,
    /// Last check before committing.
    Final,
    /// First check on the generation-end path while audio was still playing.
    GenerationEndSettle,
    /// Periodic check while the probe still reports audio.
    Recheck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TimerKind {
    Silence(String),
    Check(CheckStage),
}

/// The authoritative per-session turn state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnState {
    pub phase: Phase,
    pub generation_ended: bool,
    pub generation_ended_at: Option<Instant>,
    pub has_audio_this_round: bool,
    /// An acknowledgement is outstanding (not yet confirmed by the peer).
    pub end_ack_sent: bool,
    /// When the last acknowledgement went out; survives the peer's confirmation.
    pub end_ack_at: Option<Instant>,
    /// An acknowledgement went out since the last generation-start.
    pub acked_this_round: bool,
    pub muted_for_interrupt: bool,
    pub speaking: HashMap<String, bool>,
    pub confirmations: u32,
}

impl TurnState {
    #[must_use]
    pub fn anyone_speaking(&self) -> bool {
        self.speaking.values().any(|&active| active)
    }
}

pub struct TurnMachine {
    config: TurnConfig,
    probe: Box<dyn PlaybackProbe>,
    state: TurnState,
    rounds: RoundHistory,
    timers: HashMap<TimerId, TimerKind>,
    silence_timers: HashMap<String, TimerId>,
    check_timer: Option<TimerId>,
    next_timer: TimerId,
    effects: VecDeque<Effect>,
}

impl TurnMachine {
    #[must_use]
    pub fn new(config: TurnConfig, probe: Box<dyn PlaybackProbe>) -> Self {
        let rounds = RoundHistory::new(config.round_history);
        Self {
            config,
            probe,
            state: TurnState::default(),
            rounds,
            timers: HashMap::new(),
            silence_timers: HashMap::new(),
            check_timer: None,
            next_timer: 0,
            effects: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> &TurnState {
        &self.state
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.state.phase
    }

    #[must_use]
    pub const fn rounds(&self) -> &RoundHistory {
        &self.rounds
    }

    /// Take every effect produced since the last call.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    /// Transport connection started.
    pub fn connect(&mut self) {
        if self.state.phase == Phase::Idle {
            self.set_phase(Phase::Connecting);
        }
    }

    /// Return to `Idle`, dropping all state and timers.
    pub fn reset(&mut self) {
        self.cancel_all_timers();
        let from = self.state.phase;
        self.state = TurnState::default();
        self.rounds.clear();
        if from != Phase::Idle {
            self.effects.push_back(Effect::PhaseChanged {
                from,
                to: Phase::Idle,
            });
        }
    }

    pub fn handle_signal(&mut self, signal: TurnSignal, now: Instant) {
        if self.state.phase.is_terminal() {
            tracing::debug!("ignoring {signal} in {} phase", self.state.phase);
            return;
        }

        match signal {
            TurnSignal::ModelReady => self.set_phase(Phase::Initializing),
            TurnSignal::ModelInitFailed | TurnSignal::PeerExit => {
                tracing::info!("session ended by {signal}");
                self.cancel_all_timers();
                self.set_phase(Phase::Ended);
            }
            TurnSignal::SessionReady => self.on_session_ready(),
            TurnSignal::ActivityDetected => self.on_activity_detected(),
            TurnSignal::GenerationStart => self.on_generation_start(now),
            TurnSignal::AudioBeginHint => self.on_audio_begin_hint(now),
            TurnSignal::GenerationEnd => self.on_generation_end(now),
            TurnSignal::ModerationBlock => {
                tracing::warn!("moderation block received");
                self.cancel_all_timers();
                self.set_phase(Phase::Forbidden);
            }
            TurnSignal::AckConfirmed => self.on_ack_confirmed(),
            TurnSignal::InterruptRequested => self.on_interrupt(),
        }
    }

    /// Per-participant speaking activity from the transport.
    pub fn speaking_changed(&mut self, participant: &str, speaking: bool, now: Instant) {
        if self.state.phase.is_terminal() {
            return;
        }
        if self.state.muted_for_interrupt {
            tracing::debug!("muted after interrupt, ignoring speaking={speaking} from {participant}");
            return;
        }

        if speaking {
            if self.is_stale(now) {
                tracing::warn!(
                    "speaking from {participant} right after end-of-turn, treating as a delayed packet"
                );
                return;
            }

            if let Some(id) = self.silence_timers.remove(participant) {
                self.cancel_timer(id);
            }
            self.state.speaking.insert(participant.to_string(), true);
            self.rounds.mark_first_packet(Some(participant), now);
            self.begin_audio();
        } else {
            if let Some(id) = self.silence_timers.remove(participant) {
                self.cancel_timer(id);
            }
            // The participant stays marked as speaking until the quiet period
            // has elapsed without new activity.
            let id = self.schedule(
                TimerKind::Silence(participant.to_string()),
                self.profile().timeout(),
            );
            self.silence_timers.insert(participant.to_string(), id);
        }
    }

    /// An audio payload for the current turn arrived from the transport.
    pub fn audio_arrived(&mut self, now: Instant) {
        if self.state.muted_for_interrupt || self.state.phase.is_terminal() {
            return;
        }
        self.state.has_audio_this_round = true;
        self.rounds.mark_first_packet(None, now);
    }

    /// Every payload of the round failed to decode, so nothing will play.
    ///
    /// If generation already ended while waiting for that audio, the turn is
    /// finished the same way as one that never carried audio.
    pub fn audio_lost(&mut self, now: Instant) {
        if self.state.muted_for_interrupt
            || self.state.phase.is_terminal()
            || !self.state.has_audio_this_round
        {
            return;
        }
        tracing::warn!("no payload of this round could be decoded");
        self.state.has_audio_this_round = false;
        if self.state.generation_ended && matches!(self.state.phase, Phase::Thinking | Phase::Listening) {
            self.finish_empty_turn(now);
        }
    }

    /// The first samples of a turn were handed to the output.
    pub fn playback_started(&mut self, now: Instant) {
        if self.state.muted_for_interrupt || self.state.phase.is_terminal() {
            return;
        }
        if self.is_stale(now) {
            tracing::warn!("playback right after end-of-turn, treating as delayed audio");
            return;
        }
        self.rounds.mark_first_play(now);
        self.begin_audio();
    }

    /// The output buffer ran dry after upstream finished.
    pub fn playback_drained(&mut self, now: Instant) {
        if self.state.muted_for_interrupt || self.check_timer.is_some() || !self.may_commit() {
            return;
        }
        tracing::debug!("playback drained, starting end-of-turn confirmation");
        let delay = self.settle_delay(now);
        self.start_check(CheckStage::Settle, delay);
    }

    pub fn timer_fired(&mut self, id: TimerId, now: Instant) {
        let Some(kind) = self.timers.remove(&id) else {
            tracing::trace!("stale timer {id}");
            return;
        };

        match kind {
            TimerKind::Silence(participant) => {
                if self.silence_timers.get(&participant) == Some(&id) {
                    self.silence_timers.remove(&participant);
                }
                self.on_silence_elapsed(&participant, now);
            }
            TimerKind::Check(stage) => {
                if self.check_timer == Some(id) {
                    self.check_timer = None;
                }
                self.on_check(stage, now);
            }
        }
    }

    fn profile(&self) -> &SilenceProfile {
        self.config.profile()
    }

    /// Audio this soon after an acknowledgement belongs to the closed turn.
    fn is_stale(&self, now: Instant) -> bool {
        self.state
            .end_ack_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.stale_speaking())
    }

    fn probe_context(&self) -> ProbeContext {
        ProbeContext {
            generation_ended: self.state.generation_ended,
        }
    }

    fn audio_remaining(&self) -> bool {
        self.probe.has_remaining_audio(self.probe_context())
    }

    /// Nobody is speaking, generation is over and the turn is still open.
    fn may_commit(&self) -> bool {
        !self.state.anyone_speaking()
            && self.state.generation_ended
            && self.state.phase == Phase::Talking
            && !self.state.acked_this_round
    }

    fn settle_delay(&self, now: Instant) -> Duration {
        let profile = self.profile();
        let recent = self.state.generation_ended_at.is_some_and(|at| {
            now.saturating_duration_since(at) < self.config.recent_generation_end()
        });
        if recent {
            profile.safety_delay().max(profile.generation_end_buffer())
        } else {
            profile.safety_delay()
        }
    }

    fn begin_audio(&mut self) {
        self.state.has_audio_this_round = true;
        let phase = self.state.phase;
        if phase.awaits_audio() || phase == Phase::Listening {
            if phase == Phase::Listening {
                tracing::debug!("audio without activity-detected, forcing talking");
            }
            self.set_phase(Phase::Talking);
        }
    }

    fn on_session_ready(&mut self) {
        match self.state.phase {
            Phase::Idle | Phase::Connecting | Phase::Initializing => {
                self.clear_turn_flags();
                self.set_phase(Phase::Listening);
            }
            phase => tracing::debug!("session-ready in {phase} phase, ignoring"),
        }
    }

    fn on_activity_detected(&mut self) {
        if self.state.muted_for_interrupt {
            tracing::info!("activity detected, lifting interrupt mute");
            self.state.muted_for_interrupt = false;
            self.effects.push_back(Effect::MuteRemoteAudio(false));
        }
        self.cancel_check();
        self.state.end_ack_sent = false;
        self.state.end_ack_at = None;
        self.state.acked_this_round = false;
        self.state.generation_ended = false;
        self.state.generation_ended_at = None;
        self.state.confirmations = 0;
        self.set_phase(Phase::Thinking);
    }

    fn on_generation_start(&mut self, now: Instant) {
        let index = self.rounds.open_for_generation(now);
        tracing::debug!("generation start, round {index}");
        self.cancel_check();
        self.state.has_audio_this_round = false;
        self.state.generation_ended = false;
        self.state.generation_ended_at = None;
        self.state.end_ack_sent = false;
        self.state.end_ack_at = None;
        self.state.acked_this_round = false;
        self.state.confirmations = 0;
    }

    fn on_audio_begin_hint(&mut self, now: Instant) {
        if self.state.muted_for_interrupt {
            tracing::debug!("muted after interrupt, ignoring audio-begin-hint");
            return;
        }
        self.state.has_audio_this_round = true;
        self.rounds.mark_audio_begin_hint(now);
        if self.state.phase.awaits_audio() {
            self.set_phase(Phase::Talking);
        }
    }

    fn on_generation_end(&mut self, now: Instant) {
        if self.state.muted_for_interrupt {
            tracing::debug!("muted after interrupt, ignoring generation-end");
            return;
        }
        self.state.generation_ended = true;
        self.state.generation_ended_at = Some(now);

        let phase = self.state.phase;
        if !self.state.has_audio_this_round && matches!(phase, Phase::Thinking | Phase::Listening) {
            self.finish_empty_turn(now);
            return;
        }

        if !self.may_commit() {
            return;
        }

        let profile = self.profile().clone();
        if !self.audio_remaining() {
            self.start_check(CheckStage::Final, profile.generation_end_buffer());
        } else if let Some(remaining) = self.probe.short_audio_remaining() {
            tracing::debug!("short clip still playing, {remaining:?} left");
            self.start_check(CheckStage::Final, remaining.max(profile.min_audio()));
        } else {
            self.start_check(CheckStage::GenerationEndSettle, profile.safety_delay());
        }
    }

    fn finish_empty_turn(&mut self, now: Instant) {
        tracing::info!("generation produced no audio, ending turn immediately");
        self.set_phase(Phase::Listening);
        self.acknowledge(now);
    }

    fn on_ack_confirmed(&mut self) {
        if !self.state.end_ack_sent {
            tracing::warn!("end-of-turn confirmation without an outstanding acknowledgement");
            return;
        }
        self.state.end_ack_sent = false;
        if self.state.phase != Phase::Listening {
            self.set_phase(Phase::Listening);
        }
    }

    fn on_interrupt(&mut self) {
        tracing::info!("interrupt requested, muting remote audio");
        self.cancel_all_timers();
        self.state.speaking.clear();
        self.state.confirmations = 0;
        self.state.generation_ended = true;
        self.state.muted_for_interrupt = true;
        self.effects.push_back(Effect::StopPlayback);
        self.effects.push_back(Effect::MuteRemoteAudio(true));
        self.set_phase(Phase::Listening);
    }

    fn on_silence_elapsed(&mut self, participant: &str, now: Instant) {
        self.state.speaking.insert(participant.to_string(), false);
        if self.state.muted_for_interrupt || !self.may_commit() {
            return;
        }
        let delay = self.settle_delay(now);
        tracing::debug!("{participant} quiet, first check in {delay:?}");
        self.start_check(CheckStage::Settle, delay);
    }

    fn on_check(&mut self, stage: CheckStage, now: Instant) {
        if !self.may_commit() {
            self.state.confirmations = 0;
            return;
        }

        if self.audio_remaining() {
            self.state.confirmations = 0;
            let recheck = self.profile().recheck();
            tracing::trace!("audio still remaining at {stage:?}, rechecking in {recheck:?}");
            self.start_check(CheckStage::Recheck, recheck);
            return;
        }

        let profile = self.profile().clone();
        match stage {
            CheckStage::Settle | CheckStage::Confirm | CheckStage::Recheck => {
                self.state.confirmations += 1;
                if self.state.confirmations < profile.required_confirmations {
                    self.start_check(CheckStage::Confirm, profile.confirm_spacing());
                } else {
                    self.start_check(CheckStage::Final, profile.final_delay());
                }
            }
            CheckStage::GenerationEndSettle => {
                self.start_check(CheckStage::Final, profile.generation_end_buffer());
            }
            CheckStage::Final => self.commit(now),
        }
    }

    fn commit(&mut self, now: Instant) {
        if !self.may_commit() {
            return;
        }
        tracing::info!(
            "turn finished after {} confirmation(s)",
            self.state.confirmations
        );
        self.set_phase(Phase::Listening);
        self.acknowledge(now);
    }

    /// Emit the acknowledgement at most once per round.
    fn acknowledge(&mut self, now: Instant) {
        if self.state.acked_this_round {
            tracing::debug!("end-of-turn already acknowledged this round");
            return;
        }
        self.cancel_check();
        self.state.confirmations = 0;
        self.state.end_ack_sent = true;
        self.state.end_ack_at = Some(now);
        self.state.acked_this_round = true;
        self.rounds.close_current();
        self.effects.push_back(Effect::SendEndOfTurn);
    }

    fn clear_turn_flags(&mut self) {
        self.cancel_check();
        self.state.generation_ended = false;
        self.state.generation_ended_at = None;
        self.state.has_audio_this_round = false;
        self.state.end_ack_sent = false;
        self.state.end_ack_at = None;
        self.state.acked_this_round = false;
        self.state.confirmations = 0;
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.state.phase;
        if from == to {
            return;
        }
        tracing::info!("turn phase {from} -> {to}");
        self.state.phase = to;
        self.effects.push_back(Effect::PhaseChanged { from, to });
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration) -> TimerId {
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.insert(id, kind);
        self.effects.push_back(Effect::Schedule { id, after });
        id
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if self.timers.remove(&id).is_some() {
            self.effects.push_back(Effect::Cancel(id));
        }
    }

    fn start_check(&mut self, stage: CheckStage, after: Duration) {
        self.cancel_check();
        let id = self.schedule(TimerKind::Check(stage), after);
        self.check_timer = Some(id);
    }

    fn cancel_check(&mut self) {
        if let Some(id) = self.check_timer.take() {
            self.cancel_timer(id);
        }
    }

    fn cancel_all_timers(&mut self) {
        let ids: Vec<TimerId> = self.timers.keys().copied().collect();
        for id in ids {
            self.cancel_timer(id);
        }
        self.silence_timers.clear();
        self.check_timer = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use super::*;
    use crate::config::CallMode;

    #[derive(Clone, Default)]
    struct FakeProbe {
        busy: Arc<AtomicBool>,
        short_ms: Arc<AtomicU64>,
    }

    impl FakeProbe {
        fn set_busy(&self, busy: bool) {
            self.busy.store(busy, Ordering::SeqCst);
        }

        fn set_short(&self, ms: u64) {
            self.short_ms.store(ms, Ordering::SeqCst);
        }
    }

    impl PlaybackProbe for FakeProbe {
        fn has_remaining_audio(&self, _ctx: ProbeContext) -> bool {
            self.busy.load(Ordering::SeqCst)
        }

        fn short_audio_remaining(&self) -> Option<Duration> {
            let ms = self.short_ms.load(Ordering::SeqCst);
            (ms > 0).then(|| Duration::from_millis(ms))
        }
    }

    /// Drives a machine on a virtual clock, firing its timers in order.
    struct Sim {
        machine: TurnMachine,
        probe: FakeProbe,
        start: Instant,
        now: Instant,
        timers: Vec<(Instant, TimerId)>,
        acks: Vec<Instant>,
        mutes: Vec<bool>,
        stops: usize,
    }

    impl Sim {
        fn new(mode: CallMode) -> Self {
            let config = TurnConfig {
                mode,
                ..TurnConfig::default()
            };
            let probe = FakeProbe::default();
            let machine = TurnMachine::new(config, Box::new(probe.clone()));
            let start = Instant::now();
            let mut sim = Self {
                machine,
                probe,
                start,
                now: start,
                timers: Vec::new(),
                acks: Vec::new(),
                mutes: Vec::new(),
                stops: 0,
            };
            sim.machine.connect();
            sim.signal(TurnSignal::ModelReady);
            sim.signal(TurnSignal::SessionReady);
            assert_eq!(sim.machine.phase(), Phase::Listening);
            sim
        }

        fn pump(&mut self) {
            for effect in self.machine.drain_effects() {
                match effect {
                    Effect::SendEndOfTurn => self.acks.push(self.now),
                    Effect::Schedule { id, after } => self.timers.push((self.now + after, id)),
                    Effect::Cancel(id) => self.timers.retain(|&(_, t)| t != id),
                    Effect::MuteRemoteAudio(muted) => self.mutes.push(muted),
                    Effect::StopPlayback => self.stops += 1,
                    Effect::PhaseChanged { .. } => {}
                }
            }
        }

        fn signal(&mut self, signal: TurnSignal) {
            self.machine.handle_signal(signal, self.now);
            self.pump();
        }

        fn speaking(&mut self, participant: &str, speaking: bool) {
            self.machine.speaking_changed(participant, speaking, self.now);
            self.pump();
        }

        fn advance(&mut self, ms: u64) {
            let target = self.now + Duration::from_millis(ms);
            loop {
                let next = self
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, (due, _))| *due <= target)
                    .min_by_key(|(_, (due, id))| (*due, *id))
                    .map(|(i, _)| i);
                let Some(i) = next else { break };
                let (due, id) = self.timers.remove(i);
                self.now = due;
                self.machine.timer_fired(id, due);
                self.pump();
            }
            self.now = target;
        }

        fn ack_ms(&self, i: usize) -> u128 {
            (self.acks[i] - self.start).as_millis()
        }

        /// activity-detected, generation-start and a peer starting to speak.
        fn talking_turn(&mut self) {
            self.signal(TurnSignal::ActivityDetected);
            self.signal(TurnSignal::GenerationStart);
            self.speaking("peer", true);
            assert_eq!(self.machine.phase(), Phase::Talking);
        }

        /// Same, but audio is announced by the hint rather than speaking activity.
        fn hinted_turn(&mut self) {
            self.signal(TurnSignal::ActivityDetected);
            self.signal(TurnSignal::GenerationStart);
            self.signal(TurnSignal::AudioBeginHint);
            assert_eq!(self.machine.phase(), Phase::Talking);
        }
    }

    #[test]
    fn undecodable_turn_finishes_like_an_empty_one() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.signal(TurnSignal::ActivityDetected);
        sim.signal(TurnSignal::GenerationStart);
        sim.machine.audio_arrived(sim.now);
        sim.signal(TurnSignal::GenerationEnd);
        assert!(sim.acks.is_empty());
        assert_eq!(sim.machine.phase(), Phase::Thinking);

        sim.advance(40);
        sim.machine.audio_lost(sim.now);
        sim.pump();
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 40);
        assert_eq!(sim.machine.phase(), Phase::Listening);

        // Reported again for the same round: nothing more to do.
        sim.machine.audio_lost(sim.now);
        sim.pump();
        assert_eq!(sim.acks.len(), 1);
    }

    #[test]
    fn lost_audio_before_generation_end_waits_for_it() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.signal(TurnSignal::ActivityDetected);
        sim.signal(TurnSignal::GenerationStart);
        sim.machine.audio_arrived(sim.now);
        sim.machine.audio_lost(sim.now);
        sim.pump();
        assert!(sim.acks.is_empty());
        assert!(!sim.machine.state().has_audio_this_round);

        sim.signal(TurnSignal::GenerationEnd);
        assert_eq!(sim.acks.len(), 1);
    }

    #[test]
    fn acknowledgement_closes_the_round() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.speaking("peer", false);
        sim.signal(TurnSignal::GenerationEnd);
        sim.advance(5000);
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.machine.rounds().len(), 1);
        let round = sim
            .machine
            .rounds()
            .current()
            .unwrap_or_else(|| panic!("no round"));
        assert!(!round.is_open());
    }

    #[test]
    fn silence_path_acknowledges_after_confirmation() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.advance(1000);
        sim.speaking("peer", false);
        sim.advance(100);
        // The peer still counts as speaking until the quiet period elapses.
        sim.signal(TurnSignal::GenerationEnd);
        assert!(sim.acks.is_empty());

        sim.advance(5000);
        // silence at 1800, widened settle (1000) to 2800, final (150) at 2950
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 2950);
        assert_eq!(sim.machine.phase(), Phase::Listening);
        assert!(sim.machine.state().end_ack_sent);
    }

    #[test]
    fn generation_end_during_silence_wait_sends_one_ack() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.speaking("peer", false);
        sim.advance(800);
        // Silence elapsed before generation ended: nothing to confirm yet.
        assert!(sim.acks.is_empty());

        sim.advance(100);
        sim.signal(TurnSignal::GenerationEnd);
        sim.advance(100);
        let now = sim.now;
        sim.machine.playback_drained(now);
        sim.pump();

        sim.advance(10_000);
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 1900);
    }

    #[test]
    fn racing_confirmation_paths_converge_on_one_ack() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.speaking("peer", false);
        sim.advance(900);
        sim.signal(TurnSignal::GenerationEnd);

        // A second participant flaps while the generation-end check is pending.
        sim.advance(100);
        sim.speaking("other", true);
        sim.speaking("other", false);

        sim.advance(10_000);
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.machine.phase(), Phase::Listening);
    }

    #[test]
    fn remaining_audio_defers_acknowledgement() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.speaking("peer", false);
        sim.advance(800);

        sim.probe.set_busy(true);
        sim.signal(TurnSignal::GenerationEnd);
        sim.advance(3000);
        assert!(sim.acks.is_empty());
        assert_eq!(sim.machine.phase(), Phase::Talking);

        sim.probe.set_busy(false);
        let cleared_at = (sim.now - sim.start).as_millis();
        sim.advance(1000);
        assert_eq!(sim.acks.len(), 1);
        let ack = sim.ack_ms(0);
        assert!(ack > cleared_at && ack <= cleared_at + 100 + 150, "ack at {ack}");
    }

    #[test]
    fn short_clip_is_protected_for_min_audio() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.hinted_turn();
        sim.probe.set_busy(true);
        sim.probe.set_short(400);
        sim.signal(TurnSignal::GenerationEnd);

        sim.advance(599);
        assert!(sim.acks.is_empty());
        sim.probe.set_busy(false);
        sim.advance(1);
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 600);
    }

    #[test]
    fn generation_end_with_audio_playing_settles_then_checks_again() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.hinted_turn();
        sim.probe.set_busy(true);
        sim.signal(TurnSignal::GenerationEnd);

        sim.advance(200);
        sim.probe.set_busy(false);
        sim.advance(5000);
        // safety (300) then generation-end buffer (1000)
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 1300);
    }

    #[test]
    fn video_mode_requires_two_confirmations() {
        let mut sim = Sim::new(CallMode::Video);
        sim.talking_turn();
        sim.signal(TurnSignal::GenerationEnd);
        sim.advance(2000);
        sim.speaking("peer", false);

        sim.advance(10_000);
        // silence 1500 -> 3500, settle 500 -> 4000, confirm 500 -> 4500, final 300 -> 4800
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 4800);
    }

    #[test]
    fn interrupt_suppresses_activity_until_next_user_turn() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.speaking("peer", false);
        sim.signal(TurnSignal::InterruptRequested);

        assert_eq!(sim.machine.phase(), Phase::Listening);
        assert_eq!(sim.mutes, vec![true]);
        assert_eq!(sim.stops, 1);
        assert!(sim.timers.is_empty());

        let before = sim.machine.state().clone();
        sim.speaking("peer", true);
        sim.speaking("peer", false);
        sim.signal(TurnSignal::AudioBeginHint);
        sim.signal(TurnSignal::GenerationEnd);
        let now = sim.now;
        sim.machine.audio_arrived(now);
        sim.machine.playback_started(now);
        sim.pump();
        sim.advance(10_000);

        assert_eq!(sim.machine.state(), &before);
        assert!(sim.acks.is_empty());
        assert!(sim.timers.is_empty());

        sim.signal(TurnSignal::ActivityDetected);
        assert_eq!(sim.mutes, vec![true, false]);
        assert_eq!(sim.machine.phase(), Phase::Thinking);
        assert!(!sim.machine.state().muted_for_interrupt);
    }

    #[test]
    fn empty_turn_acknowledges_immediately() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.signal(TurnSignal::ActivityDetected);
        sim.signal(TurnSignal::GenerationStart);
        sim.signal(TurnSignal::GenerationEnd);

        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 0);
        assert_eq!(sim.machine.phase(), Phase::Listening);
        assert!(sim.timers.is_empty());

        // A repeated generation-end in the same round does not ack again.
        sim.signal(TurnSignal::GenerationEnd);
        assert_eq!(sim.acks.len(), 1);

        sim.signal(TurnSignal::GenerationStart);
        sim.signal(TurnSignal::GenerationEnd);
        assert_eq!(sim.acks.len(), 2);
    }

    #[test]
    fn speaking_right_after_ack_is_stale() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.signal(TurnSignal::ActivityDetected);
        sim.signal(TurnSignal::GenerationStart);
        sim.signal(TurnSignal::GenerationEnd);
        assert_eq!(sim.acks.len(), 1);

        sim.advance(100);
        sim.speaking("peer", true);
        assert_eq!(sim.machine.phase(), Phase::Listening);
        assert!(!sim.machine.state().anyone_speaking());

        sim.advance(500);
        sim.speaking("peer", true);
        assert_eq!(sim.machine.phase(), Phase::Talking);
    }

    #[test]
    fn ack_confirmation_clears_outstanding_flag() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.signal(TurnSignal::AckConfirmed);
        assert!(!sim.machine.state().end_ack_sent);

        sim.signal(TurnSignal::ActivityDetected);
        sim.signal(TurnSignal::GenerationStart);
        sim.signal(TurnSignal::GenerationEnd);
        assert!(sim.machine.state().end_ack_sent);

        sim.signal(TurnSignal::AckConfirmed);
        assert!(!sim.machine.state().end_ack_sent);
        assert_eq!(sim.machine.phase(), Phase::Listening);
    }

    #[test]
    fn drained_playback_triggers_confirmation() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.signal(TurnSignal::ActivityDetected);
        sim.signal(TurnSignal::GenerationStart);
        let now = sim.now;
        sim.machine.audio_arrived(now);
        // Generation ends before anything is audible: no shortcut, no checks.
        sim.signal(TurnSignal::GenerationEnd);
        assert!(sim.acks.is_empty());
        assert_eq!(sim.machine.phase(), Phase::Thinking);

        sim.advance(50);
        let now = sim.now;
        sim.machine.playback_started(now);
        sim.pump();
        assert_eq!(sim.machine.phase(), Phase::Talking);

        sim.advance(1950);
        let now = sim.now;
        sim.machine.playback_drained(now);
        sim.pump();
        sim.advance(5000);
        // settle 300 -> 2300, final 150 -> 2450
        assert_eq!(sim.acks.len(), 1);
        assert_eq!(sim.ack_ms(0), 2450);
    }

    #[test]
    fn moderation_block_is_terminal_until_reset() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.speaking("peer", false);
        sim.signal(TurnSignal::ModerationBlock);

        assert_eq!(sim.machine.phase(), Phase::Forbidden);
        assert!(sim.timers.is_empty());

        sim.signal(TurnSignal::ActivityDetected);
        sim.speaking("peer", true);
        assert_eq!(sim.machine.phase(), Phase::Forbidden);

        sim.machine.reset();
        sim.pump();
        assert_eq!(sim.machine.phase(), Phase::Idle);
        assert!(sim.machine.rounds().is_empty());
    }

    #[test]
    fn peer_exit_ends_session() {
        let mut sim = Sim::new(CallMode::Audio);
        sim.talking_turn();
        sim.signal(TurnSignal::PeerExit);
        assert_eq!(sim.machine.phase(), Phase::Ended);
        assert!(sim.timers.is_empty());
    }
}
