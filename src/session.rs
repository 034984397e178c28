//! Session driver: one event loop wiring transport input, the decode thread,
//! the chunk scheduler, the ring buffer and the turn machine together.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::audio::decode::SegmentDecoder;
use crate::audio::ring::{RingEvent, RingHandle};
use crate::audio::scheduler::{ChunkScheduler, Flush};
use crate::audio::{DecodeInput, DecodeOutput, start_decode_pipeline};
use crate::config::Config;
use crate::error::Result;
use crate::turn::probe::{
    AnyProbe, PendingSamples, PlaybackProbe, RingProbe, TrackProbe, TrackSnapshot,
};
use crate::turn::signal::{END_OF_TURN_MARKER, Inbound, TurnSignal};
use crate::turn::timer::{TimerId, TimerWheel};
use crate::turn::{Effect, Phase, TurnMachine};

/// Messages from the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    /// A data-channel text message (state markers or chat).
    Text(String),
    /// An encoded audio payload for the current turn.
    Audio(String),
    Speaking { participant: String, active: bool },
    /// Latest rendering state of every remote audio track.
    Tracks(Vec<TrackSnapshot>),
}

/// What the session reports back to the transport and UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    /// Text to send to the peer over the data channel.
    Send(String),
    Phase(Phase),
    Chat(String),
    /// Inbound remote audio should be muted (`true`) or restored.
    MuteRemoteAudio(bool),
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

pub struct Session {
    machine: TurnMachine,
    scheduler: ChunkScheduler,
    ring: RingHandle,
    pending: Arc<PendingSamples>,
    tracks: TrackProbe,
    decode: DecodeInput,
    decode_rx: mpsc::Receiver<DecodeOutput>,
    wheel: TimerWheel,
    fired_rx: mpsc::UnboundedReceiver<TimerId>,
    ring_rx: mpsc::UnboundedReceiver<RingEvent>,
    output_tx: mpsc::Sender<SessionOutput>,
    next_seq: u64,
    /// Segments decoded since the last end-of-turn barrier.
    decoded_this_turn: usize,
    /// Decode outputs are from an interrupted stream until `ResetDone`.
    discarding: bool,
}

impl Session {
    /// Build a session around an existing ring buffer.
    ///
    /// Playback evidence comes from the ring itself and from track snapshots
    /// sent as [`SessionInput::Tracks`]. `extra_probe` adds any other source.
    /// Must be called from inside a tokio runtime.
    pub fn new<D>(
        config: &Config,
        ring: RingHandle,
        decoder: D,
        extra_probe: Option<Box<dyn PlaybackProbe>>,
        output_tx: mpsc::Sender<SessionOutput>,
    ) -> Result<Self>
    where
        D: SegmentDecoder + 'static,
    {
        let sample_rate = ring.sample_rate();

        let (decode_tx, decode_rx) = mpsc::channel(64);
        let decode = start_decode_pipeline(decoder, sample_rate, decode_tx)?;

        let pending = Arc::new(PendingSamples::default());
        let tracks = TrackProbe::new(config.probe.clone());
        let mut probe = AnyProbe::new()
            .with(RingProbe::new(
                ring.stats(),
                Arc::clone(&pending),
                sample_rate,
                &config.probe,
            ))
            .with(tracks.clone());
        if let Some(extra) = extra_probe {
            probe = probe.with(BoxedProbe(extra));
        }

        let mut machine = TurnMachine::new(config.turn.clone(), Box::new(probe));
        machine.connect();

        let (wheel, fired_rx) = TimerWheel::new();
        let ring_rx = bridge_ring_events(&ring)?;

        Ok(Self {
            machine,
            scheduler: ChunkScheduler::new(&config.scheduler, sample_rate),
            ring,
            pending,
            tracks,
            decode,
            decode_rx,
            wheel,
            fired_rx,
            ring_rx,
            output_tx,
            next_seq: 0,
            decoded_this_turn: 0,
            discarding: false,
        })
    }

    #[must_use]
    pub const fn machine(&self) -> &TurnMachine {
        &self.machine
    }

    /// Process input until the transport side closes its channel.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<SessionInput>) -> Result<()> {
        self.apply_effects().await;

        loop {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else {
                        tracing::debug!("session input closed");
                        break;
                    };
                    self.on_input(input).await;
                }
                Some(output) = self.decode_rx.recv() => self.on_decoded(output),
                Some(id) = self.fired_rx.recv() => {
                    if self.wheel.fired(id) {
                        self.machine.timer_fired(id, now());
                    }
                }
                Some(event) = self.ring_rx.recv() => self.on_ring_event(event),
                () = sleep_until(deadline) => {
                    if let Some(flush) = self.scheduler.poll(now()) {
                        self.write(flush);
                    }
                }
            }

            self.apply_effects().await;
        }

        self.wheel.cancel_all();
        Ok(())
    }

    async fn on_input(&mut self, input: SessionInput) {
        let at = now();
        match input {
            SessionInput::Text(text) => match Inbound::classify(&text) {
                Inbound::Signal(signal) => self.on_signal(signal, at),
                Inbound::Chat(chat) => self.emit(SessionOutput::Chat(chat)).await,
                Inbound::Unrecognized(marker) => {
                    tracing::debug!("unrecognized state marker: {marker}");
                }
            },
            SessionInput::Audio(payload) => {
                if self.machine.state().muted_for_interrupt {
                    tracing::debug!("muted after interrupt, dropping audio payload");
                    return;
                }
                self.machine.audio_arrived(at);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.decode.segment(seq, payload);
            }
            SessionInput::Speaking {
                participant,
                active,
            } => self.machine.speaking_changed(&participant, active, at),
            SessionInput::Tracks(snapshots) => self.tracks.update(snapshots),
        }
    }

    fn on_signal(&mut self, signal: TurnSignal, at: Instant) {
        tracing::debug!("signal: {signal}");
        self.machine.handle_signal(signal, at);

        // Upstream audio for the turn is complete once generation ends; the
        // end-of-turn marker queues behind every segment already submitted.
        if signal == TurnSignal::GenerationEnd && !self.machine.state().muted_for_interrupt {
            self.decode.end_of_turn();
        }
    }

    fn on_decoded(&mut self, output: DecodeOutput) {
        if self.discarding {
            if output == DecodeOutput::ResetDone {
                self.discarding = false;
            }
            return;
        }

        let at = now();
        match output {
            DecodeOutput::Segment { seq, samples, .. } => {
                tracing::trace!("segment {seq}: {} samples", samples.len());
                self.decoded_this_turn += 1;
                if let Some(flush) = self.scheduler.push(samples, at) {
                    self.write(flush);
                }
            }
            DecodeOutput::Dropped { seq, error } => {
                self.scheduler.record_drop();
                tracing::debug!(
                    "segment {seq} dropped ({error}), {} this turn",
                    self.scheduler.dropped()
                );
            }
            DecodeOutput::EndOfTurn { tail } => {
                // Empty tails are ignored by the scheduler.
                if let Some(flush) = self.scheduler.push(tail, at) {
                    self.write(flush);
                }
                if let Some(flush) = self.scheduler.finish() {
                    self.write(flush);
                }
                self.ring.finish();
                if self.decoded_this_turn == 0 {
                    self.machine.audio_lost(at);
                }
                self.decoded_this_turn = 0;
            }
            DecodeOutput::ResetDone => {}
        }
        self.pending.set(self.scheduler.pending_samples());
    }

    fn on_ring_event(&mut self, event: RingEvent) {
        match event {
            RingEvent::Ended => {
                tracing::debug!("playback drained");
                self.machine.playback_drained(now());
            }
            RingEvent::Overrun { dropped } => {
                tracing::warn!("playback buffer overrun, dropped {dropped} samples");
            }
        }
    }

    fn write(&mut self, flush: Flush) {
        tracing::trace!(
            "flush: {} segment(s), {} samples",
            flush.segments,
            flush.samples.len()
        );
        let first = flush.first;
        self.ring.add(flush.samples);
        self.pending.set(self.scheduler.pending_samples());
        if first {
            self.machine.playback_started(now());
        }
    }

    async fn apply_effects(&mut self) {
        for effect in self.machine.drain_effects() {
            match effect {
                Effect::SendEndOfTurn => {
                    self.emit(SessionOutput::Send(END_OF_TURN_MARKER.to_string()))
                        .await;
                }
                Effect::Schedule { id, after } => self.wheel.schedule(id, after),
                Effect::Cancel(id) => self.wheel.cancel(id),
                Effect::MuteRemoteAudio(muted) => {
                    self.emit(SessionOutput::MuteRemoteAudio(muted)).await;
                }
                Effect::StopPlayback => self.stop_playback(),
                Effect::PhaseChanged { to, .. } => self.emit(SessionOutput::Phase(to)).await,
            }
        }
    }

    fn stop_playback(&mut self) {
        self.ring.stop();
        self.ring.clear();
        self.scheduler.reset();
        self.pending.set(0);
        self.decoded_this_turn = 0;
        self.decode.reset();
        self.discarding = true;
    }

    async fn emit(&mut self, output: SessionOutput) {
        if self.output_tx.send(output).await.is_err() {
            tracing::debug!("session output receiver dropped");
        }
    }
}

/// Adapter so a boxed probe can sit inside [`AnyProbe`].
struct BoxedProbe(Box<dyn PlaybackProbe>);

impl PlaybackProbe for BoxedProbe {
    fn has_remaining_audio(&self, ctx: crate::turn::probe::ProbeContext) -> bool {
        self.0.has_remaining_audio(ctx)
    }

    fn short_audio_remaining(&self) -> Option<std::time::Duration> {
        self.0.short_audio_remaining()
    }
}

/// Forward ring events from the callback's crossbeam channel into tokio.
fn bridge_ring_events(ring: &RingHandle) -> Result<mpsc::UnboundedReceiver<RingEvent>> {
    let events = ring.events();
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("talkback-ring-events".to_string())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                if tx.send(event).is_err() {
                    break;
                }
            }
            tracing::debug!("ring event bridge exiting");
        })?;

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::decode::PcmDecoder;
    use crate::audio::decode::tests::wav_payload;
    use crate::audio::ring::{self, RingBuffer, RingProcessor};
    use crate::config::{SilenceProfile, TurnConfig};

    const RATE: u32 = 16_000;
    const LONG: Duration = Duration::from_secs(2);
    const SHORT: Duration = Duration::from_millis(300);

    fn fast_config() -> Config {
        let profile = SilenceProfile {
            timeout_ms: 40,
            safety_delay_ms: 20,
            generation_end_buffer_ms: 30,
            min_audio_ms: 20,
            required_confirmations: 1,
            confirm_spacing_ms: 10,
            final_delay_ms: 10,
            recheck_ms: 10,
        };
        let mut config = Config::default();
        config.turn = TurnConfig {
            stale_speaking_ms: 20,
            recent_generation_end_ms: 50,
            audio: profile.clone(),
            video: profile,
            ..TurnConfig::default()
        };
        config.ring.priming_cycles = 0;
        config.scheduler.prebuffer_timeout_ms = 10;
        config.scheduler.merge_delay_ms = 10;
        config
    }

    /// Stand-in for the output callback: renders 10 ms every 10 ms and
    /// records everything it plays.
    fn spawn_callback(mut processor: RingProcessor) -> tokio::task::JoinHandle<Vec<f32>> {
        tokio::spawn(async move {
            let mut played = Vec::new();
            let mut out = vec![0.0f32; RATE as usize / 100];
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            for _ in 0..300 {
                tick.tick().await;
                processor.process(&mut out);
                played.extend(out.iter().copied().filter(|&s| s != 0.0));
            }
            played
        })
    }

    struct Harness {
        inputs: mpsc::Sender<SessionInput>,
        outputs: mpsc::Receiver<SessionOutput>,
        callback: tokio::task::JoinHandle<Vec<f32>>,
    }

    fn start(config: &Config) -> Harness {
        let ring_buffer = RingBuffer::new(
            config.ring.capacity_samples(RATE),
            config.ring.frame_size,
            config.ring.priming_cycles,
        );
        let (handle, processor) = ring::channel(ring_buffer, RATE);
        let (output_tx, outputs) = mpsc::channel(64);
        let (inputs, input_rx) = mpsc::channel(64);

        let session = Session::new(
            config,
            handle,
            PcmDecoder::new(&config.decode),
            None,
            output_tx,
        )
        .unwrap_or_else(|e| panic!("{e}"));
        tokio::spawn(session.run(input_rx));

        Harness {
            inputs,
            outputs,
            callback: spawn_callback(processor),
        }
    }

    impl Harness {
        async fn send(&self, input: SessionInput) {
            self.inputs
                .send(input)
                .await
                .unwrap_or_else(|e| panic!("{e}"));
        }

        async fn marker(&self, marker: &str) {
            self.send(SessionInput::Text(marker.to_string())).await;
        }

        /// Collect outputs until `stop` matches or `wait` runs out.
        async fn collect_until(
            &mut self,
            stop: impl Fn(&SessionOutput) -> bool,
            wait: Duration,
        ) -> Vec<SessionOutput> {
            let mut seen = Vec::new();
            let deadline = tokio::time::Instant::now() + wait;
            while let Ok(Some(output)) =
                tokio::time::timeout_at(deadline, self.outputs.recv()).await
            {
                let done = stop(&output);
                seen.push(output);
                if done {
                    break;
                }
            }
            seen
        }
    }

    fn is_ack(output: &SessionOutput) -> bool {
        *output == SessionOutput::Send(END_OF_TURN_MARKER.to_string())
    }

    #[tokio::test]
    async fn turn_plays_in_order_and_acknowledges_once() {
        let config = fast_config();
        let mut h = start(&config);

        h.marker("<state><model_init_success>").await;
        h.marker("<state><session_init>").await;
        h.marker("<state><vad_end>").await;
        h.marker("<state><generate_start>").await;
        for value in [1000i16, 2000, 3000] {
            h.send(SessionInput::Audio(wav_payload(&[value; 1600], 1, RATE)))
                .await;
        }
        h.marker("<state><generate_end>").await;

        let seen = h.collect_until(is_ack, LONG).await;
        assert_eq!(seen.iter().filter(|o| is_ack(o)).count(), 1);
        assert!(seen.contains(&SessionOutput::Phase(Phase::Talking)));
        assert_eq!(seen.last(), Some(&SessionOutput::Send(END_OF_TURN_MARKER.to_string())));

        // Nothing else acknowledges the same round.
        let later = h.collect_until(|_| false, SHORT).await;
        assert!(!later.iter().any(is_ack));

        drop(h.inputs);
        let played = h.callback.await.unwrap_or_else(|e| panic!("{e}"));
        assert!(!played.is_empty());
        // Segment order survives batching: levels never step back down.
        let levels: Vec<f32> = played
            .iter()
            .copied()
            .filter(|s| [1000.0f32, 2000.0, 3000.0].iter().any(|l| (s * 32768.0 - l).abs() < 0.5))
            .collect();
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn decode_failure_keeps_turn_alive() {
        let config = fast_config();
        let mut h = start(&config);

        h.marker("<state><session_init>").await;
        h.marker("<state><vad_end>").await;
        h.marker("<state><generate_start>").await;
        h.send(SessionInput::Audio(wav_payload(&[1000; 800], 1, RATE)))
            .await;
        h.send(SessionInput::Audio("not audio at all".to_string()))
            .await;
        h.send(SessionInput::Audio(wav_payload(&[3000; 800], 1, RATE)))
            .await;
        h.marker("<state><generate_end>").await;

        let seen = h.collect_until(is_ack, LONG).await;
        // Audio arrived, so this is a normal turn rather than an empty one.
        assert!(seen.contains(&SessionOutput::Phase(Phase::Talking)));
        assert_eq!(seen.iter().filter(|o| is_ack(o)).count(), 1);
    }

    #[tokio::test]
    async fn empty_generation_acknowledges_without_audio() {
        let config = fast_config();
        let mut h = start(&config);

        h.marker("<state><session_init>").await;
        h.marker("<state><vad_end>").await;
        h.marker("<state><generate_start>").await;
        h.marker("<state><generate_end>").await;

        let seen = h.collect_until(is_ack, LONG).await;
        assert!(seen.iter().any(is_ack));
        assert!(!seen.contains(&SessionOutput::Phase(Phase::Talking)));
    }

    #[tokio::test]
    async fn interrupt_mutes_and_drops_pending_audio() {
        let config = fast_config();
        let mut h = start(&config);

        h.marker("<state><session_init>").await;
        h.marker("<state><vad_end>").await;
        h.marker("<state><generate_start>").await;
        h.send(SessionInput::Audio(wav_payload(&[2000; 8000], 1, RATE)))
            .await;
        h.marker("<state><session_break>").await;
        h.send(SessionInput::Audio(wav_payload(&[2000; 8000], 1, RATE)))
            .await;
        h.marker("<state><generate_end>").await;

        let seen = h
            .collect_until(|o| *o == SessionOutput::MuteRemoteAudio(true), LONG)
            .await;
        assert!(seen.contains(&SessionOutput::MuteRemoteAudio(true)));

        let later = h.collect_until(|_| false, SHORT).await;
        assert!(!later.iter().any(is_ack));

        h.marker("<state><vad_end>").await;
        let resumed = h
            .collect_until(|o| *o == SessionOutput::Phase(Phase::Thinking), LONG)
            .await;
        assert!(resumed.contains(&SessionOutput::MuteRemoteAudio(false)));
    }

    #[tokio::test]
    async fn chat_text_passes_through() {
        let config = fast_config();
        let mut h = start(&config);

        h.marker("hello from the peer").await;
        let seen = h
            .collect_until(|o| matches!(o, SessionOutput::Chat(_)), LONG)
            .await;
        assert!(seen.contains(&SessionOutput::Chat("hello from the peer".to_string())));
    }

    #[tokio::test]
    async fn undecodable_turn_is_still_acknowledged() {
        let config = fast_config();
        let mut h = start(&config);

        h.marker("<state><session_init>").await;
        h.marker("<state><vad_end>").await;
        h.marker("<state><generate_start>").await;
        h.send(SessionInput::Audio("definitely not audio".to_string()))
            .await;
        h.send(SessionInput::Audio("data:audio/wav;base64,!!!!".to_string()))
            .await;
        h.marker("<state><generate_end>").await;

        let seen = h.collect_until(is_ack, LONG).await;
        assert_eq!(seen.iter().filter(|o| is_ack(o)).count(), 1);
        assert!(!seen.contains(&SessionOutput::Phase(Phase::Talking)));
        assert_eq!(seen.last(), Some(&SessionOutput::Send(END_OF_TURN_MARKER.to_string())));
    }

    #[tokio::test]
    async fn buffered_track_audio_defers_the_ack() {
        let config = fast_config();
        let mut h = start(&config);

        h.marker("<state><session_init>").await;
        h.marker("<state><vad_end>").await;
        h.marker("<state><generate_start>").await;
        h.marker("<state><audio_start>").await;
        h.send(SessionInput::Tracks(vec![TrackSnapshot {
            position_secs: 1.0,
            buffered_ends: vec![6.0],
            ready_state: 4,
            ..TrackSnapshot::default()
        }]))
        .await;
        h.marker("<state><generate_end>").await;

        let held = h.collect_until(is_ack, SHORT).await;
        assert!(held.contains(&SessionOutput::Phase(Phase::Talking)));
        assert!(!held.iter().any(is_ack));

        h.send(SessionInput::Tracks(Vec::new())).await;
        let released = h.collect_until(is_ack, LONG).await;
        assert_eq!(released.iter().filter(|o| is_ack(o)).count(), 1);
    }
}
