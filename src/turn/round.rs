use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// Timing record for one generation round.
#[derive(Debug, Clone)]
pub struct TurnRound {
    pub index: u64,
    pub participant: Option<String>,
    pub opened_at: DateTime<Local>,
    pub generation_start: Option<Instant>,
    pub audio_begin_hint: Option<Instant>,
    pub first_packet: Option<Instant>,
    pub first_play: Option<Instant>,
    /// Set once the round was acknowledged or superseded.
    pub closed: bool,
}

/// Latencies derived from a round's timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundDeltas {
    pub start_to_packet: Option<Duration>,
    pub hint_to_packet: Option<Duration>,
    pub packet_to_play: Option<Duration>,
    pub start_to_play: Option<Duration>,
}

fn between(from: Option<Instant>, to: Option<Instant>) -> Option<Duration> {
    Some(to?.saturating_duration_since(from?))
}

impl TurnRound {
    fn new(index: u64) -> Self {
        Self {
            index,
            participant: None,
            opened_at: Local::now(),
            generation_start: None,
            audio_begin_hint: None,
            first_packet: None,
            first_play: None,
            closed: false,
        }
    }

    #[must_use]
    pub fn deltas(&self) -> RoundDeltas {
        RoundDeltas {
            start_to_packet: between(self.generation_start, self.first_packet),
            hint_to_packet: between(self.audio_begin_hint, self.first_packet),
            packet_to_play: between(self.first_packet, self.first_play),
            start_to_play: between(self.generation_start, self.first_play),
        }
    }

    /// Open until the turn is acknowledged or the next generation starts.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !self.closed
    }
}

/// Bounded history of rounds; the newest round is the current one.
#[derive(Debug)]
pub struct RoundHistory {
    rounds: VecDeque<TurnRound>,
    capacity: usize,
    next_index: u64,
}

impl RoundHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rounds: VecDeque::with_capacity(capacity),
            capacity,
            next_index: 0,
        }
    }

    fn push(&mut self) -> &mut TurnRound {
        self.close_current();
        if self.rounds.len() >= self.capacity {
            self.rounds.pop_front();
        }
        let index = self.next_index;
        self.next_index += 1;
        self.rounds.push_back(TurnRound::new(index));
        // Just pushed, so the back exists.
        let last = self.rounds.len() - 1;
        &mut self.rounds[last]
    }

    /// generation-start always opens a fresh round.
    pub fn open_for_generation(&mut self, now: Instant) -> u64 {
        let round = self.push();
        round.generation_start = Some(now);
        round.index
    }

    fn current_open(&mut self) -> Option<&mut TurnRound> {
        self.rounds.back_mut().filter(|r| r.is_open())
    }

    pub fn mark_audio_begin_hint(&mut self, now: Instant) {
        if let Some(round) = self.current_open()
            && round.audio_begin_hint.is_none()
        {
            round.audio_begin_hint = Some(now);
        }
    }

    /// Speaking activity or decoded audio arrived; opens a round if none is open.
    pub fn mark_first_packet(&mut self, participant: Option<&str>, now: Instant) {
        let needs_round = self.current_open().is_none();
        if needs_round {
            self.push();
        }
        let Some(round) = self.rounds.back_mut() else {
            return;
        };
        if round.first_packet.is_none() {
            round.first_packet = Some(now);
            if round.participant.is_none() {
                round.participant = participant.map(str::to_string);
            }
            let deltas = round.deltas();
            tracing::debug!(
                "round {}: first packet (from start {:?}, from hint {:?})",
                round.index,
                deltas.start_to_packet,
                deltas.hint_to_packet
            );
        }
    }

    pub fn mark_first_play(&mut self, now: Instant) {
        let Some(round) = self.current_open() else {
            return;
        };
        if round.first_play.is_some() {
            return;
        }
        round.first_play = Some(now);
        let deltas = round.deltas();
        tracing::debug!(
            "round {} opened {}: playing (packet to play {:?}, start to play {:?})",
            round.index,
            round.opened_at.format("%H:%M:%S%.3f"),
            deltas.packet_to_play,
            deltas.start_to_play
        );
    }

    /// The turn was acknowledged; later activity belongs to a new round.
    pub fn close_current(&mut self) {
        if let Some(round) = self.rounds.back_mut() {
            round.closed = true;
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&TurnRound> {
        self.rounds.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TurnRound> {
        self.rounds.iter()
    }

    pub fn clear(&mut self) {
        self.rounds.clear();
        self.next_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_round_collects_timings() {
        let mut history = RoundHistory::new(4);
        let t0 = Instant::now();
        assert_eq!(history.open_for_generation(t0), 0);
        history.mark_audio_begin_hint(t0 + Duration::from_millis(40));
        history.mark_first_packet(Some("peer"), t0 + Duration::from_millis(100));
        history.mark_first_play(t0 + Duration::from_millis(180));

        let round = history.current().unwrap_or_else(|| panic!("no round"));
        assert_eq!(round.participant.as_deref(), Some("peer"));
        let deltas = round.deltas();
        assert_eq!(deltas.start_to_packet, Some(Duration::from_millis(100)));
        assert_eq!(deltas.hint_to_packet, Some(Duration::from_millis(60)));
        assert_eq!(deltas.packet_to_play, Some(Duration::from_millis(80)));
        assert_eq!(deltas.start_to_play, Some(Duration::from_millis(180)));
    }

    #[test]
    fn packet_without_open_round_opens_one() {
        let mut history = RoundHistory::new(4);
        let t0 = Instant::now();
        history.open_for_generation(t0);
        history.mark_first_play(t0);
        history.close_current();

        history.mark_first_packet(None, t0 + Duration::from_millis(5));
        assert_eq!(history.len(), 2);
        let round = history.current().unwrap_or_else(|| panic!("no round"));
        assert_eq!(round.index, 1);
        assert!(round.generation_start.is_none());
    }

    #[test]
    fn activity_after_first_play_stays_in_the_round() {
        let mut history = RoundHistory::new(4);
        let t0 = Instant::now();
        history.open_for_generation(t0);
        history.mark_first_packet(Some("peer"), t0 + Duration::from_millis(10));
        history.mark_first_play(t0 + Duration::from_millis(20));

        history.mark_first_packet(Some("peer"), t0 + Duration::from_millis(300));
        history.mark_first_play(t0 + Duration::from_millis(400));
        history.mark_first_packet(None, t0 + Duration::from_millis(500));

        assert_eq!(history.len(), 1);
        let round = history.current().unwrap_or_else(|| panic!("no round"));
        assert!(round.is_open());
        assert_eq!(round.first_packet, Some(t0 + Duration::from_millis(10)));
        assert_eq!(round.first_play, Some(t0 + Duration::from_millis(20)));
    }

    #[test]
    fn generation_start_closes_the_previous_round() {
        let mut history = RoundHistory::new(4);
        let t0 = Instant::now();
        history.open_for_generation(t0);
        history.open_for_generation(t0);
        let open: Vec<bool> = history.iter().map(TurnRound::is_open).collect();
        assert_eq!(open, vec![false, true]);
    }

    #[test]
    fn history_is_bounded() {
        let mut history = RoundHistory::new(3);
        let t0 = Instant::now();
        for _ in 0..5 {
            history.open_for_generation(t0);
        }
        assert_eq!(history.len(), 3);
        let indices: Vec<u64> = history.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }
}
