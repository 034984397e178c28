//! Inbound turn-lifecycle signals and the textual markers that carry them.

use std::fmt;

/// Outbound end-of-turn acknowledgement.
pub const END_OF_TURN_MARKER: &str = "<state><play_end>";

const STATE_PREFIX: &str = "<state>";

/// Closed set of transport signals the turn machine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnSignal {
    /// Model finished loading on the peer; the session is initializing.
    ModelReady,
    ModelInitFailed,
    SessionReady,
    /// End of user speech; the peer starts thinking.
    ActivityDetected,
    GenerationStart,
    /// Early hint that audio for the current generation is on its way.
    AudioBeginHint,
    GenerationEnd,
    ModerationBlock,
    /// The peer received our end-of-turn acknowledgement.
    AckConfirmed,
    InterruptRequested,
    PeerExit,
}

// Matched in order; no marker here is a prefix of another.
const MARKERS: &[(&str, TurnSignal)] = &[
    ("<state><play_end_success>", TurnSignal::AckConfirmed),
    ("<state><model_init_success>", TurnSignal::ModelReady),
    ("<state><model_init_failed>", TurnSignal::ModelInitFailed),
    ("<state><session_init>", TurnSignal::SessionReady),
    ("<state><vad_end>", TurnSignal::ActivityDetected),
    ("<state><generate_start>", TurnSignal::GenerationStart),
    ("<state><audio_start>", TurnSignal::AudioBeginHint),
    ("<state><generate_end>", TurnSignal::GenerationEnd),
    ("<state><audit_stop>", TurnSignal::ModerationBlock),
    ("<state><session_break>", TurnSignal::InterruptRequested),
    ("<state><robot_exit>", TurnSignal::PeerExit),
];

impl TurnSignal {
    /// Find the signal carried by a data-channel message, if any.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        MARKERS
            .iter()
            .find(|(marker, _)| text.contains(marker))
            .map(|&(_, signal)| signal)
    }

    #[must_use]
    pub fn marker(self) -> &'static str {
        MARKERS
            .iter()
            .find(|&&(_, signal)| signal == self)
            .map_or("", |&(marker, _)| marker)
    }
}

impl fmt::Display for TurnSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ModelReady => "model-ready",
            Self::ModelInitFailed => "model-init-failed",
            Self::SessionReady => "session-ready",
            Self::ActivityDetected => "activity-detected",
            Self::GenerationStart => "generation-start",
            Self::AudioBeginHint => "audio-begin-hint",
            Self::GenerationEnd => "generation-end",
            Self::ModerationBlock => "moderation-block",
            Self::AckConfirmed => "end-of-turn-ack-confirmed",
            Self::InterruptRequested => "interrupt-requested",
            Self::PeerExit => "peer-exit",
        };
        f.write_str(name)
    }
}

/// A data-channel text message after classification at the transport edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Signal(TurnSignal),
    /// Free text for display.
    Chat(String),
    /// A state marker this build does not know.
    Unrecognized(String),
}

impl Inbound {
    #[must_use]
    pub fn classify(text: &str) -> Self {
        if let Some(signal) = TurnSignal::parse(text) {
            Self::Signal(signal)
        } else if text.contains(STATE_PREFIX) {
            Self::Unrecognized(text.to_string())
        } else {
            Self::Chat(text.to_string())
        }
    }
}
