//! Timed JSON-lines session scripts.
//!
//! Each non-empty line is one event with an `at_ms` offset from the start of
//! the replay and a `kind`:
//!
//! ```text
//! {"at_ms": 0, "kind": "text", "text": "<state><session_init>"}
//! {"at_ms": 120, "kind": "wav", "path": "hello.wav"}
//! {"at_ms": 140, "kind": "audio", "payload": "UklGR..."}
//! {"at_ms": 900, "kind": "speaking", "participant": "agent", "active": false}
//! ```
//!
//! Lines starting with `#` are comments. `wav` paths are relative to the
//! script file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::audio::decode::PcmDecoder;
use crate::audio::output::AudioOutput;
use crate::config::Config;
use crate::error::{PlaybackError, Result};
use crate::session::{Session, SessionInput, SessionOutput};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayEvent {
    Text { text: String },
    Audio { payload: String },
    Wav { path: PathBuf },
    Speaking { participant: String, active: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplayLine {
    #[serde(default)]
    pub at_ms: u64,
    #[serde(flatten)]
    pub event: ReplayEvent,
}

/// A script resolved into session inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub steps: Vec<(Duration, SessionInput)>,
}

pub fn parse_lines(contents: &str) -> Result<Vec<ReplayLine>> {
    let mut lines = Vec::new();
    let mut last_at = 0;

    for (number, raw) in contents.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }

        let line: ReplayLine = serde_json::from_str(raw)
            .map_err(|e| PlaybackError::Protocol(format!("line {}: {e}", number + 1)))?;
        if line.at_ms < last_at {
            return Err(PlaybackError::Protocol(format!(
                "line {}: at_ms {} is earlier than the previous event ({last_at})",
                number + 1,
                line.at_ms
            )));
        }
        last_at = line.at_ms;
        lines.push(line);
    }

    Ok(lines)
}

impl Script {
    /// Parse a script and load any WAV files it references from `base_dir`.
    pub fn resolve(lines: Vec<ReplayLine>, base_dir: &Path) -> Result<Self> {
        let steps = lines
            .into_iter()
            .map(|line| {
                let input = match line.event {
                    ReplayEvent::Text { text } => SessionInput::Text(text),
                    ReplayEvent::Audio { payload } => SessionInput::Audio(payload),
                    ReplayEvent::Wav { path } => {
                        let path = base_dir.join(path);
                        let bytes = std::fs::read(&path).map_err(|e| {
                            PlaybackError::Other(format!("failed to read {}: {e}", path.display()))
                        })?;
                        SessionInput::Audio(STANDARD.encode(bytes))
                    }
                    ReplayEvent::Speaking {
                        participant,
                        active,
                    } => SessionInput::Speaking {
                        participant,
                        active,
                    },
                };
                Ok((Duration::from_millis(line.at_ms), input))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { steps })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let lines = parse_lines(&contents)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::resolve(lines, base_dir)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Send every step at its offset from now.
pub async fn feed(script: Script, inputs: &mpsc::Sender<SessionInput>) -> Result<()> {
    let start = tokio::time::Instant::now();
    for (at, input) in script.steps {
        tokio::time::sleep_until(start + at).await;
        inputs
            .send(input)
            .await
            .map_err(|_| PlaybackError::Other("session closed during replay".to_string()))?;
    }
    Ok(())
}

/// One JSON line describing something the session reported.
#[must_use]
pub fn output_record(at: Duration, output: &SessionOutput) -> serde_json::Value {
    let at_ms = at.as_millis() as u64;
    match output {
        SessionOutput::Send(text) => {
            serde_json::json!({ "at_ms": at_ms, "kind": "send", "text": text })
        }
        SessionOutput::Phase(phase) => {
            serde_json::json!({ "at_ms": at_ms, "kind": "phase", "phase": phase.to_string() })
        }
        SessionOutput::Chat(text) => {
            serde_json::json!({ "at_ms": at_ms, "kind": "chat", "text": text })
        }
        SessionOutput::MuteRemoteAudio(muted) => {
            serde_json::json!({ "at_ms": at_ms, "kind": "mute", "muted": muted })
        }
    }
}

/// Play a script through the output device, printing session outputs to
/// stdout as JSON lines. The session keeps running for `linger` after the
/// last step so trailing audio and timers can finish.
pub async fn run(config: &Config, path: &Path, linger: Duration) -> Result<()> {
    let script = Script::load(path)?;
    tracing::info!("replaying {} event(s) from {}", script.len(), path.display());

    let output = AudioOutput::new(&config.audio, &config.ring)?;
    tracing::info!(
        "output: {} Hz, {} channel(s)",
        output.sample_rate(),
        output.channels()
    );

    let (output_tx, mut output_rx) = mpsc::channel(64);
    let (input_tx, input_rx) = mpsc::channel(64);
    let session = Session::new(
        config,
        output.handle(),
        PcmDecoder::new(&config.decode),
        None,
        output_tx,
    )?;

    output.start()?;
    let session_task = tokio::spawn(session.run(input_rx));
    let feeder = tokio::spawn(async move {
        let fed = feed(script, &input_tx).await;
        tokio::time::sleep(linger).await;
        fed
    });

    let start = tokio::time::Instant::now();
    while let Some(event) = output_rx.recv().await {
        println!("{}", output_record(start.elapsed(), &event));
    }

    feeder
        .await
        .map_err(|e| PlaybackError::Other(format!("replay feeder failed: {e}")))??;
    session_task
        .await
        .map_err(|e| PlaybackError::Other(format!("session task failed: {e}")))??;

    output.pause()?;
    Ok(())
}
