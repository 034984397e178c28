pub mod decode;
pub mod output;
pub mod resample;
pub mod ring;
pub mod scheduler;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::mpsc;

use crate::error::Result;

use self::decode::SegmentDecoder;
use self::resample::Resampler;

/// Work items for the decode thread, handled strictly in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeRequest {
    Segment { seq: u64, payload: String },
    /// Upstream audio for the turn is complete; flush resampler state.
    EndOfTurn,
    /// Discard resampler state without flushing (interrupt).
    Reset,
}

/// Results from the decode thread, in the order requests were submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutput {
    /// Mono samples at the engine rate.
    Segment {
        seq: u64,
        samples: Vec<f32>,
        source_rate: u32,
    },
    Dropped {
        seq: u64,
        error: String,
    },
    /// Resampler tail for the finished turn, possibly empty.
    EndOfTurn { tail: Vec<f32> },
    /// Every output before this one belongs to the discarded stream.
    ResetDone,
}

/// Submission side of the decode thread.
#[derive(Clone)]
pub struct DecodeInput {
    tx: Sender<DecodeRequest>,
}

impl DecodeInput {
    pub fn segment(&self, seq: u64, payload: String) {
        self.send(DecodeRequest::Segment { seq, payload });
    }

    pub fn end_of_turn(&self) {
        self.send(DecodeRequest::EndOfTurn);
    }

    pub fn reset(&self) {
        self.send(DecodeRequest::Reset);
    }

    fn send(&self, request: DecodeRequest) {
        if self.tx.send(request).is_err() {
            tracing::debug!("decode thread gone, request discarded");
        }
    }
}

/// Runs payload decoding in a dedicated thread: decode → resample → send.
///
/// A single thread consumes a FIFO, so outputs come back in the order the
/// segments were submitted no matter how long each one takes to decode.
pub fn start_decode_pipeline<D>(
    decoder: D,
    target_rate: u32,
    output_tx: mpsc::Sender<DecodeOutput>,
) -> Result<DecodeInput>
where
    D: SegmentDecoder + 'static,
{
    let (tx, rx) = unbounded::<DecodeRequest>();

    std::thread::Builder::new()
        .name("talkback-decode".to_string())
        .spawn(move || run_decode_loop(decoder, target_rate, &rx, &output_tx))?;

    Ok(DecodeInput { tx })
}

fn run_decode_loop<D: SegmentDecoder>(
    mut decoder: D,
    target_rate: u32,
    rx: &Receiver<DecodeRequest>,
    output_tx: &mpsc::Sender<DecodeOutput>,
) {
    tracing::debug!("decode pipeline: target_rate={target_rate}");

    let mut resampler: Option<Resampler> = None;
    let mut decoded = 0usize;
    let mut dropped = 0usize;

    while let Ok(request) = rx.recv() {
        let output = match request {
            DecodeRequest::Segment { seq, payload } => {
                match decode_segment(&mut decoder, &mut resampler, target_rate, &payload) {
                    Ok((samples, source_rate)) => {
                        decoded += 1;
                        DecodeOutput::Segment {
                            seq,
                            samples,
                            source_rate,
                        }
                    }
                    Err(e) => {
                        dropped += 1;
                        tracing::warn!("dropping segment {seq}: {e}");
                        DecodeOutput::Dropped {
                            seq,
                            error: e.to_string(),
                        }
                    }
                }
            }
            DecodeRequest::EndOfTurn => {
                let tail = match resampler.take().map(Resampler::flush) {
                    Some(Ok(tail)) => tail,
                    Some(Err(e)) => {
                        tracing::warn!("resampler flush failed: {e}");
                        Vec::new()
                    }
                    None => Vec::new(),
                };
                tracing::debug!(
                    "decode pipeline: end of turn, decoded={decoded}, dropped={dropped}, tail={}",
                    tail.len()
                );
                decoded = 0;
                dropped = 0;
                DecodeOutput::EndOfTurn { tail }
            }
            DecodeRequest::Reset => {
                resampler = None;
                decoded = 0;
                dropped = 0;
                DecodeOutput::ResetDone
            }
        };

        if output_tx.blocking_send(output).is_err() {
            tracing::debug!("decode receiver dropped, stopping decode pipeline");
            return;
        }
    }

    tracing::debug!("decode pipeline thread exiting");
}

fn decode_segment<D: SegmentDecoder>(
    decoder: &mut D,
    resampler: &mut Option<Resampler>,
    target_rate: u32,
    payload: &str,
) -> Result<(Vec<f32>, u32)> {
    let segment = decoder.decode(payload)?;
    let source_rate = segment.sample_rate;

    // A rate change mid-turn starts a new resampling stream.
    let mut carried = Vec::new();
    let mut active = match resampler.take() {
        Some(r) if r.source_rate() == source_rate => r,
        Some(previous) => {
            carried = previous.flush()?;
            Resampler::new(source_rate, target_rate)?
        }
        None => Resampler::new(source_rate, target_rate)?,
    };

    let mut samples = active.process(&segment.samples)?;
    *resampler = Some(active);

    if !carried.is_empty() {
        carried.append(&mut samples);
        samples = carried;
    }

    Ok((samples, source_rate))
}
