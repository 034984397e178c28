use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::error::{PlaybackError, Result};

const CHUNK_SIZE: usize = 1024;

/// Streaming mono resampler from a segment's native rate to the engine rate.
///
/// Input that does not fill a whole resampler chunk is carried over to the
/// next call, so consecutive segments of one turn resample as one stream.
pub struct Resampler {
    inner: Option<Fft<f32>>,
    source_rate: u32,
    target_rate: u32,
    input_buf: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                Fft::new(
                    source_rate as usize,
                    target_rate as usize,
                    CHUNK_SIZE,
                    2, // sub_chunks
                    1, // mono in, mono out
                    FixedSync::Input,
                )
                .map_err(|e| PlaybackError::Resample(format!("failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            source_rate,
            target_rate,
            input_buf: Vec::new(),
        })
    }

    #[must_use]
    pub const fn source_rate(&self) -> u32 {
        self.source_rate
    }

    #[must_use]
    pub const fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Resample as much of `mono` (plus carried-over input) as fills whole chunks.
    pub fn process(&mut self, mono: &[f32]) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.inner else {
            return Ok(mono.to_vec());
        };

        self.input_buf.extend_from_slice(mono);

        let mut output = Vec::new();
        let frames_needed = resampler.input_frames_next();

        while self.input_buf.len() >= frames_needed {
            let chunk: Vec<f32> = self.input_buf.drain(..frames_needed).collect();
            // Wrap as 1-channel sequential buffer for rubato 1.0
            let input_data = vec![chunk];
            let input = SequentialSliceOfVecs::new(&input_data, 1, frames_needed)
                .map_err(|e| PlaybackError::Resample(format!("buffer error: {e}")))?;
            let result = resampler
                .process(&input, 0, None)
                .map_err(|e| PlaybackError::Resample(format!("resample error: {e}")))?;
            let out_frames = result.frames();
            for frame in 0..out_frames {
                output.push(result.read_sample(0, frame).unwrap_or(0.0));
            }
        }

        Ok(output)
    }

    /// Push out whatever is still carried over by padding with silence.
    ///
    /// The resampler's internal history is not reusable afterwards; callers
    /// build a fresh one for the next turn.
    pub fn flush(mut self) -> Result<Vec<f32>> {
        let Some(ref resampler) = self.inner else {
            return Ok(Vec::new());
        };
        if self.input_buf.is_empty() {
            return Ok(Vec::new());
        }

        let frames_needed = resampler.input_frames_next();
        let pad = frames_needed - self.input_buf.len() % frames_needed;
        let carried = self.input_buf.len();
        let mut tail = self.process(&vec![0.0; pad])?;

        // Keep only the part that corresponds to real input.
        let expected =
            (carried as u64 * u64::from(self.target_rate)).div_ceil(u64::from(self.source_rate));
        tail.truncate(expected as usize);
        Ok(tail)
    }
}
