use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::DecodeConfig;
use crate::error::{PlaybackError, Result};

/// Mono samples decoded from one payload, at the payload's own rate.
#[derive(Debug, Clone)]
pub struct DecodedSegment {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl DecodedSegment {
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Turns an encoded payload into mono samples.
///
/// The decode worker calls this from its own thread, one payload at a time.
pub trait SegmentDecoder: Send {
    fn decode(&mut self, payload: &str) -> Result<DecodedSegment>;
}

/// Bounded memo of decoded payloads with oldest-inserted eviction.
pub struct PcmCache {
    entries: HashMap<String, DecodedSegment>,
    order: VecDeque<String>,
    capacity: usize,
}

impl PcmCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn get(&self, payload: &str) -> Option<DecodedSegment> {
        self.entries.get(payload).cloned()
    }

    pub fn insert(&mut self, payload: String, segment: DecodedSegment) {
        if self.capacity == 0 || self.entries.contains_key(&payload) {
            return;
        }
        if self.entries.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        self.order.push_back(payload.clone());
        self.entries.insert(payload, segment);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decoder for base64 WAV payloads (and, optionally, headerless 16-bit PCM).
pub struct PcmDecoder {
    cache: PcmCache,
    raw_pcm_rate: Option<u32>,
}

impl PcmDecoder {
    #[must_use]
    pub fn new(config: &DecodeConfig) -> Self {
        Self {
            cache: PcmCache::new(config.cache_capacity),
            raw_pcm_rate: config.raw_pcm_rate,
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &PcmCache {
        &self.cache
    }

    fn decode_bytes(&self, bytes: &[u8]) -> Result<DecodedSegment> {
        if bytes.starts_with(b"RIFF") {
            return decode_wav(bytes);
        }

        match self.raw_pcm_rate {
            Some(rate) => decode_raw_pcm16(bytes, rate),
            None => Err(PlaybackError::Decode(
                "payload is not a WAV container".to_string(),
            )),
        }
    }
}

impl SegmentDecoder for PcmDecoder {
    fn decode(&mut self, payload: &str) -> Result<DecodedSegment> {
        if let Some(hit) = self.cache.get(payload) {
            return Ok(hit);
        }

        let bytes = STANDARD
            .decode(strip_data_uri(payload).trim())
            .map_err(|e| PlaybackError::Decode(format!("invalid base64: {e}")))?;
        let segment = self.decode_bytes(&bytes)?;
        self.cache.insert(payload.to_string(), segment.clone());
        Ok(segment)
    }
}

/// Drop a `data:<mime>;base64,` prefix if present.
#[must_use]
pub fn strip_data_uri(payload: &str) -> &str {
    payload
        .split_once(";base64,")
        .map_or(payload, |(_, data)| data)
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedSegment> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PlaybackError::Decode(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| PlaybackError::Decode(format!("WAV sample error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| PlaybackError::Decode(format!("WAV sample error: {e}")))?
        }
    };

    if interleaved.is_empty() {
        return Err(PlaybackError::Decode("WAV contains no samples".to_string()));
    }

    Ok(DecodedSegment {
        samples: downmix(&interleaved, spec.channels).into(),
        sample_rate: spec.sample_rate,
    })
}

fn decode_raw_pcm16(bytes: &[u8], sample_rate: u32) -> Result<DecodedSegment> {
    if bytes.len() < 2 {
        return Err(PlaybackError::Decode("PCM payload too short".to_string()));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    Ok(DecodedSegment {
        samples: samples.into(),
        sample_rate,
    })
}

/// Average interleaved channels into one.
#[must_use]
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    let ch = channels as usize;
    interleaved
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}
