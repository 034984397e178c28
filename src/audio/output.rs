use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};

use crate::config::{AudioConfig, RingConfig};
use crate::error::{PlaybackError, Result};

use super::ring::{self, RingBuffer, RingHandle, RingProcessor};

/// Frames rendered per pass. Larger device buffers are filled in several
/// passes so the callback never allocates.
const MAX_CALLBACK_FRAMES: usize = 8192;

/// Speaker output via cpal, rendering from a ring buffer owned by the callback.
pub struct AudioOutput {
    stream: Stream,
    handle: RingHandle,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    pub fn new(config: &AudioConfig, ring_config: &RingConfig) -> Result<Self> {
        let device = find_output_device(config.device.as_deref())?;

        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::Audio(format!("failed to get default output config: {e}")))?;

        let sample_rate = supported.sample_rate();
        let channels = supported.channels();

        let stream_config = StreamConfig {
            channels,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let ring = RingBuffer::new(
            ring_config.capacity_samples(sample_rate),
            ring_config.frame_size,
            ring_config.priming_cycles,
        );
        let (handle, mut processor) = ring::channel(ring, sample_rate);

        let err_fn = |err: cpal::StreamError| {
            tracing::error!("audio output stream error: {err}");
        };

        let ch = usize::from(channels).max(1);
        let mut mono = vec![0.0f32; MAX_CALLBACK_FRAMES];

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    render_interleaved(&mut processor, &mut mono, data, ch);
                },
                err_fn,
                None,
            )
            .map_err(|e| PlaybackError::Audio(format!("failed to build output stream: {e}")))?;

        tracing::debug!(
            "audio output: rate={sample_rate}, channels={channels}, ring={}s",
            ring_config.capacity_secs
        );

        Ok(Self {
            stream,
            handle,
            sample_rate,
            channels,
        })
    }

    /// Start the audio stream.
    pub fn start(&self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| PlaybackError::Audio(format!("failed to start audio stream: {e}")))
    }

    /// Stop the audio stream.
    pub fn pause(&self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| PlaybackError::Audio(format!("failed to pause audio stream: {e}")))
    }

    #[must_use]
    pub fn handle(&self) -> RingHandle {
        self.handle.clone()
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }
}

/// Render mono from the ring into every channel of an interleaved buffer.
fn render_interleaved(
    processor: &mut RingProcessor,
    scratch: &mut [f32],
    data: &mut [f32],
    channels: usize,
) {
    for block in data.chunks_mut(scratch.len() * channels) {
        let mono = &mut scratch[..block.len() / channels];
        processor.process(mono);
        for (frame, &sample) in block.chunks_exact_mut(channels).zip(mono.iter()) {
            frame.fill(sample);
        }
    }
}

fn device_name(device: &Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

fn find_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        host.output_devices()
            .map_err(|e| PlaybackError::Audio(format!("failed to enumerate output devices: {e}")))?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| PlaybackError::Audio(format!("output device not found: {name}")))
    } else {
        host.default_output_device()
            .ok_or_else(|| PlaybackError::Audio("no default output device available".to_string()))
    }
}

/// Names of every output device on the default host.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| PlaybackError::Audio(format!("failed to enumerate output devices: {e}")))?;

    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_output_device_name() -> Option<String> {
    cpal::default_host()
        .default_output_device()
        .and_then(|d| device_name(&d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_larger_than_scratch_render_in_passes() {
        let (handle, mut processor) = ring::channel(RingBuffer::new(256, 4, 0), 48_000);
        let input: Vec<f32> = (0..40).map(|i| i as f32 / 40.0).collect();
        handle.add(input.clone());

        let mut scratch = [0.0f32; 16];
        let mut data = vec![1.0f32; 48 * 2];
        render_interleaved(&mut processor, &mut scratch, &mut data, 2);

        let expected: Vec<f32> = input
            .iter()
            .chain(std::iter::repeat(&0.0).take(8))
            .flat_map(|&s| [s, s])
            .collect();
        assert_eq!(data, expected);
        assert_eq!(handle.stats().rendered(), 48);
    }

    #[test]
    fn partial_trailing_frame_is_left_untouched() {
        let (handle, mut processor) = ring::channel(RingBuffer::new(64, 4, 0), 48_000);
        handle.add(vec![0.5; 8]);

        let mut scratch = [0.0f32; 4];
        let mut data = vec![1.0f32; 7];
        render_interleaved(&mut processor, &mut scratch, &mut data, 2);

        assert_eq!(data, vec![0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 1.0]);
    }
}
