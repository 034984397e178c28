use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PlaybackError, Result};

const fn default_capacity_secs() -> u32 {
    30
}

const fn default_frame_size() -> usize {
    128
}

const fn default_priming_cycles() -> u32 {
    128
}

const fn default_prebuffer_ms() -> u64 {
    200
}

const fn default_prebuffer_timeout_ms() -> u64 {
    200
}

const fn default_stream_chunk_ms() -> u64 {
    500
}

const fn default_merge_delay_ms() -> u64 {
    150
}

const fn default_fade_samples() -> usize {
    128
}

const fn default_cache_capacity() -> usize {
    100
}

const fn default_stale_speaking_ms() -> u64 {
    500
}

const fn default_recent_generation_end_ms() -> u64 {
    1000
}

const fn default_round_history() -> usize {
    20
}

const fn default_buffered_ahead_epsilon_ms() -> u64 {
    50
}

const fn default_near_end_epsilon_ms() -> u64 {
    100
}

const fn default_short_audio_secs() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub ring: RingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub decode: DecodeConfig,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioConfig {
    /// Output device name; the host default is used when unset.
    pub device: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    #[serde(default = "default_capacity_secs")]
    pub capacity_secs: u32,

    /// Samples sacrificed from the read side when a write catches up with it.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// Callback cycles of forced silence after creation or `clear`.
    #[serde(default = "default_priming_cycles")]
    pub priming_cycles: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity_secs: default_capacity_secs(),
            frame_size: default_frame_size(),
            priming_cycles: default_priming_cycles(),
        }
    }
}

impl RingConfig {
    #[must_use]
    pub const fn capacity_samples(&self, sample_rate: u32) -> usize {
        self.capacity_secs as usize * sample_rate as usize
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_prebuffer_ms")]
    pub prebuffer_ms: u64,

    #[serde(default = "default_prebuffer_timeout_ms")]
    pub prebuffer_timeout_ms: u64,

    #[serde(default = "default_stream_chunk_ms")]
    pub stream_chunk_ms: u64,

    #[serde(default = "default_merge_delay_ms")]
    pub merge_delay_ms: u64,

    #[serde(default = "default_fade_samples")]
    pub fade_samples: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prebuffer_ms: default_prebuffer_ms(),
            prebuffer_timeout_ms: default_prebuffer_timeout_ms(),
            stream_chunk_ms: default_stream_chunk_ms(),
            merge_delay_ms: default_merge_delay_ms(),
            fade_samples: default_fade_samples(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodeConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Sample rate of headerless 16-bit little-endian PCM payloads. Without it
    /// only WAV payloads are accepted.
    pub raw_pcm_rate: Option<u32>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            raw_pcm_rate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    #[default]
    Audio,
    Video,
}

/// Timing knobs for the end-of-turn confirmation sequence.
///
/// These are network-dependent tuning values rather than semantic constants,
/// which is why both modes are fully configurable.
#[derive(Debug, Clone, Deserialize)]
pub struct SilenceProfile {
    /// Quiet period after a speaking-activity drop before checks begin.
    pub timeout_ms: u64,
    /// Settle delay between the silence timeout and the first probe check.
    pub safety_delay_ms: u64,
    /// Buffer applied on the generation-end path.
    pub generation_end_buffer_ms: u64,
    /// Minimum protection for short clips still rendering at generation-end.
    pub min_audio_ms: u64,
    pub required_confirmations: u32,
    pub confirm_spacing_ms: u64,
    pub final_delay_ms: u64,
    /// Interval for re-checking while the probe still reports audio.
    pub recheck_ms: u64,
}

impl SilenceProfile {
    #[must_use]
    pub const fn audio() -> Self {
        Self {
            timeout_ms: 800,
            safety_delay_ms: 300,
            generation_end_buffer_ms: 1000,
            min_audio_ms: 600,
            required_confirmations: 1,
            confirm_spacing_ms: 250,
            final_delay_ms: 150,
            recheck_ms: 100,
        }
    }

    #[must_use]
    pub const fn video() -> Self {
        Self {
            timeout_ms: 1500,
            safety_delay_ms: 500,
            generation_end_buffer_ms: 1200,
            min_audio_ms: 800,
            required_confirmations: 2,
            confirm_spacing_ms: 500,
            final_delay_ms: 300,
            recheck_ms: 300,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn safety_delay(&self) -> Duration {
        Duration::from_millis(self.safety_delay_ms)
    }

    #[must_use]
    pub const fn generation_end_buffer(&self) -> Duration {
        Duration::from_millis(self.generation_end_buffer_ms)
    }

    #[must_use]
    pub const fn min_audio(&self) -> Duration {
        Duration::from_millis(self.min_audio_ms)
    }

    #[must_use]
    pub const fn confirm_spacing(&self) -> Duration {
        Duration::from_millis(self.confirm_spacing_ms)
    }

    #[must_use]
    pub const fn final_delay(&self) -> Duration {
        Duration::from_millis(self.final_delay_ms)
    }

    #[must_use]
    pub const fn recheck(&self) -> Duration {
        Duration::from_millis(self.recheck_ms)
    }
}

fn default_audio_profile() -> SilenceProfile {
    SilenceProfile::audio()
}

fn default_video_profile() -> SilenceProfile {
    SilenceProfile::video()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    #[serde(default)]
    pub mode: CallMode,

    /// Speaking-activity arriving this soon after an acknowledgement is stale.
    #[serde(default = "default_stale_speaking_ms")]
    pub stale_speaking_ms: u64,

    #[serde(default = "default_recent_generation_end_ms")]
    pub recent_generation_end_ms: u64,

    #[serde(default = "default_round_history")]
    pub round_history: usize,

    #[serde(default = "default_audio_profile")]
    pub audio: SilenceProfile,

    #[serde(default = "default_video_profile")]
    pub video: SilenceProfile,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            mode: CallMode::default(),
            stale_speaking_ms: default_stale_speaking_ms(),
            recent_generation_end_ms: default_recent_generation_end_ms(),
            round_history: default_round_history(),
            audio: default_audio_profile(),
            video: default_video_profile(),
        }
    }
}

impl TurnConfig {
    /// The silence profile for the configured call mode.
    #[must_use]
    pub const fn profile(&self) -> &SilenceProfile {
        match self.mode {
            CallMode::Audio => &self.audio,
            CallMode::Video => &self.video,
        }
    }

    #[must_use]
    pub const fn stale_speaking(&self) -> Duration {
        Duration::from_millis(self.stale_speaking_ms)
    }

    #[must_use]
    pub const fn recent_generation_end(&self) -> Duration {
        Duration::from_millis(self.recent_generation_end_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_buffered_ahead_epsilon_ms")]
    pub buffered_ahead_epsilon_ms: u64,

    #[serde(default = "default_near_end_epsilon_ms")]
    pub near_end_epsilon_ms: u64,

    #[serde(default = "default_short_audio_secs")]
    pub short_audio_secs: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            buffered_ahead_epsilon_ms: default_buffered_ahead_epsilon_ms(),
            near_end_epsilon_ms: default_near_end_epsilon_ms(),
            short_audio_secs: default_short_audio_secs(),
        }
    }
}

impl ProbeConfig {
    #[must_use]
    pub fn buffered_ahead_epsilon(&self) -> f64 {
        self.buffered_ahead_epsilon_ms as f64 / 1000.0
    }

    #[must_use]
    pub fn near_end_epsilon(&self) -> f64 {
        self.near_end_epsilon_ms as f64 / 1000.0
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PlaybackError::Config(format!(
                "config file not found: {} (create it or pass --config)",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            PlaybackError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            PlaybackError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ring.capacity_secs == 0 {
            return Err(PlaybackError::Config(
                "ring.capacity_secs must be at least 1".to_string(),
            ));
        }
        if self.ring.frame_size == 0 {
            return Err(PlaybackError::Config(
                "ring.frame_size must be non-zero".to_string(),
            ));
        }
        if self.turn.profile().required_confirmations == 0 {
            return Err(PlaybackError::Config(
                "turn profile required_confirmations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("talkback/config.yaml")
    }

    /// Write `audio.device` into the YAML file at `path`, creating it if needed.
    pub fn set_audio_device(path: &Path, device: &str) -> Result<()> {
        use serde_yaml_ng::{Mapping, Value};

        let mut root = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            match serde_yaml_ng::from_str::<Value>(&contents) {
                Ok(Value::Mapping(m)) => m,
                Ok(Value::Null) => Mapping::new(),
                Ok(_) => {
                    return Err(PlaybackError::Config(format!(
                        "config file {} is not a mapping",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(PlaybackError::Config(format!(
                        "failed to parse config file {}: {e}",
                        path.display()
                    )));
                }
            }
        } else {
            Mapping::new()
        };

        let audio = root
            .entry(Value::String("audio".to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()))
            .as_mapping_mut()
            .ok_or_else(|| PlaybackError::Config("audio section is not a mapping".to_string()))?;
        audio.insert(
            Value::String("device".to_string()),
            Value::String(device.to_string()),
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml_ng::to_string(&Value::Mapping(root))
            .map_err(|e| PlaybackError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}
