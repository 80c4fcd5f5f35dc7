//! Configuration management for ScribeBot
//!
//! Loads settings from environment variables (.env file)

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token
    pub discord_token: String,
    /// Optional guild ID for development (faster command sync)
    pub guild_id: Option<u64>,
    /// Directory for raw PCM recordings
    pub recordings_dir: PathBuf,
    /// Capture and mixing parameters
    pub audio: AudioConfig,
}

/// Parameters of the capture/mixing engine
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate of decoded audio (Discord uses 48kHz)
    pub sample_rate: u32,
    /// Channel count of decoded audio (Discord uses stereo)
    pub channels: u16,
    /// Period of the mixer tick
    pub mix_tick: Duration,
    /// Silence duration after which a speaker's subscription ends
    pub silence_timeout: Duration,
    /// Delay between subscription end and channel removal, so the mixer
    /// can drain chunks decoded just before the stream ended
    pub grace_period: Duration,
    /// Bound on the voice connect wait
    pub connect_timeout: Duration,
    /// Cap on undrained PCM chunks per speaker; oldest are dropped beyond it
    pub max_queued_chunks: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            mix_tick: Duration::from_millis(20),
            silence_timeout: Duration::from_millis(2_000),
            grace_period: Duration::from_millis(1_000),
            connect_timeout: Duration::from_secs(30),
            max_queued_chunks: 512,
        }
    }
}

impl AudioConfig {
    /// Nominal size in bytes of one mix tick's worth of audio
    /// (48kHz / stereo / 16-bit / 20ms => 3840)
    pub fn frame_bytes(&self) -> usize {
        self.sample_rate as usize
            * self.channels as usize
            * 2
            * self.mix_tick.as_millis() as usize
            / 1000
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("DISCORD_TOKEN".to_string()))?;

        let guild_id = env::var("GUILD_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue("GUILD_ID".to_string(), s))
            })
            .transpose()?;

        let recordings_dir = env::var("RECORDINGS_DIR")
            .unwrap_or_else(|_| "recordings".to_string())
            .into();

        let mut audio = AudioConfig::default();
        if let Some(ms) = env_millis("SILENCE_TIMEOUT_MS")? {
            audio.silence_timeout = ms;
        }
        if let Some(ms) = env_millis("GRACE_PERIOD_MS")? {
            audio.grace_period = ms;
        }
        if let Some(ms) = env_millis("CONNECT_TIMEOUT_MS")? {
            audio.connect_timeout = ms;
        }

        Ok(Self {
            discord_token,
            guild_id,
            recordings_dir,
            audio,
        })
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidValue(key.to_string(), s))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        let audio = AudioConfig::default();
        assert_eq!(audio.frame_bytes(), 3840);
    }

    #[test]
    fn test_defaults() {
        let audio = AudioConfig::default();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.mix_tick, Duration::from_millis(20));
        assert_eq!(audio.silence_timeout, Duration::from_secs(2));
        assert_eq!(audio.grace_period, Duration::from_secs(1));
        assert_eq!(audio.connect_timeout, Duration::from_secs(30));
    }
}
