//! Engine configuration
//!
//! Loaded from `config.toml` in the platform config directory, falling back
//! to defaults for anything missing.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{ConnectionError, Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub live: LiveConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub monitor: MonitorConfig,
    pub peer: PeerConfig,
}

impl AppConfig {
    /// Default location: `<config dir>/live-voice-engine/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "livevoice", "live-voice-engine")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, or defaults if there is no file
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Remote live agent session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Websocket endpoint of the bidirectional session
    pub endpoint: String,
    /// API key; when absent it is read from `api_key_env`
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub model: String,
    /// Prebuilt synthetic voice
    pub voice: String,
    /// Persona instruction sent at setup
    pub instruction: String,
    /// Samples per outbound frame
    pub frame_samples: usize,
    /// Outbound frames buffered before dropping the oldest
    pub send_queue_capacity: usize,
    /// Time allowed for the session handshake
    pub connect_timeout_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key: None,
            api_key_env: "GEMINI_API_KEY".to_string(),
            model: "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice: "Kore".to_string(),
            instruction: "You are a participant in a voice chat. Be casual, brief and fun. Don't give long speeches.".to_string(),
            frame_samples: DEFAULT_FRAME_SAMPLES,
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            connect_timeout_ms: 10_000,
        }
    }
}

impl LiveConfig {
    /// Resolve the API key from the config or the environment
    pub fn resolve_api_key(&self) -> std::result::Result<String, ConnectionError> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConnectionError::MissingApiKey(self.api_key_env.clone()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Input device selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device id (`input:<name>`); default device when unset
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub buffer_size: Option<u32>,
}

/// Output device and scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Device id (`output:<name>`); default device when unset
    pub device: Option<String>,
    /// Delay before the agent counts as silent after its last source ends
    pub release_ms: u64,
    /// Lead time applied to live peer audio
    pub peer_latency_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            release_ms: SPEAKING_RELEASE_MS,
            peer_latency_ms: 60,
        }
    }
}

impl PlaybackConfig {
    pub fn release(&self) -> Duration {
        Duration::from_millis(self.release_ms)
    }

    pub fn peer_latency(&self) -> Duration {
        Duration::from_millis(self.peer_latency_ms)
    }
}

/// Speaking detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub fft_size: usize,
    /// Average byte magnitude above which the stream is speaking
    pub threshold: f32,
    /// Time constant of the spectrum smoothing (0..1)
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    /// How long "speaking" is held after the level falls below threshold
    pub hold_ms: u64,
    pub tick_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            fft_size: ANALYSER_FFT_SIZE,
            threshold: SPEAKING_THRESHOLD,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            hold_ms: 150,
            tick_ms: MONITOR_TICK_MS,
        }
    }
}

impl MonitorConfig {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Peer links
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Local UDP bind address for the direct transport
    pub bind_address: String,
    /// Address advertised in the shareable id; the bind address when unset
    pub advertise_address: Option<String>,
    /// Time allowed for a call to be answered
    pub call_timeout_ms: u64,
    /// Offer retransmission interval
    pub offer_interval_ms: u64,
    /// Samples per media frame
    pub frame_samples: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".to_string(),
            advertise_address: None,
            call_timeout_ms: 10_000,
            offer_interval_ms: 250,
            frame_samples: PEER_FRAME_SAMPLES,
        }
    }
}

impl PeerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn offer_interval(&self) -> Duration {
        Duration::from_millis(self.offer_interval_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [live]
            voice = "Puck"

            [monitor]
            threshold = 12.5
            "#,
        )
        .unwrap();

        assert_eq!(config.live.voice, "Puck");
        assert_eq!(config.live.frame_samples, DEFAULT_FRAME_SAMPLES);
        assert_eq!(config.monitor.threshold, 12.5);
        assert_eq!(config.monitor.fft_size, ANALYSER_FFT_SIZE);
        assert_eq!(config.playback.release_ms, SPEAKING_RELEASE_MS);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.live.model, config.live.model);
        assert_eq!(parsed.peer.bind_address, config.peer.bind_address);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(AppConfig::from_toml("live = 3"), Err(Error::Config(_))));
    }

    #[test]
    fn test_api_key_from_config() {
        let config = LiveConfig {
            api_key: Some("abc".to_string()),
            api_key_env: "LIVE_VOICE_ENGINE_TEST_UNSET_KEY".to_string(),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key().unwrap(), "abc");

        let missing = LiveConfig {
            api_key: None,
            ..config
        };
        assert_eq!(
            missing.resolve_api_key(),
            Err(ConnectionError::MissingApiKey("LIVE_VOICE_ENGINE_TEST_UNSET_KEY".to_string()))
        );
    }
}
