//! Engine configuration loaded from TOML and environment.
//!
//! Precedence: env `COURTCRAFT_CONFIG` path > `config/courtcraft.toml` > defaults, then
//! `COURTCRAFT__SECTION__KEY` environment overrides (e.g. `COURTCRAFT__SPEECH__MAX_RESTART_ATTEMPTS=5`).

use crate::error::LiveResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_restart_delay_ms() -> u64 {
    150
}

fn default_max_restart_attempts() -> u32 {
    10
}

fn default_voice_id() -> String {
    "onyx".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    20
}

fn default_counterpart_name() -> String {
    "Opposing Counsel".to_string()
}

fn default_llm_api_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

/// Speech capture tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Pause before restarting recognition after a cycle ends (default 150ms).
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Automatic restarts allowed without a recognized result before the session is declared dead.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
}

impl SpeechConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_attempts: default_max_restart_attempts(),
        }
    }
}

/// Voice synthesis settings shared by both tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Voice used by the remote synthesizer (alloy, echo, fable, onyx, nova, shimmer, ...).
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    /// Playback rate multiplier.
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Pitch multiplier (on-device synthesizers only).
    #[serde(default = "default_speed")]
    pub pitch: f32,
    /// When false, skip Tier 1 and go straight to the on-device synthesizer.
    #[serde(default = "default_true")]
    pub remote_enabled: bool,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice_id: default_voice_id(),
            speed: default_speed(),
            pitch: default_speed(),
            remote_enabled: true,
        }
    }
}

/// Session-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Records kept per case; older ones are evicted.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Name the counterpart is addressed by in prompts.
    #[serde(default = "default_counterpart_name")]
    pub counterpart_name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            counterpart_name: default_counterpart_name(),
        }
    }
}

/// Streaming completion endpoint settings. The API key is read from the environment, never from file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_api_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_api_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl LiveConfig {
    /// Load config from file and environment.
    pub fn load() -> LiveResult<Self> {
        let config_path =
            std::env::var("COURTCRAFT_CONFIG").unwrap_or_else(|_| "config/courtcraft.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from an explicit file path (skipped when missing), then apply environment overrides.
    pub fn load_from(path: &Path) -> LiveResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("COURTCRAFT").separator("__"))
            .build()?;

        Ok(built.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_engine_constants() {
        let cfg = LiveConfig::default();
        assert_eq!(cfg.speech.restart_delay(), Duration::from_millis(150));
        assert_eq!(cfg.speech.max_restart_attempts, 10);
        assert_eq!(cfg.session.history_limit, 20);
        assert!(cfg.synthesis.remote_enabled);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courtcraft.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[speech]\nmax_restart_attempts = 3\n\n[synthesis]\nvoice_id = \"nova\"").unwrap();

        let cfg = LiveConfig::load_from(&path).unwrap();
        assert_eq!(cfg.speech.max_restart_attempts, 3);
        assert_eq!(cfg.speech.restart_delay_ms, 150);
        assert_eq!(cfg.synthesis.voice_id, "nova");
        assert_eq!(cfg.session.history_limit, 20);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = LiveConfig::load_from(Path::new("/nonexistent/courtcraft.toml")).unwrap();
        assert_eq!(cfg.llm.model, "anthropic/claude-3.5-sonnet");
    }
}
