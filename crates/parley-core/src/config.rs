//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{AudioFormat, SampleEncoding};

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad: Option<VadConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmenter: Option<SegmenterConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Inbound audio stream format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub format: SampleEncoding,
}

fn default_sample_rate() -> u32 {
    16_000
}

/// Energy measure used by the speech-activity classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadMetric {
    #[default]
    MeanAbs,
    Rms,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VadConfig {
    /// Energy threshold above which a frame counts as speech.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub metric: VadMetric,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Utterances must be strictly longer than this to be flushed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_utterance_ms: Option<u64>,
    /// Consecutive silence frames required before a flush.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_hysteresis_frames: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Barge-in fires once the consecutive speech run exceeds this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barge_in_frames: Option<u32>,
    /// Transcripts shorter than this (after trimming) abort the turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_transcript_chars: Option<usize>,
    /// Unflushed phrase length that forces a flush to synthesis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phrase_max_chars: Option<usize>,
}

/// Speech-to-text provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            model: None,
            language: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-generation provider settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Messages of conversation history kept per session (0 disables memory).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_messages: Option<usize>,
}

impl GenerationConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    /// Local endpoints (Ollama) need no key.
    pub fn is_local(&self) -> bool {
        self.base_url
            .as_deref()
            .is_none_or(|u| u.contains("localhost") || u.contains("127.0.0.1"))
    }
}

/// Speech-synthesis provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Size of each emitted audio chunk in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_bytes: Option<usize>,
}

fn default_synthesis_provider() -> String {
    "elevenlabs".into()
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            voice: None,
            model: None,
            chunk_bytes: None,
        }
    }
}

impl SynthesisConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolved per-session tunables, copied into each session at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub format: AudioFormat,
    pub vad_threshold: f32,
    pub min_utterance_bytes: usize,
    pub silence_hysteresis_frames: u32,
    pub barge_in_frames: u32,
    pub min_transcript_chars: usize,
    pub phrase_max_chars: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Config::default().session_settings()
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            tracing::warn!(var = &caps[1], "Config references unset environment variable");
            String::new()
        })
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| crate::error::ParleyError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn audio_format(&self) -> AudioFormat {
        self.audio
            .as_ref()
            .map(|a| AudioFormat {
                sample_rate: a.sample_rate,
                encoding: a.format,
            })
            .unwrap_or_default()
    }

    pub fn vad_threshold(&self) -> f32 {
        self.vad
            .as_ref()
            .and_then(|v| v.threshold)
            .unwrap_or(0.005)
    }

    pub fn vad_metric(&self) -> VadMetric {
        self.vad.as_ref().map(|v| v.metric).unwrap_or_default()
    }

    pub fn min_utterance_ms(&self) -> u64 {
        self.segmenter
            .as_ref()
            .and_then(|s| s.min_utterance_ms)
            .unwrap_or(500)
    }

    pub fn silence_hysteresis_frames(&self) -> u32 {
        self.segmenter
            .as_ref()
            .and_then(|s| s.silence_hysteresis_frames)
            .unwrap_or(3)
    }

    pub fn barge_in_frames(&self) -> u32 {
        self.turn
            .as_ref()
            .and_then(|t| t.barge_in_frames)
            .unwrap_or(5)
    }

    pub fn min_transcript_chars(&self) -> usize {
        self.turn
            .as_ref()
            .and_then(|t| t.min_transcript_chars)
            .unwrap_or(2)
    }

    pub fn phrase_max_chars(&self) -> usize {
        self.turn
            .as_ref()
            .and_then(|t| t.phrase_max_chars)
            .unwrap_or(50)
    }

    /// Size of emitted synthesis chunks: 20ms of 16kHz s16 by default.
    pub fn synthesis_chunk_bytes(&self) -> usize {
        self.synthesis
            .as_ref()
            .and_then(|s| s.chunk_bytes)
            .unwrap_or(640)
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(8000)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Resolve all turn-taking tunables.
    pub fn session_settings(&self) -> SessionSettings {
        let format = self.audio_format();
        SessionSettings {
            format,
            vad_threshold: self.vad_threshold(),
            min_utterance_bytes: format.bytes_for_ms(self.min_utterance_ms()),
            silence_hysteresis_frames: self.silence_hysteresis_frames(),
            barge_in_frames: self.barge_in_frames(),
            min_transcript_chars: self.min_transcript_chars(),
            phrase_max_chars: self.phrase_max_chars(),
        }
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let transcription = self.transcription.clone().unwrap_or_default();
        if transcription.provider != "local" && transcription.resolve_api_key().is_none() {
            warnings.push(format!(
                "Transcription provider '{}' has no API key configured",
                transcription.provider
            ));
        }

        let generation = self.generation.clone().unwrap_or_default();
        if !generation.is_local() && generation.resolve_api_key().is_none() {
            warnings.push("Generation endpoint is remote but has no API key configured".to_string());
        }

        let synthesis = self.synthesis.clone().unwrap_or_default();
        if synthesis.resolve_api_key().is_none() {
            warnings.push(format!(
                "Synthesis provider '{}' has no API key configured",
                synthesis.provider
            ));
        }

        if self.audio_format().sample_rate == 0 {
            errors.push("Audio sample_rate cannot be 0".to_string());
        }
        if self.vad_threshold() <= 0.0 {
            errors.push("VAD threshold must be positive".to_string());
        }
        if self.phrase_max_chars() == 0 {
            errors.push("Turn phrase_max_chars cannot be 0".to_string());
        }
        if self.synthesis_chunk_bytes() == 0 {
            errors.push("Synthesis chunk_bytes cannot be 0".to_string());
        }
        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Every section filled in with its default, for `parley config init`.
    pub fn template() -> Self {
        let defaults = Config::default();
        let format = defaults.audio_format();
        Self {
            audio: Some(AudioConfig {
                sample_rate: format.sample_rate,
                format: format.encoding,
            }),
            vad: Some(VadConfig {
                threshold: Some(defaults.vad_threshold()),
                metric: defaults.vad_metric(),
            }),
            segmenter: Some(SegmenterConfig {
                min_utterance_ms: Some(defaults.min_utterance_ms()),
                silence_hysteresis_frames: Some(defaults.silence_hysteresis_frames()),
            }),
            turn: Some(TurnConfig {
                barge_in_frames: Some(defaults.barge_in_frames()),
                min_transcript_chars: Some(defaults.min_transcript_chars()),
                phrase_max_chars: Some(defaults.phrase_max_chars()),
            }),
            transcription: Some(TranscriptionConfig {
                api_key_env: Some("GROQ_API_KEY".into()),
                language: Some("en".into()),
                ..TranscriptionConfig::default()
            }),
            generation: Some(GenerationConfig {
                base_url: Some("http://localhost:11434".into()),
                model: Some("llama3.2:1b".into()),
                temperature: Some(0.7),
                history_messages: Some(20),
                ..GenerationConfig::default()
            }),
            synthesis: Some(SynthesisConfig {
                api_key_env: Some("ELEVENLABS_API_KEY".into()),
                chunk_bytes: Some(defaults.synthesis_chunk_bytes()),
                ..SynthesisConfig::default()
            }),
            gateway: Some(GatewayConfig {
                port: defaults.gateway_port(),
                bind: Some(defaults.gateway_bind()),
            }),
            logging: Some(LoggingConfig {
                format: default_log_format(),
                level: Some("info".into()),
                filters: Vec::new(),
                output: default_log_output(),
            }),
        }
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_PARLEY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_PARLEY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PARLEY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PARLEY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 8000);
        assert_eq!(config.barge_in_frames(), 5);
        assert_eq!(config.phrase_max_chars(), 50);

        let settings = config.session_settings();
        // 0.5s of 16kHz f32 mono
        assert_eq!(settings.min_utterance_bytes, 32_000);
        assert!((settings.vad_threshold - 0.005).abs() < f32::EPSILON);
        assert_eq!(settings.min_transcript_chars, 2);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/parley/config.json")).unwrap();
        assert!(config.turn.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // trailing commas and comments are fine
                audio: { sample_rate: 24000, format: "s16le" },
                turn: { barge_in_frames: 8, phrase_max_chars: 120 },
                segmenter: { min_utterance_ms: 250 },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let settings = config.session_settings();
        assert_eq!(settings.format.sample_rate, 24_000);
        assert_eq!(settings.format.encoding, SampleEncoding::S16le);
        assert_eq!(settings.barge_in_frames, 8);
        assert_eq!(settings.phrase_max_chars, 120);
        // 250ms at 24kHz, 2 bytes per sample
        assert_eq!(settings.min_utterance_bytes, 12_000);
    }

    #[test]
    fn test_template_saves_every_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::template().save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for section in ["audio", "vad", "segmenter", "turn", "transcription", "generation", "synthesis", "gateway", "logging"] {
            assert!(raw.get(section).is_some(), "missing section {section}");
        }

        // Loading it back changes nothing about how sessions behave
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.session_settings(), Config::default().session_settings());
        assert_eq!(loaded.gateway_port(), 8000);
        let (_, errors) = loaded.validate();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not valid").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::ParleyError::Config(_)));
    }

    #[test]
    fn test_synthesis_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_PARLEY_TTS_KEY", "from-env") };
        let synthesis = SynthesisConfig {
            api_key_env: Some("TEST_PARLEY_TTS_KEY".into()),
            ..SynthesisConfig::default()
        };
        assert_eq!(synthesis.resolve_api_key(), Some("from-env".into()));

        let direct = SynthesisConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_PARLEY_TTS_KEY".into()),
            ..SynthesisConfig::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_PARLEY_TTS_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_missing_keys_warn() {
        let (warnings, errors) = Config::default().validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(
            warnings.iter().any(|w| w.contains("elevenlabs")),
            "Expected a warning about the synthesis key, got: {warnings:?}"
        );
        // Ollama on localhost needs no key
        assert!(!warnings.iter().any(|w| w.contains("Generation")));
    }

    #[test]
    fn test_validate_bad_values_error() {
        let config = Config {
            vad: Some(VadConfig {
                threshold: Some(0.0),
                metric: VadMetric::Rms,
            }),
            gateway: Some(GatewayConfig { port: 0, bind: None }),
            turn: Some(TurnConfig {
                phrase_max_chars: Some(0),
                ..TurnConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert_eq!(errors.len(), 3, "got: {errors:?}");
        assert!(errors.iter().any(|e| e.contains("port")));
    }
}
