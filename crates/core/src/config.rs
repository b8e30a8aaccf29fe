//! Session Configuration
//!
//! Immutable value objects attached to a session or prompt when it is created.
//! Every value has a sane default and any subset can be overridden through the
//! `with_*` builders on [`SessionConfig`]. Changing configuration mid-flight
//! requires starting a new prompt or session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use crate::protocol::Role;

/// The system prompt used when the caller does not supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friend. The user and you will engage in a spoken dialog \
exchanging the transcripts of a natural real-time conversation. Keep your responses short, \
generally two or three sentences for chatty scenarios.";

/// How long a tool dispatch may run before it is reported as failed.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// A custom error type for invalid session configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid inference configuration: {0}")]
    InvalidInference(String),
    #[error("Invalid audio configuration: {0}")]
    InvalidAudio(String),
    #[error("Invalid tool configuration: {0}")]
    InvalidTool(String),
}

/// Sampling parameters sent with the session-start frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError::InvalidInference(
                "max_tokens must be positive".to_string(),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ConfigError::InvalidInference(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(ConfigError::InvalidInference(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// A bare media type declaration, e.g. `text/plain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfig {
    pub media_type: String,
}

impl MediaConfig {
    pub fn text() -> Self {
        Self {
            media_type: "text/plain".to_string(),
        }
    }

    pub fn json() -> Self {
        Self {
            media_type: "application/json".to_string(),
        }
    }
}

/// Capture format of the microphone audio streamed to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInputConfig {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub audio_type: String,
    pub encoding: String,
}

impl Default for AudioInputConfig {
    fn default() -> Self {
        Self {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz: 16000,
            sample_size_bits: 16,
            channel_count: 1,
            audio_type: "SPEECH".to_string(),
            encoding: "base64".to_string(),
        }
    }
}

/// Playback format the model should synthesize its voice in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutputConfig {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub voice_id: String,
    pub encoding: String,
    pub audio_type: String,
}

impl Default for AudioOutputConfig {
    fn default() -> Self {
        Self {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz: 24000,
            sample_size_bits: 16,
            channel_count: 1,
            voice_id: "matthew".to_string(),
            encoding: "base64".to_string(),
            audio_type: "SPEECH".to_string(),
        }
    }
}

fn validate_audio(
    label: &str,
    sample_rate_hertz: u32,
    sample_size_bits: u16,
    channel_count: u16,
) -> Result<(), ConfigError> {
    if sample_rate_hertz == 0 || sample_size_bits == 0 || channel_count == 0 {
        return Err(ConfigError::InvalidAudio(format!(
            "{label}: sample rate, sample size and channel count must be positive"
        )));
    }
    Ok(())
}

/// A tool the remote model may invoke, advertised in the prompt-start frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's input object.
    #[serde(with = "crate::protocol::frame::schema_json")]
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A pre-recorded conversational turn used to prime the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

/// Everything a session needs to know at construction time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub inference: InferenceConfig,
    pub audio_input: AudioInputConfig,
    pub audio_output: AudioOutputConfig,
    pub tools: Vec<ToolSpec>,
    pub system_prompt: String,
    pub history: Vec<HistoryTurn>,
    pub tool_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            audio_input: AudioInputConfig::default(),
            audio_output: AudioOutputConfig::default(),
            tools: Vec::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history: Vec::new(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn with_inference(mut self, inference: InferenceConfig) -> Self {
        self.inference = inference;
        self
    }

    pub fn with_audio_input(mut self, audio_input: AudioInputConfig) -> Self {
        self.audio_input = audio_input;
        self
    }

    pub fn with_audio_output(mut self, audio_output: AudioOutputConfig) -> Self {
        self.audio_output = audio_output;
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.audio_output.voice_id = voice_id.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    /// Checks every bound on the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.inference.validate()?;
        validate_audio(
            "audio input",
            self.audio_input.sample_rate_hertz,
            self.audio_input.sample_size_bits,
            self.audio_input.channel_count,
        )?;
        validate_audio(
            "audio output",
            self.audio_output.sample_rate_hertz,
            self.audio_output.sample_size_bits,
            self.audio_output.channel_count,
        )?;

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() {
                return Err(ConfigError::InvalidTool("tool name is empty".to_string()));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::InvalidTool(format!(
                    "duplicate tool name '{}'",
                    tool.name
                )));
            }
        }

        if self.tool_timeout.is_zero() {
            return Err(ConfigError::InvalidTool(
                "tool timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
