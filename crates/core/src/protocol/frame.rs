//! Typed descriptors for every frame exchanged with the remote model service.
//!
//! [`ClientFrame`] is the closed set of frames the client sends; [`ServerEvent`]
//! is the closed set of events the service sends back. Both serialize to the
//! externally tagged `{"<kind>": {...}}` shape that sits inside the
//! `{"event": ...}` envelope (see [`super::codec`]).

use crate::config::{AudioInputConfig, AudioOutputConfig, InferenceConfig, MediaConfig, ToolSpec};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Who a piece of content is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "SYSTEM"),
            Role::User => write!(f, "USER"),
            Role::Assistant => write!(f, "ASSISTANT"),
            Role::Tool => write!(f, "TOOL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentKind {
    Text,
    Audio,
    Tool,
}

/// Whether a text output is a speculative preview or the final transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GenerationStage {
    Speculative,
    Final,
}

impl fmt::Display for GenerationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationStage::Speculative => write!(f, "SPECULATIVE"),
            GenerationStage::Final => write!(f, "FINAL"),
        }
    }
}

// --- Client Frames ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub inference_configuration: InferenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub tool_spec: ToolSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfiguration {
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
}

impl ToolConfiguration {
    pub fn from_specs(specs: &[ToolSpec]) -> Self {
        Self {
            tools: specs
                .iter()
                .cloned()
                .map(|tool_spec| ToolEntry { tool_spec })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptStart {
    pub prompt_name: String,
    pub text_output_configuration: MediaConfig,
    pub audio_output_configuration: AudioOutputConfig,
    pub tool_use_output_configuration: MediaConfig,
    #[serde(default)]
    pub tool_configuration: ToolConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultInputConfig {
    pub tool_use_id: String,
    #[serde(rename = "type")]
    pub result_type: ContentKind,
    pub text_input_configuration: MediaConfig,
}

/// Kind-specific configuration of a content stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ContentConfig {
    Text {
        #[serde(rename = "textInputConfiguration")]
        text_input: MediaConfig,
    },
    Audio {
        #[serde(rename = "audioInputConfiguration")]
        audio_input: AudioInputConfig,
    },
    Tool {
        #[serde(rename = "toolResultInputConfiguration")]
        tool_result: ToolResultInputConfig,
    },
}

impl ContentConfig {
    pub fn kind(&self) -> ContentKind {
        match self {
            ContentConfig::Text { .. } => ContentKind::Text,
            ContentConfig::Audio { .. } => ContentKind::Audio,
            ContentConfig::Tool { .. } => ContentKind::Tool,
        }
    }

    /// The tool-use id a tool result stream reports on.
    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            ContentConfig::Tool { tool_result } => Some(&tool_result.tool_use_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStart {
    pub prompt_name: String,
    pub content_name: String,
    pub interactive: bool,
    pub role: Role,
    #[serde(flatten)]
    pub config: ContentConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
    pub prompt_name: String,
    pub content_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPayload {
    pub prompt_name: String,
    pub content_name: String,
    #[serde(with = "base64_bytes")]
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub prompt_name: String,
    pub content_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRef {
    pub prompt_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnd {}

/// Frames sent from the client to the remote model service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientFrame {
    SessionStart(SessionStart),
    PromptStart(PromptStart),
    ContentStart(ContentStart),
    TextInput(ContentPayload),
    AudioInput(AudioPayload),
    ToolResult(ContentPayload),
    ContentEnd(ContentRef),
    PromptEnd(PromptRef),
    SessionEnd(SessionEnd),
}

impl ClientFrame {
    pub fn session_start(inference: InferenceConfig) -> Self {
        ClientFrame::SessionStart(SessionStart {
            inference_configuration: inference,
        })
    }

    pub fn prompt_start(
        prompt_name: impl Into<String>,
        audio_output: AudioOutputConfig,
        tools: &[ToolSpec],
    ) -> Self {
        ClientFrame::PromptStart(PromptStart {
            prompt_name: prompt_name.into(),
            text_output_configuration: MediaConfig::text(),
            audio_output_configuration: audio_output,
            tool_use_output_configuration: MediaConfig::json(),
            tool_configuration: ToolConfiguration::from_specs(tools),
        })
    }

    pub fn text_content_start(
        prompt_name: impl Into<String>,
        content_name: impl Into<String>,
        role: Role,
        interactive: bool,
    ) -> Self {
        ClientFrame::ContentStart(ContentStart {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
            interactive,
            role,
            config: ContentConfig::Text {
                text_input: MediaConfig::text(),
            },
        })
    }

    pub fn audio_content_start(
        prompt_name: impl Into<String>,
        content_name: impl Into<String>,
        audio_input: AudioInputConfig,
    ) -> Self {
        ClientFrame::ContentStart(ContentStart {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
            interactive: true,
            role: Role::User,
            config: ContentConfig::Audio { audio_input },
        })
    }

    pub fn tool_content_start(
        prompt_name: impl Into<String>,
        content_name: impl Into<String>,
        tool_use_id: impl Into<String>,
    ) -> Self {
        ClientFrame::ContentStart(ContentStart {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
            interactive: false,
            role: Role::Tool,
            config: ContentConfig::Tool {
                tool_result: ToolResultInputConfig {
                    tool_use_id: tool_use_id.into(),
                    result_type: ContentKind::Text,
                    text_input_configuration: MediaConfig::text(),
                },
            },
        })
    }

    pub fn text_input(
        prompt_name: impl Into<String>,
        content_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        ClientFrame::TextInput(ContentPayload {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
            content: text.into(),
        })
    }

    pub fn audio_input(
        prompt_name: impl Into<String>,
        content_name: impl Into<String>,
        chunk: Bytes,
    ) -> Self {
        ClientFrame::AudioInput(AudioPayload {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
            content: chunk,
        })
    }

    pub fn tool_result(
        prompt_name: impl Into<String>,
        content_name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        ClientFrame::ToolResult(ContentPayload {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
            content: result.into(),
        })
    }

    pub fn content_end(prompt_name: impl Into<String>, content_name: impl Into<String>) -> Self {
        ClientFrame::ContentEnd(ContentRef {
            prompt_name: prompt_name.into(),
            content_name: content_name.into(),
        })
    }

    pub fn prompt_end(prompt_name: impl Into<String>) -> Self {
        ClientFrame::PromptEnd(PromptRef {
            prompt_name: prompt_name.into(),
        })
    }

    pub fn session_end() -> Self {
        ClientFrame::SessionEnd(SessionEnd {})
    }

    /// The wire name of this frame, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::SessionStart(_) => "sessionStart",
            ClientFrame::PromptStart(_) => "promptStart",
            ClientFrame::ContentStart(_) => "contentStart",
            ClientFrame::TextInput(_) => "textInput",
            ClientFrame::AudioInput(_) => "audioInput",
            ClientFrame::ToolResult(_) => "toolResult",
            ClientFrame::ContentEnd(_) => "contentEnd",
            ClientFrame::PromptEnd(_) => "promptEnd",
            ClientFrame::SessionEnd(_) => "sessionEnd",
        }
    }

    pub fn prompt_name(&self) -> Option<&str> {
        match self {
            ClientFrame::SessionStart(_) | ClientFrame::SessionEnd(_) => None,
            ClientFrame::PromptStart(f) => Some(&f.prompt_name),
            ClientFrame::ContentStart(f) => Some(&f.prompt_name),
            ClientFrame::TextInput(f) | ClientFrame::ToolResult(f) => Some(&f.prompt_name),
            ClientFrame::AudioInput(f) => Some(&f.prompt_name),
            ClientFrame::ContentEnd(f) => Some(&f.prompt_name),
            ClientFrame::PromptEnd(f) => Some(&f.prompt_name),
        }
    }

    pub fn content_name(&self) -> Option<&str> {
        match self {
            ClientFrame::ContentStart(f) => Some(&f.content_name),
            ClientFrame::TextInput(f) | ClientFrame::ToolResult(f) => Some(&f.content_name),
            ClientFrame::AudioInput(f) => Some(&f.content_name),
            ClientFrame::ContentEnd(f) => Some(&f.content_name),
            _ => None,
        }
    }
}

// --- Server Events ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionStart {
    pub prompt_name: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub completion_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputContentStart {
    pub prompt_name: String,
    pub content_id: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_model_fields: Option<String>,
}

impl OutputContentStart {
    /// Extracts the generation stage from the embedded model fields, if any.
    pub fn generation_stage(&self) -> Option<GenerationStage> {
        let fields: Value = serde_json::from_str(self.additional_model_fields.as_deref()?).ok()?;
        serde_json::from_value(fields.get("generationStage")?.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOutput {
    pub prompt_name: String,
    pub content_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutput {
    pub prompt_name: String,
    pub content_id: String,
    #[serde(with = "base64_bytes")]
    pub content: Bytes,
}

/// A request from the remote model to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub prompt_name: String,
    pub content_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    #[serde(with = "embedded_json")]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputContentEnd {
    pub prompt_name: String,
    pub content_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ContentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl OutputContentEnd {
    /// True when the model stopped because the user barged in.
    pub fn is_interrupted(&self) -> bool {
        self.stop_reason.as_deref() == Some("INTERRUPTED")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEnd {
    pub prompt_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Events sent from the remote model service to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerEvent {
    CompletionStart(CompletionStart),
    ContentStart(OutputContentStart),
    TextOutput(TextOutput),
    AudioOutput(AudioOutput),
    ToolUse(ToolUse),
    ContentEnd(OutputContentEnd),
    CompletionEnd(CompletionEnd),
    UsageEvent(Value),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::CompletionStart(_) => "completionStart",
            ServerEvent::ContentStart(_) => "contentStart",
            ServerEvent::TextOutput(_) => "textOutput",
            ServerEvent::AudioOutput(_) => "audioOutput",
            ServerEvent::ToolUse(_) => "toolUse",
            ServerEvent::ContentEnd(_) => "contentEnd",
            ServerEvent::CompletionEnd(_) => "completionEnd",
            ServerEvent::UsageEvent(_) => "usageEvent",
        }
    }
}

/// Serializes raw bytes as a base64 string.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

/// Carries a JSON value as a string holding its serialization.
pub(crate) mod embedded_json {
    use serde::{Deserialize, Deserializer, Serializer, de::Error, ser};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(value).map_err(ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

/// Tool input schemas travel as `{"json": "<schema as string>"}`.
pub(crate) mod schema_json {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error, ser};
    use serde_json::Value;

    #[derive(Serialize, Deserialize)]
    struct Wrapped {
        json: String,
    }

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        let json = serde_json::to_string(value).map_err(ser::Error::custom)?;
        Wrapped { json }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let wrapped = Wrapped::deserialize(deserializer)?;
        serde_json::from_str(&wrapped.json).map_err(D::Error::custom)
    }
}
