//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds everything a new
//! WebSocket session needs: the loaded configuration, the per-session defaults
//! and the shared knowledge base.

use crate::config::Config;
use crate::conversation_log::ConversationLog;
use anyhow::Context;
use s2s_core::SessionConfig;
use s2s_core::builtin_tools::KnowledgeBase;
use s2s_core::config::DEFAULT_SYSTEM_PROMPT;
use std::sync::Arc;
use tracing::info;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Starting point for every session; tools are filled in per connection.
    pub session_defaults: SessionConfig,
    pub knowledge_base: KnowledgeBase,
    pub conversation_log: Option<Arc<ConversationLog>>,
}

impl AppState {
    /// Builds the state from configuration, reading the prompt and knowledge
    /// base files it points at.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let system_prompt = match &config.system_prompt_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt from {}", path.display()))?,
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };

        let knowledge_base = match &config.knowledge_base_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| {
                    format!("Failed to read knowledge base from {}", path.display())
                })?;
                KnowledgeBase::from_json(&text).context("Knowledge base is not valid JSON")?
            }
            None => KnowledgeBase::sample(),
        };
        info!(documents = knowledge_base.len(), "Knowledge base loaded");

        let mut session_defaults = SessionConfig::default()
            .with_inference(config.inference)
            .with_tool_timeout(config.tool_timeout)
            .with_system_prompt(system_prompt.trim());
        if let Some(voice_id) = &config.voice_id {
            session_defaults = session_defaults.with_voice(voice_id.clone());
        }
        session_defaults
            .validate()
            .context("Invalid session defaults")?;

        let conversation_log = config
            .conversation_log
            .as_ref()
            .map(|path| Arc::new(ConversationLog::new(path.clone())));

        Ok(Self {
            config: Arc::new(config),
            session_defaults,
            knowledge_base,
            conversation_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2s_core::config::{DEFAULT_TOOL_TIMEOUT, InferenceConfig};
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;
    use tracing::Level;

    fn config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            upstream_url: "ws://localhost:9000".to_string(),
            log_level: Level::INFO,
            voice_id: None,
            inference: InferenceConfig::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            system_prompt_path: None,
            knowledge_base_path: None,
            conversation_log: None,
        }
    }

    #[test]
    fn test_defaults_without_files() {
        let state = AppState::from_config(config()).unwrap();

        assert_eq!(state.session_defaults.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(state.session_defaults.audio_output.voice_id, "matthew");
        assert!(!state.knowledge_base.is_empty());
        assert!(state.conversation_log.is_none());
    }

    #[test]
    fn test_files_and_overrides_are_applied() {
        let mut prompt = NamedTempFile::new().unwrap();
        writeln!(prompt, "You are a concise concierge.").unwrap();
        let mut kb = NamedTempFile::new().unwrap();
        write!(kb, r#"[{{"title":"Parking","body":"Free parking on level two."}}]"#).unwrap();

        let state = AppState::from_config(Config {
            voice_id: Some("amy".to_string()),
            system_prompt_path: Some(prompt.path().to_path_buf()),
            knowledge_base_path: Some(kb.path().to_path_buf()),
            conversation_log: Some(PathBuf::from("conversation.log")),
            ..config()
        })
        .unwrap();

        assert_eq!(
            state.session_defaults.system_prompt,
            "You are a concise concierge."
        );
        assert_eq!(state.session_defaults.audio_output.voice_id, "amy");
        assert_eq!(state.knowledge_base.len(), 1);
        assert!(state.conversation_log.is_some());
    }

    #[test]
    fn test_missing_prompt_file_fails() {
        let result = AppState::from_config(Config {
            system_prompt_path: Some(PathBuf::from("/definitely/not/here.md")),
            ..config()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_knowledge_base_fails() {
        let mut kb = NamedTempFile::new().unwrap();
        write!(kb, "not json").unwrap();

        let result = AppState::from_config(Config {
            knowledge_base_path: Some(kb.path().to_path_buf()),
            ..config()
        });
        assert!(result.is_err());
    }
}
