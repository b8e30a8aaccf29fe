//! Conversation Transcript Log
//!
//! Appends a human-readable transcript of every session to a file: one line
//! per text output, tagged with the speaker's role and the generation stage,
//! bracketed by session start and end markers.
//!
//! File writes run on the blocking pool so a slow disk never stalls the
//! session loop that reports them.

use chrono::Local;
use s2s_core::protocol::{GenerationStage, Role};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Text outputs this short or shorter are fillers and not worth a line.
const MIN_LOGGED_CHARS: usize = 5;

/// Stop reasons that mark a fragment as the finished transcript.
const FINAL_STOP_REASONS: [&str; 3] = ["END_TURN", "STOP_SEQUENCE", "MAX_TOKENS"];

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// The stage a line is tagged with. Without an explicit stage, a completion
/// stop reason means final and anything else is still speculative.
fn effective_stage(stage: Option<GenerationStage>, stop_reason: Option<&str>) -> GenerationStage {
    match (stage, stop_reason) {
        (Some(stage), _) => stage,
        (None, Some(reason)) if FINAL_STOP_REASONS.contains(&reason) => GenerationStage::Final,
        (None, _) => GenerationStage::Speculative,
    }
}

pub struct ConversationLog {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ConversationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn log_session_start(&self, session_id: &str) -> io::Result<()> {
        self.append(format!(
            "\n{} [SESSION_START] New conversation session started ({})\n",
            timestamp(),
            session_id
        ))
        .await
    }

    pub async fn log_session_end(&self, session_id: &str) -> io::Result<()> {
        self.append(format!(
            "{} [SESSION_END] Conversation session ended ({})\n",
            timestamp(),
            session_id
        ))
        .await
    }

    /// Records one text output. Returns whether a line was written.
    pub async fn log_text(
        &self,
        role: Role,
        generation_stage: Option<GenerationStage>,
        stop_reason: Option<&str>,
        text: &str,
    ) -> io::Result<bool> {
        let text = text.trim();
        if text.chars().count() <= MIN_LOGGED_CHARS {
            return Ok(false);
        }
        let stage = effective_stage(generation_stage, stop_reason);
        self.append(format!("{} [{}] [{}]: {}\n", timestamp(), role, stage, text))
            .await?;
        Ok(true)
    }

    async fn append(&self, entry: String) -> io::Result<()> {
        let path = self.path.clone();
        let lock = self.lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(entry.as_bytes())?;
            file.flush()
        })
        .await
        .map_err(io::Error::other)?
    }
}
