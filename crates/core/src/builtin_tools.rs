//! Built-in Tool Service
//!
//! An MCP tool server exposing the default tool catalog offered to the remote
//! model: the current date and time, and a fuzzy search over a small
//! in-memory knowledge base. Each session serves its own instance over an
//! in-process pipe and reaches it through [`crate::tools::McpToolExecutor`].

use chrono::{Datelike, Local};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Results returned when the caller does not ask for a specific count.
const DEFAULT_SEARCH_LIMIT: usize = 3;
const SNIPPET_CHARS: usize = 240;

// --- Knowledge Base ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub score: i64,
}

/// A read-only document set shared by every session's tool service.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    documents: Arc<Vec<Document>>,
}

impl KnowledgeBase {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: Arc::new(documents),
        }
    }

    /// Parses a JSON array of `{"title", "body"}` objects.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(text)?))
    }

    /// A handful of documents so the search tool has something to find out of the box.
    pub fn sample() -> Self {
        let doc = |title: &str, body: &str| Document {
            title: title.to_string(),
            body: body.to_string(),
        };
        Self::new(vec![
            doc(
                "Return policy",
                "Items can be returned within 30 days of delivery for a full refund. \
Refunds are issued to the original payment method within five business days.",
            ),
            doc(
                "Shipping times",
                "Standard shipping takes three to five business days. Express shipping \
arrives the next business day when ordered before 2pm.",
            ),
            doc(
                "Support hours",
                "The support team is available Monday to Friday from 9am to 6pm, \
and on Saturdays from 10am to 2pm.",
            ),
        ])
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Scores each document against every query word and returns the best matches.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let matcher = SkimMatcherV2::default().ignore_case();
        let words: Vec<&str> = query.split_whitespace().collect();

        let mut hits: Vec<SearchHit> = self
            .documents
            .iter()
            .filter_map(|document| {
                let haystack = format!("{} {}", document.title, document.body);
                let score: i64 = words
                    .iter()
                    .filter_map(|word| matcher.fuzzy_match(&haystack, word))
                    .sum();
                (score > 0).then(|| SearchHit {
                    title: document.title.clone(),
                    snippet: snippet(&document.body),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.title.cmp(&b.title)));
        hits.truncate(limit);
        hits
    }
}

fn snippet(body: &str) -> String {
    if body.chars().count() <= SNIPPET_CHARS {
        body.to_string()
    } else {
        let mut short: String = body.chars().take(SNIPPET_CHARS).collect();
        short.push_str("...");
        short
    }
}

// --- Tool Arguments ---

#[derive(Deserialize, JsonSchema, Debug)]
pub struct SearchKnowledgeBaseArgs {
    /// What to look for, in natural language.
    #[schemars(description = "The user's question or keywords to search for")]
    pub query: String,
    /// Maximum number of documents to return.
    #[schemars(description = "Maximum number of results to return (default 3)")]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DateAndTime {
    formatted_time: String,
    date: String,
    year: i32,
    month: u32,
    day: u32,
    day_of_week: String,
    timezone: String,
}

#[derive(Serialize)]
struct SearchResults {
    query: String,
    results: Vec<SearchHit>,
}

// --- Service ---

/// MCP server providing the default tool catalog.
pub struct AssistantToolService {
    knowledge_base: KnowledgeBase,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for AssistantToolService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some("Tools available to the speech assistant.".to_string()),
            ..Default::default()
        }
    }
}

#[tool_router]
impl AssistantToolService {
    pub fn new(knowledge_base: KnowledgeBase) -> Self {
        Self {
            knowledge_base,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "getDateAndTimeTool",
        description = "Get information about the current date and time, including the day of the week and timezone."
    )]
    pub async fn get_date_and_time(&self) -> Result<String, String> {
        info!("Executing tool 'getDateAndTimeTool'");
        let now = Local::now();
        let reply = DateAndTime {
            formatted_time: now.format("%I:%M %p").to_string(),
            date: now.format("%Y-%m-%d").to_string(),
            year: now.year(),
            month: now.month(),
            day: now.day(),
            day_of_week: now.format("%A").to_string(),
            timezone: now.format("%:z").to_string(),
        };
        serde_json::to_string(&reply).map_err(|e| format!("Failed to serialize date: {}", e))
    }

    #[tool(
        name = "searchKnowledgeBase",
        description = "Search the company knowledge base for information relevant to the user's question."
    )]
    pub async fn search_knowledge_base(
        &self,
        args: Parameters<SearchKnowledgeBaseArgs>,
    ) -> Result<String, String> {
        info!(args = ?args.0, "Executing tool 'searchKnowledgeBase'");
        let query = args.0.query.trim();
        if query.is_empty() {
            return Err("The search query must not be empty.".to_string());
        }

        let limit = args.0.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).max(1);
        let reply = SearchResults {
            query: query.to_string(),
            results: self.knowledge_base.search(query, limit),
        };
        serde_json::to_string(&reply)
            .map_err(|e| format!("Failed to serialize search results: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_search_ranks_relevant_document_first() {
        let kb = KnowledgeBase::sample();
        let hits = kb.search("refund returns", 3);

        assert!(!hits.is_empty());
        assert_eq!(hits[0].title, "Return policy");
    }

    #[test]
    fn test_search_respects_limit() {
        let kb = KnowledgeBase::sample();
        assert!(kb.search("the", 1).len() <= 1);
    }

    #[test]
    fn test_search_without_match_is_empty() {
        let kb = KnowledgeBase::new(vec![Document {
            title: "Alpha".into(),
            body: "aaa".into(),
        }]);
        assert!(kb.search("zzz", 5).is_empty());
    }

    #[test]
    fn test_knowledge_base_from_json() {
        let kb = KnowledgeBase::from_json(r#"[{"title":"Hours","body":"Open daily"}]"#).unwrap();
        assert_eq!(kb.len(), 1);
        assert!(KnowledgeBase::from_json("{}").is_err());
        assert!(KnowledgeBase::default().is_empty());
    }

    #[test]
    fn test_snippet_is_truncated() {
        let long = "x".repeat(SNIPPET_CHARS * 2);
        let short = snippet(&long);
        assert_eq!(short.chars().count(), SNIPPET_CHARS + 3);
    }

    #[tokio::test]
    async fn test_date_tool_reports_weekday_and_timezone() {
        let service = AssistantToolService::new(KnowledgeBase::default());
        let text = service.get_date_and_time().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert!(value["dayOfWeek"].is_string());
        assert!(value["timezone"].as_str().unwrap().contains(':'));
        assert_eq!(value["date"].as_str().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_search_tool_rejects_blank_query() {
        let service = AssistantToolService::new(KnowledgeBase::sample());
        let result = service
            .search_knowledge_base(Parameters(SearchKnowledgeBaseArgs {
                query: "  ".into(),
                limit: None,
            }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_search_tool_returns_json_results() {
        let service = AssistantToolService::new(KnowledgeBase::sample());
        let text = service
            .search_knowledge_base(Parameters(SearchKnowledgeBaseArgs {
                query: "shipping".into(),
                limit: Some(2),
            }))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["query"], "shipping");
        assert_eq!(value["results"][0]["title"], "Shipping times");
    }
}
