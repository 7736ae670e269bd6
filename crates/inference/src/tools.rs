//! Function calling: tool definitions, streamed call reassembly and the
//! built-in tool executor
//!
//! Tool calls arrive as fragments keyed by a per-call index; names and
//! argument strings can be split across any number of deltas and
//! interleaved between calls. [`ToolCallAccumulator`] concatenates them in
//! arrival order per index. Arguments are not validated here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::types::{ToolCall, ToolResult};

/// OpenAI-style tool definition passed to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

pub const WEB_SEARCH: &str = "web_search";
pub const GET_CURRENT_DATE: &str = "get_current_date";

const DEFAULT_MAX_RESULTS: usize = 8;
const MAX_RESULTS_CAP: usize = 10;

pub fn web_search_tool() -> ToolDefinition {
    ToolDefinition::function(
        WEB_SEARCH,
        "Search the internet for current information, news, facts, or any real-time data. \
         Use this when you need up-to-date information that you don't have in your training data. \
         Returns a list of search results with titles, URLs, and content snippets.",
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query. Be specific and use keywords that will return relevant results."
                },
                "max_results": {
                    "type": "number",
                    "description": "Maximum number of search results to return (1-10). Default is 8.",
                    "default": DEFAULT_MAX_RESULTS
                }
            },
            "required": ["query"]
        }),
    )
}

pub fn current_date_tool() -> ToolDefinition {
    ToolDefinition::function(
        GET_CURRENT_DATE,
        "Get the current date and time. Use this when the user asks about today's date, \
         current time, or anything related to \"now\".",
        json!({ "type": "object", "properties": {}, "required": [] }),
    )
}

/// Every built-in tool
pub fn available_tools() -> Vec<ToolDefinition> {
    vec![web_search_tool(), current_date_tool()]
}

/// Model name fragments known to handle function calling
const TOOL_CAPABLE_PATTERNS: &[&str] = &[
    "llama-3.2",
    "llama-3.1",
    "llama3.2",
    "llama3.1",
    "llama3-groq",
    "hermes-2-pro",
    "hermes-3",
    "nous-hermes",
    "mixtral",
    "mistral-nemo",
    "mistral-small",
    "command-r",
    "qwen",
    "gemma-2",
    "gemma2",
    "gemma3",
    "firefunction",
    "nexusraven",
    "functionary",
    "granite-functioncalling",
    "deepseek-r1",
];

/// Whether a model may be sent the `tools` parameter at all
pub fn supports_function_calling(model_id: &str) -> bool {
    let lower = model_id.to_lowercase();
    TOOL_CAPABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

// ─── Streamed call reassembly ───────────────────────────────────────

/// One streamed tool-call fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    /// Fragment of the JSON argument string
    pub arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles tool calls from streamed fragments
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = delta.name.as_deref() {
            call.name.push_str(name);
        }
        if let Some(args) = delta.arguments.as_deref() {
            call.arguments.push_str(args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Complete calls ordered by index. Calls without an id get one.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall {
                id: if call.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    call.id
                },
                name: call.name,
                arguments: if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                },
            })
            .collect()
    }
}

// ─── Execution ──────────────────────────────────────────────────────

/// Executes tool calls. Never fails: errors are encoded in the payload as
/// `{"error": ...}` so the model can see them.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}

/// A single search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    pub published_date: Option<String>,
}

/// Pluggable web search provider
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

#[derive(Debug, Deserialize)]
struct WebSearchArgs {
    query: String,
    max_results: Option<f64>,
}

/// Executor for the built-in tools
#[derive(Default, Clone)]
pub struct BuiltinToolExecutor {
    search: Option<Arc<dyn WebSearch>>,
}

impl BuiltinToolExecutor {
    pub fn new(search: Option<Arc<dyn WebSearch>>) -> Self {
        Self { search }
    }

    async fn web_search(&self, args: serde_json::Value) -> serde_json::Value {
        let args: WebSearchArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return json!({ "error": format!("Invalid arguments: {}", e), "results": [] }),
        };
        let max_results = args
            .max_results
            .filter(|n| *n >= 1.0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .min(MAX_RESULTS_CAP);

        let Some(search) = &self.search else {
            return json!({ "error": "Search failed: no search provider configured", "results": [] });
        };

        match search.search(&args.query, max_results).await {
            Ok(results) => {
                let formatted: Vec<serde_json::Value> = results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        json!({
                            "index": i + 1,
                            "title": r.title,
                            "url": r.url,
                            "snippet": r.content,
                            "published": r.published_date.as_deref().unwrap_or("N/A"),
                        })
                    })
                    .collect();
                json!({
                    "query": args.query,
                    "results_count": formatted.len(),
                    "results": formatted,
                })
            }
            Err(e) => json!({ "error": format!("Search failed: {}", e), "results": [] }),
        }
    }

    fn current_date() -> serde_json::Value {
        let local = Local::now();
        let utc = Utc::now();
        json!({
            "date": local.format("%A, %B %-d, %Y").to_string(),
            "time": local.format("%-I:%M:%S %p").to_string(),
            "iso": utc.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "timestamp": utc.timestamp_millis(),
        })
    }
}

#[async_trait]
impl ToolExecutor for BuiltinToolExecutor {
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        log::info!("Executing tool {} ({})", call.name, call.id);

        let payload = match serde_json::from_str::<serde_json::Value>(&call.arguments) {
            Err(e) => {
                log::warn!("Tool {} got malformed arguments: {}", call.name, e);
                json!({ "error": e.to_string() })
            }
            Ok(args) => match call.name.as_str() {
                WEB_SEARCH => self.web_search(args).await,
                GET_CURRENT_DATE => Self::current_date(),
                other => json!({ "error": format!("Unknown tool: {}", other) }),
            },
        };

        ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: payload.to_string(),
        }
    }
}
