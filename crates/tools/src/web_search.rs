//! Web search tool — queries the Brave Search API.

use std::time::Duration;

use async_trait::async_trait;
use nimbot_config::WebConfig;
use nimbot_core::error::ToolError;
use nimbot_core::tool::{Tool, ToolContext};
use serde::Deserialize;
use tracing::debug;

use crate::workspace::required_str;

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_COUNT: u64 = 10;

pub struct WebSearchTool {
    api_key: Option<String>,
    max_results: u64,
    endpoint: String,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(config: &WebConfig) -> Self {
        Self {
            api_key: config.search_api_key.clone().filter(|k| !k.is_empty()),
            max_results: u64::from(config.max_results).clamp(1, MAX_COUNT),
            endpoint: BRAVE_ENDPOINT.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the tool at a different search endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn failed(&self, reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Default, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: Option<String>,
}

fn format_results(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results for: {query}");
    }
    let mut out = format!("Results for: {query}\n");
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("\n{}. {}\n   {}", i + 1, hit.title, hit.url));
        if let Some(desc) = hit.description.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(&format!("\n   {desc}"));
        }
    }
    out
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs and snippets."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query",
                    "minLength": 1
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results (1-10)",
                    "minimum": 1,
                    "maximum": MAX_COUNT
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let query = required_str(&arguments, "query")?;
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(self.failed("search API key not configured (set tools.web.search_api_key or BRAVE_API_KEY)"));
        };
        let count = arguments["count"].as_u64().unwrap_or(self.max_results).clamp(1, MAX_COUNT);

        debug!(query = %query, count, "Searching the web");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("count", &count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.failed(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.failed(format!("search API returned {status}")));
        }

        let body: BraveResponse = response
            .json()
            .await
            .map_err(|e| self.failed(format!("unreadable search response: {e}")))?;
        let hits = body.web.unwrap_or_default().results;
        Ok(format_results(query, &hits))
    }
}
