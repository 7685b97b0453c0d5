//! Web fetch tool — GET a URL and reduce the body to readable text.
//!
//! Private and loopback addresses are refused. HTML is stripped to text,
//! JSON is pretty-printed, everything else passes through; the result is
//! capped at `fetch_max_chars`.

use std::time::Duration;

use async_trait::async_trait;
use nimbot_config::WebConfig;
use nimbot_core::error::ToolError;
use nimbot_core::tool::{Tool, ToolContext};
use tracing::debug;

use crate::file_read::truncate_chars;
use crate::workspace::required_str;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("nimbot/", env!("CARGO_PKG_VERSION"));

pub struct WebFetchTool {
    max_chars: usize,
    allow_private: bool,
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new(config: &WebConfig) -> Self {
        Self {
            max_chars: config.fetch_max_chars,
            allow_private: false,
            client: reqwest::Client::new(),
        }
    }

    /// Permit loopback and private-range URLs.
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private = true;
        self
    }

    fn failed(&self, reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return its content as readable text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch",
                    "minLength": 8
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return",
                    "minimum": 100
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let url = required_str(&arguments, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "URL must start with http:// or https://".into(),
            ));
        }
        if !self.allow_private && nimbot_security::is_private_url(url) {
            return Err(ToolError::PermissionDenied {
                tool_name: self.name().into(),
                reason: format!("{url} points at a private or loopback address"),
            });
        }
        let max_chars = arguments["max_chars"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(self.max_chars)
            .min(self.max_chars);

        debug!(url = %url, "Fetching URL");

        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.failed(format!("request failed: {e}")))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = response
            .text()
            .await
            .map_err(|e| self.failed(format!("failed to read body: {e}")))?;

        let text = if content_type.contains("json") {
            serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| serde_json::to_string_pretty(&v).ok())
                .unwrap_or(body)
        } else if content_type.contains("html") || looks_like_html(&body) {
            html_to_text(&body)
        } else {
            body
        };

        Ok(format!(
            "URL: {final_url}\nStatus: {}\n\n{}",
            status.as_u16(),
            truncate_chars(text, max_chars)
        ))
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(256).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "tr", "table", "section", "article", "header", "footer",
    "h1", "h2", "h3", "h4", "h5", "h6", "pre", "blockquote", "hr", "title",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "svg", "head"];

/// Reduce an HTML document to plain text.
///
/// Drops script/style content, turns block-level tags into line breaks,
/// decodes the common entities and collapses whitespace.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut skipping: Option<&str> = None;

    while let Some(start) = rest.find('<') {
        if skipping.is_none() {
            out.push_str(&decode_entities(&rest[..start]));
        }
        let after = &rest[start + 1..];
        let Some(end) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = &after[..end];
        rest = &after[end + 1..];

        if tag.starts_with('!') {
            continue;
        }
        let closing = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        if let Some(skipped) = skipping {
            if closing && name == skipped {
                skipping = None;
            }
            continue;
        }
        if !closing && !tag.ends_with('/') {
            if let Some(skipped) = SKIPPED_TAGS.iter().find(|t| **t == name) {
                skipping = Some(skipped);
                continue;
            }
        }
        if BLOCK_TAGS.contains(&name.as_str()) {
            out.push('\n');
        } else if name == "td" || name == "th" {
            out.push(' ');
        }
    }
    if skipping.is_none() {
        out.push_str(&decode_entities(rest));
    }

    collapse_whitespace(&out)
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    let mut lines = Vec::new();
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !lines.is_empty() {
                lines.push(line);
            }
        } else {
            blank_run = 0;
            lines.push(line);
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
