//! Newline-delimited JSON event grammar emitted by the child agent on
//! stdout (`--output-format stream-json`).

use serde::Deserialize;
use serde_json::Value;

/// Events from the child's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ContentDelta },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<ToolUseResult>,
    },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<TokenUsage>,
        #[serde(default)]
        total_usage: Option<TokenUsage>,
    },

    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        usage: Option<TokenUsage>,
    },

    #[serde(rename = "system")]
    System { subtype: String },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct ContentDelta {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
pub struct ToolUseResult {
    #[serde(default)]
    pub file: Option<FileInfo>,
}

#[derive(Debug, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "filePath")]
    pub file_path: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// A semantic emission produced while draining one line of stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Text(String),
    FinalResult(String),
    ToolUse(String),
    SessionId(String),
    Tokens { input: u64, output: u64 },
}

/// Parse one stdout line into zero or more emissions. Malformed JSON (or a
/// non-JSON line) is passed through as raw text, per the passthrough rule.
pub fn process_line(line: &str) -> Vec<Emission> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(event) = serde_json::from_str::<StreamEvent>(trimmed) else {
        return vec![Emission::Text(line.to_string())];
    };

    match event {
        StreamEvent::Assistant { message, session_id } => {
            let mut out = Vec::new();
            if !session_id.is_empty() {
                out.push(Emission::SessionId(session_id));
            }
            for block in message.content {
                match block {
                    ContentBlock::Text { text } => out.push(Emission::Text(text)),
                    ContentBlock::ToolUse { name, input, .. } => {
                        out.push(Emission::ToolUse(describe_tool_use(&name, &input)))
                    }
                }
            }
            out
        }
        StreamEvent::ContentBlockDelta { delta } => delta
            .text
            .map(Emission::Text)
            .into_iter()
            .collect(),
        StreamEvent::Result {
            session_id,
            result,
            usage,
            total_usage,
            ..
        } => {
            let mut out = Vec::new();
            if let Some(id) = session_id {
                out.push(Emission::SessionId(id));
            }
            if let Some(text) = result {
                out.push(Emission::FinalResult(text));
            }
            if let Some(u) = total_usage.or(usage) {
                out.push(Emission::Tokens {
                    input: u.input_tokens,
                    output: u.output_tokens,
                });
            }
            out
        }
        StreamEvent::Message { usage } => usage
            .map(|u| Emission::Tokens {
                input: u.input_tokens,
                output: u.output_tokens,
            })
            .into_iter()
            .collect(),
        StreamEvent::User { .. } | StreamEvent::System { .. } => Vec::new(),
    }
}

/// Extract a human-readable description from a tool use event.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    match name {
        "Bash" | "bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 60))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {cmd}")
        }
        "Edit" | "Write" | "Read" => {
            let path = input
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or("file");
            format!("{name}: {path}")
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("Searching: {pattern}")
        }
        "Grep" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
            let path = input.get("path").and_then(|v| v.as_str()).unwrap_or("");
            format!("Grep: {pattern} {path}")
        }
        _ => truncate_str(&input.to_string(), 80),
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
