//! Locating machine-readable output inside agent transcripts.

use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;

use regex::Regex;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)\r?\n?```").expect("valid regex")
});

/// Extract the outermost JSON object from text that may contain other
/// content. Braces inside string literals are ignored.
pub fn extract_json_object(text: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, ch) in text[start..].char_indices() {
            if in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(text[start..start + i + 1].to_string());
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

/// The last JSON object in the output: fenced blocks first (last one wins),
/// then the first bare object.
pub fn find_json_block(text: &str) -> Option<serde_json::Map<String, Value>> {
    let fenced = FENCED_JSON
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .filter_map(|m| serde_json::from_str::<Value>(m.as_str().trim()).ok())
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .last();
    if fenced.is_some() {
        return fenced;
    }

    let candidate = extract_json_object(text)?;
    match serde_json::from_str::<Value>(&candidate).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Subset of the Claude CLI `stream-json` events needed to recover the
/// final answer.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Agent output reduced to the text the contract parser reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    /// The agent itself reported an error result
    pub is_error: bool,
}

/// Reduce a `stream-json` transcript to its final result text. Output that
/// is not a stream passes through unchanged.
pub fn reduce_transcript(stdout: &str) -> Transcript {
    let is_stream = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<Value>(l).ok())
        .is_some_and(|v| v.get("type").is_some_and(Value::is_string));
    if !is_stream {
        return Transcript {
            text: stdout.to_string(),
            is_error: false,
        };
    }

    let mut assistant_text = String::new();
    let mut final_result: Option<String> = None;
    let mut is_error = false;

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    if let ContentBlock::Text { text } = block {
                        assistant_text.push_str(&text);
                        assistant_text.push('\n');
                    }
                }
            }
            Ok(StreamEvent::Result {
                result,
                is_error: err,
            }) => {
                final_result = result;
                is_error = err;
            }
            Ok(StreamEvent::Other) | Err(_) => {}
        }
    }

    Transcript {
        text: final_result.unwrap_or(assistant_text),
        is_error,
    }
}
