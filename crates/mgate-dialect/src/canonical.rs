//! The dialect-neutral model every codec translates through.
//!
//! Requests become a [`ChatRequest`], buffered responses a
//! [`CanonicalResponse`], and stream traffic a sequence of [`StreamDelta`]s.
//! One [`Aggregator`] folds deltas back into a canonical response, so the
//! log/metering path never depends on which dialect produced the stream.

use mgate_common::Usage;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub stream: bool,
    pub messages: Vec<InboundMessage>,
    pub system: Option<String>,
    pub max_output_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub tools: Option<Value>,
    pub tool_choice: Option<Value>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub role: String,
    pub parts: Vec<MessagePart>,
}

impl InboundMessage {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: vec![MessagePart::Text(text.into())],
        }
    }

    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                MessagePart::Text(text) => out.push_str(text),
                MessagePart::Reasoning(text) => out.push_str(text),
                MessagePart::ToolCall { arguments, .. } => out.push_str(arguments),
                MessagePart::ToolResult { content, .. } => out.push_str(content),
                MessagePart::Image { .. } => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub enum MessagePart {
    Text(String),
    Reasoning(String),
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        name: Option<String>,
        content: String,
    },
    Image {
        url: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalResponse {
    pub role: String,
    pub segments: Vec<Segment>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl CanonicalResponse {
    /// All text segments concatenated, in order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            if let Segment::Text(text) = segment {
                out.push_str(text);
            }
        }
        out
    }

    pub fn reasoning(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            if let Segment::Reasoning(text) = segment {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Text the reconciler tokenises for the completion side: output text
    /// plus tool-call argument payloads plus reasoning text.
    pub fn countable_output(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) | Segment::Reasoning(text) => out.push_str(text),
                Segment::ToolCall { arguments, .. } => out.push_str(arguments),
                Segment::ToolResult { content, .. } => out.push_str(content),
                Segment::OpaqueJson { payload, .. } => {
                    if let Ok(json) = serde_json::to_string(payload) {
                        out.push_str(&json);
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Reasoning(String),
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        name: Option<String>,
        content: String,
    },
    OpaqueJson {
        label: String,
        payload: Value,
    },
}

/// One parsed unit of upstream stream traffic, already dialect-neutral.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Role(String),
    Content(String),
    Reasoning(String),
    ToolCall {
        index: i64,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: Option<String>,
    },
    FinishReason(String),
    UsageFinal(Usage),
    Done,
    Ignore,
}

#[derive(Debug, Clone, Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Folds a delta sequence into a [`CanonicalResponse`].
///
/// Text and reasoning concatenate in arrival order; tool calls merge by
/// `index` (id and name replace, argument fragments concatenate). When a
/// later source supplies a complete argument string for a call that already
/// accumulated fragments, the longer string wins: truncation never lengthens
/// JSON, so the longer of the two is the complete one.
#[derive(Debug, Default)]
pub struct Aggregator {
    role: Option<String>,
    text: String,
    reasoning: String,
    tool_calls: std::collections::BTreeMap<i64, ToolCallState>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Role(role) => {
                self.role = Some(role.clone());
            }
            StreamDelta::Content(text) => self.text.push_str(text),
            StreamDelta::Reasoning(text) => self.reasoning.push_str(text),
            StreamDelta::ToolCall {
                index,
                id,
                name,
                arguments_fragment,
            } => {
                let entry = self.tool_calls.entry(*index).or_default();
                if let Some(id) = id {
                    entry.id = Some(id.clone());
                }
                if let Some(name) = name {
                    entry.name = Some(name.clone());
                }
                if let Some(fragment) = arguments_fragment {
                    entry.arguments.push_str(fragment);
                }
            }
            StreamDelta::FinishReason(reason) => {
                self.finish_reason = Some(reason.clone());
            }
            StreamDelta::UsageFinal(usage) => {
                self.usage = Some(*usage);
            }
            StreamDelta::Done => {
                self.done = true;
            }
            StreamDelta::Ignore => {}
        }
    }

    /// Replace a call's accumulated arguments when the candidate is longer.
    pub fn patch_tool_arguments(&mut self, index: i64, candidate: &str) {
        let entry = self.tool_calls.entry(index).or_default();
        if candidate.len() > entry.arguments.len() {
            entry.arguments = candidate.to_string();
        }
    }

    pub fn saw_done(&self) -> bool {
        self.done
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish(self) -> CanonicalResponse {
        let mut segments = Vec::new();
        if !self.reasoning.is_empty() {
            segments.push(Segment::Reasoning(self.reasoning));
        }
        if !self.text.is_empty() {
            segments.push(Segment::Text(self.text));
        }
        for (index, call) in self.tool_calls {
            segments.push(Segment::ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name.unwrap_or_else(|| "tool".to_string()),
                arguments: call.arguments,
            });
        }
        CanonicalResponse {
            role: self.role.unwrap_or_else(|| "assistant".to_string()),
            segments,
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_text_in_order() {
        let mut agg = Aggregator::new();
        for text in ["A", "B", "C"] {
            agg.push(&StreamDelta::Content(text.to_string()));
        }
        let resp = agg.finish();
        assert_eq!(resp.text(), "ABC");
        assert_eq!(resp.role, "assistant");
    }

    #[test]
    fn merges_tool_calls_by_index() {
        let mut agg = Aggregator::new();
        agg.push(&StreamDelta::ToolCall {
            index: 0,
            id: Some("call_1".to_string()),
            name: Some("get_weather".to_string()),
            arguments_fragment: Some("{\"city\":".to_string()),
        });
        agg.push(&StreamDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            arguments_fragment: Some("\"Oslo\"}".to_string()),
        });
        let resp = agg.finish();
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("call_1", "get_weather", "{\"city\":\"Oslo\"}"));
    }

    #[test]
    fn longer_arguments_win_on_patch() {
        let mut agg = Aggregator::new();
        agg.push(&StreamDelta::ToolCall {
            index: 0,
            id: Some("c".to_string()),
            name: Some("f".to_string()),
            arguments_fragment: Some("{\"a\":1".to_string()),
        });
        // A shorter "done" payload must not clobber the longer accumulation.
        agg.patch_tool_arguments(0, "{}");
        agg.patch_tool_arguments(0, "{\"a\":1,\"b\":2}");
        let resp = agg.finish();
        assert_eq!(resp.tool_calls()[0].2, "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn usage_and_finish_reason_captured() {
        let mut agg = Aggregator::new();
        agg.push(&StreamDelta::FinishReason("stop".to_string()));
        agg.push(&StreamDelta::UsageFinal(Usage {
            prompt_tokens: 1,
            completion_tokens: 3,
            total_tokens: 4,
            ..Usage::default()
        }));
        agg.push(&StreamDelta::Done);
        assert!(agg.saw_done());
        let resp = agg.finish();
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total_tokens, 4);
    }
}
