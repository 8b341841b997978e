//! Gemini codec: canonical <-> `generateContent` bodies. The stream shape is
//! one `GenerateContentResponse` per SSE frame, so parse and emit share most
//! of the buffered logic.

use mgate_common::Usage;
use mgate_protocol::gemini::{
    Candidate, Content, FunctionCall, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, Part, UsageMetadata,
};
use mgate_protocol::sse::SseFrame;

use crate::canonical::{
    CanonicalResponse, ChatRequest, InboundMessage, MessagePart, Segment, StreamDelta,
};
use crate::codec::DialectError;

/// The model arrives in the URL path (`models/{model}:generateContent`), not
/// the body, so the caller passes it alongside.
pub fn decode_request(
    body: &[u8],
    model: &str,
    stream: bool,
) -> Result<ChatRequest, DialectError> {
    let req: GenerateContentRequest =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;

    let system = req.system_instruction.as_ref().map(|content| {
        content
            .parts
            .iter()
            .filter_map(|part| part.text.clone())
            .collect::<Vec<_>>()
            .join("")
    });

    let messages = req.contents.iter().map(decode_content).collect();
    let config = req.generation_config.unwrap_or_default();

    Ok(ChatRequest {
        model: model.to_string(),
        stream,
        messages,
        system,
        max_output_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        stop: config.stop_sequences,
        tools: req.tools,
        tool_choice: None,
        reasoning_effort: None,
    })
}

fn decode_content(content: &Content) -> InboundMessage {
    let role = match content.role.as_deref() {
        Some("model") => "assistant".to_string(),
        Some(role) => role.to_string(),
        None => "user".to_string(),
    };
    let mut parts = Vec::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            if part.thought == Some(true) {
                parts.push(MessagePart::Reasoning(text.clone()));
            } else {
                parts.push(MessagePart::Text(text.clone()));
            }
        }
        if let Some(call) = &part.function_call {
            parts.push(MessagePart::ToolCall {
                id: format!("fn_{}", call.name),
                name: call.name.clone(),
                arguments: serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string()),
            });
        }
        if let Some(response) = &part.function_response {
            parts.push(MessagePart::ToolResult {
                id: response
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(|n| format!("fn_{n}"))
                    .unwrap_or_default(),
                name: response
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(|n| n.to_string()),
                content: serde_json::to_string(response).unwrap_or_default(),
            });
        }
    }
    InboundMessage { role, parts }
}

pub fn build_body(req: &ChatRequest) -> Result<Vec<u8>, DialectError> {
    let contents = req.messages.iter().map(encode_message).collect();
    let body = GenerateContentRequest {
        contents,
        system_instruction: req.system.as_ref().map(|system| Content {
            role: None,
            parts: vec![Part::text(system.clone())],
        }),
        generation_config: Some(GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_output_tokens,
            stop_sequences: req.stop.clone(),
            candidate_count: None,
        }),
        tools: None,
        tool_config: None,
        safety_settings: None,
        extra: serde_json::Map::new(),
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

fn encode_message(message: &InboundMessage) -> Content {
    let role = match message.role.as_str() {
        "assistant" => Some("model".to_string()),
        "tool" => Some("user".to_string()),
        other => Some(other.to_string()),
    };
    let mut parts = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text(text) => parts.push(Part::text(text.clone())),
            MessagePart::Reasoning(_) => {}
            MessagePart::ToolCall {
                name, arguments, ..
            } => parts.push(Part {
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    args: serde_json::from_str(arguments)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
                }),
                ..Part::default()
            }),
            MessagePart::ToolResult { name, content, .. } => parts.push(Part {
                function_response: Some(serde_json::json!({
                    "name": name.clone().unwrap_or_default(),
                    "response": serde_json::from_str::<serde_json::Value>(content)
                        .unwrap_or(serde_json::Value::String(content.clone())),
                })),
                ..Part::default()
            }),
            MessagePart::Image { .. } => {}
        }
    }
    if parts.is_empty() {
        parts.push(Part::text(String::new()));
    }
    Content { role, parts }
}

pub fn parse_response(body: &[u8]) -> Result<CanonicalResponse, DialectError> {
    let resp: GenerateContentResponse =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    Ok(canonical_from_response(&resp))
}

fn canonical_from_response(resp: &GenerateContentResponse) -> CanonicalResponse {
    let mut out = CanonicalResponse {
        role: "assistant".to_string(),
        usage: resp.usage_metadata.as_ref().map(usage_from_gemini),
        ..CanonicalResponse::default()
    };
    if let Some(candidate) = resp.candidates.first() {
        out.finish_reason = candidate
            .finish_reason
            .as_deref()
            .map(finish_from_gemini);
        for part in &candidate.content.parts {
            if let Some(text) = &part.text {
                if part.thought == Some(true) {
                    out.segments.push(Segment::Reasoning(text.clone()));
                } else {
                    out.segments.push(Segment::Text(text.clone()));
                }
            }
            if let Some(call) = &part.function_call {
                out.segments.push(Segment::ToolCall {
                    id: format!("fn_{}", call.name),
                    name: call.name.clone(),
                    arguments: serde_json::to_string(&call.args)
                        .unwrap_or_else(|_| "{}".to_string()),
                });
            }
        }
    }
    out
}

/// Gemini stream frames repeat the full usage metadata as it grows; keep the
/// running call index so function calls across frames get distinct indexes.
#[derive(Debug, Default)]
pub struct StreamState {
    next_call_index: i64,
}

pub fn parse_stream_event(
    frame: &SseFrame,
    state: &mut StreamState,
) -> Result<Vec<StreamDelta>, DialectError> {
    let resp: GenerateContentResponse = match serde_json::from_str(&frame.data) {
        Ok(resp) => resp,
        Err(_) => return Ok(vec![StreamDelta::Ignore]),
    };

    let mut deltas = Vec::new();
    if let Some(usage) = &resp.usage_metadata {
        deltas.push(StreamDelta::UsageFinal(usage_from_gemini(usage)));
    }
    if let Some(candidate) = resp.candidates.first() {
        for part in &candidate.content.parts {
            if let Some(text) = &part.text {
                if part.thought == Some(true) {
                    deltas.push(StreamDelta::Reasoning(text.clone()));
                } else {
                    deltas.push(StreamDelta::Content(text.clone()));
                }
            }
            if let Some(call) = &part.function_call {
                let index = state.next_call_index;
                state.next_call_index += 1;
                deltas.push(StreamDelta::ToolCall {
                    index,
                    id: Some(format!("fn_{}", call.name)),
                    name: Some(call.name.clone()),
                    arguments_fragment: serde_json::to_string(&call.args).ok(),
                });
            }
        }
        if let Some(reason) = &candidate.finish_reason {
            deltas.push(StreamDelta::FinishReason(finish_from_gemini(reason)));
            deltas.push(StreamDelta::Done);
        }
    }
    if deltas.is_empty() {
        deltas.push(StreamDelta::Ignore);
    }
    Ok(deltas)
}

fn finish_from_gemini(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

fn finish_to_gemini(reason: &str) -> String {
    match reason {
        "stop" => "STOP".to_string(),
        "length" => "MAX_TOKENS".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

/// Emitter state for streaming to a Gemini-dialect client.
#[derive(Debug, Default)]
pub struct EmitState {
    usage: Usage,
    finish_reason: Option<String>,
    finished: bool,
}

impl EmitState {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn emit_stream_delta(delta: &StreamDelta, state: &mut EmitState) -> Vec<SseFrame> {
    match delta {
        StreamDelta::Content(text) => vec![chunk_frame(
            Part::text(text.clone()),
            None,
            None,
        )],
        StreamDelta::Reasoning(text) => {
            let part = Part {
                text: Some(text.clone()),
                thought: Some(true),
                ..Part::default()
            };
            vec![chunk_frame(part, None, None)]
        }
        StreamDelta::ToolCall {
            name,
            arguments_fragment,
            ..
        } => {
            // Gemini has no incremental call encoding; emit when complete
            // arguments are available.
            let Some(name) = name else { return Vec::new() };
            let args = arguments_fragment
                .as_deref()
                .and_then(|fragment| serde_json::from_str(fragment).ok())
                .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
            let part = Part {
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    args,
                }),
                ..Part::default()
            };
            vec![chunk_frame(part, None, None)]
        }
        StreamDelta::FinishReason(reason) => {
            state.finish_reason = Some(reason.clone());
            Vec::new()
        }
        StreamDelta::UsageFinal(usage) => {
            state.usage = *usage;
            Vec::new()
        }
        StreamDelta::Done => {
            if state.finished {
                return Vec::new();
            }
            state.finished = true;
            let reason = finish_to_gemini(state.finish_reason.as_deref().unwrap_or("stop"));
            vec![chunk_frame(
                Part::text(String::new()),
                Some(reason),
                Some(usage_to_gemini(&state.usage)),
            )]
        }
        StreamDelta::Role(_) | StreamDelta::Ignore => Vec::new(),
    }
}

pub fn emit_stream_tail(state: &mut EmitState) -> Vec<SseFrame> {
    emit_stream_delta(&StreamDelta::Done, state)
}

pub fn emit_buffered(resp: &CanonicalResponse) -> Result<Vec<u8>, DialectError> {
    let mut parts = Vec::new();
    for segment in &resp.segments {
        match segment {
            Segment::Text(text) => parts.push(Part::text(text.clone())),
            Segment::Reasoning(text) => parts.push(Part {
                text: Some(text.clone()),
                thought: Some(true),
                ..Part::default()
            }),
            Segment::ToolCall {
                name, arguments, ..
            } => parts.push(Part {
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    args: serde_json::from_str(arguments)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
                }),
                ..Part::default()
            }),
            Segment::ToolResult { .. } | Segment::OpaqueJson { .. } => {}
        }
    }
    let body = GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                role: Some("model".to_string()),
                parts,
            },
            finish_reason: Some(finish_to_gemini(
                resp.finish_reason.as_deref().unwrap_or("stop"),
            )),
            index: Some(0),
        }],
        usage_metadata: resp.usage.as_ref().map(usage_to_gemini),
        model_version: None,
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

pub fn usage_from_gemini(usage: &UsageMetadata) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_token_count.unwrap_or(0),
        completion_tokens: usage.candidates_token_count.unwrap_or(0),
        total_tokens: usage.total_token_count.unwrap_or(0),
        cached_tokens: usage.cached_content_token_count.unwrap_or(0),
        reasoning_tokens: usage.thoughts_token_count.unwrap_or(0),
        image_tokens: 0,
    }
    .with_totals()
}

pub fn usage_to_gemini(usage: &Usage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: Some(usage.prompt_tokens),
        candidates_token_count: Some(usage.completion_tokens),
        total_token_count: Some(usage.total_tokens),
        cached_content_token_count: (usage.cached_tokens > 0).then_some(usage.cached_tokens),
        thoughts_token_count: (usage.reasoning_tokens > 0).then_some(usage.reasoning_tokens),
    }
}

fn chunk_frame(part: Part, finish_reason: Option<String>, usage: Option<UsageMetadata>) -> SseFrame {
    let resp = GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                role: Some("model".to_string()),
                parts: vec![part],
            },
            finish_reason,
            index: Some(0),
        }],
        usage_metadata: usage,
        model_version: None,
    };
    SseFrame::data(serde_json::to_string(&resp).unwrap_or_else(|_| "{}".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Aggregator;

    #[test]
    fn stream_frames_aggregate() {
        let mut state = StreamState::default();
        let mut agg = Aggregator::new();
        let frames = [
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#,
        ];
        for data in frames {
            for delta in parse_stream_event(&SseFrame::data(data), &mut state).unwrap() {
                agg.push(&delta);
            }
        }
        assert!(agg.saw_done());
        let resp = agg.finish();
        assert_eq!(resp.text(), "Hello");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn request_decode_maps_roles_and_config() {
        let body = br#"{"contents":[{"role":"user","parts":[{"text":"hi"}]},{"role":"model","parts":[{"text":"yo"}]}],"generationConfig":{"maxOutputTokens":64,"temperature":0.5}}"#;
        let req = decode_request(body, "gemini-pro", true).unwrap();
        assert_eq!(req.model, "gemini-pro");
        assert!(req.stream);
        assert_eq!(req.messages[1].role, "assistant");
        assert_eq!(req.max_output_tokens, Some(64));
    }

    #[test]
    fn buffered_round_trip_keeps_text_and_usage() {
        let body = br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"out"}]},"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":2,"totalTokenCount":3}}"#;
        let resp = parse_response(body).unwrap();
        assert_eq!(resp.text(), "out");
        assert_eq!(resp.finish_reason.as_deref(), Some("length"));
        let encoded = emit_buffered(&resp).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["candidates"][0]["finishReason"], "MAX_TOKENS");
        assert_eq!(value["usageMetadata"]["totalTokenCount"], 3);
    }
}
