//! OpenAI chat/completions codec: canonical <-> `chat.completion` /
//! `chat.completion.chunk`.

use mgate_common::Usage;
use mgate_protocol::openai::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ChunkChoice, ChunkDelta, CompletionTokensDetails, CompletionUsage, ContentPart, FunctionCall,
    FunctionCallChunk, MessageContent, PromptTokensDetails, StreamOptions, Tool, ToolCall,
    ToolCallChunk,
};
use mgate_protocol::sse::SseFrame;

use crate::canonical::{
    CanonicalResponse, ChatRequest, InboundMessage, MessagePart, Segment, StreamDelta,
};
use crate::codec::DialectError;

pub fn decode_request(body: &[u8]) -> Result<ChatRequest, DialectError> {
    let req: ChatCompletionRequest =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    if req.model.is_empty() {
        return Err(DialectError::Decode("missing model".to_string()));
    }

    let mut messages = Vec::with_capacity(req.messages.len());
    let mut system = None;
    for message in &req.messages {
        if message.role == "system" || message.role == "developer" {
            system = Some(message.content_text());
            continue;
        }
        messages.push(decode_message(message));
    }

    Ok(ChatRequest {
        model: req.model,
        stream: req.stream.unwrap_or(false),
        messages,
        system,
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: decode_stop(req.stop.as_ref()),
        tools: req.tools.as_ref().map(|tools| {
            serde_json::to_value(tools).unwrap_or(serde_json::Value::Null)
        }),
        tool_choice: req.tool_choice,
        reasoning_effort: req.reasoning_effort,
    })
}

fn decode_message(message: &ChatMessage) -> InboundMessage {
    let mut parts = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                parts.push(MessagePart::Text(text.clone()));
            }
        }
        Some(MessageContent::Parts(content)) => {
            for part in content {
                match part {
                    ContentPart::Text { text } => parts.push(MessagePart::Text(text.clone())),
                    ContentPart::ImageUrl { image_url } => parts.push(MessagePart::Image {
                        url: image_url.url.clone(),
                    }),
                    ContentPart::InputAudio { .. } => {}
                }
            }
        }
        None => {}
    }
    if let Some(reasoning) = &message.reasoning_content {
        parts.push(MessagePart::Reasoning(reasoning.clone()));
    }
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            parts.push(MessagePart::ToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            });
        }
    }
    if message.role == "tool" {
        // The entire body of a tool message is the result payload.
        let content = message.content_text();
        parts = vec![MessagePart::ToolResult {
            id: message.tool_call_id.clone().unwrap_or_default(),
            name: message.name.clone(),
            content,
        }];
    }
    InboundMessage {
        role: message.role.clone(),
        parts,
    }
}

fn decode_stop(stop: Option<&serde_json::Value>) -> Option<Vec<String>> {
    match stop? {
        serde_json::Value::String(s) => Some(vec![s.clone()]),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect(),
        ),
        _ => None,
    }
}

/// Build the upstream `chat/completions` body for an OpenAI-family channel.
/// The model has already been mapped through the channel rewrite table.
pub fn build_body(req: &ChatRequest, upstream_model: &str) -> Result<Vec<u8>, DialectError> {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(ChatMessage::text("system", system.clone()));
    }
    for message in &req.messages {
        messages.extend(encode_message(message));
    }

    let body = ChatCompletionRequest {
        model: upstream_model.to_string(),
        messages,
        stream: req.stream.then_some(true),
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: Some(true),
        }),
        max_tokens: None,
        max_completion_tokens: req.max_output_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        n: None,
        stop: req
            .stop
            .as_ref()
            .map(|stop| serde_json::to_value(stop).unwrap_or(serde_json::Value::Null)),
        tools: req.tools.as_ref().and_then(tools_to_openai),
        tool_choice: req.tool_choice.clone(),
        parallel_tool_calls: None,
        response_format: None,
        reasoning_effort: req.reasoning_effort.clone(),
        user: None,
        seed: None,
        extra: serde_json::Map::new(),
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

fn encode_message(message: &InboundMessage) -> Vec<ChatMessage> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();
    let mut images = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text(t) => text.push_str(t),
            MessagePart::Reasoning(_) => {}
            MessagePart::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            MessagePart::ToolResult { id, name, content } => {
                tool_results.push((id.clone(), name.clone(), content.clone()));
            }
            MessagePart::Image { url } => images.push(url.clone()),
        }
    }

    let mut out = Vec::new();
    if !tool_results.is_empty() {
        for (id, name, content) in tool_results {
            out.push(ChatMessage {
                role: "tool".to_string(),
                content: Some(MessageContent::Text(content)),
                name,
                tool_calls: None,
                tool_call_id: Some(id),
                reasoning_content: None,
            });
        }
        return out;
    }

    let content = if images.is_empty() {
        (!text.is_empty() || tool_calls.is_empty()).then(|| MessageContent::Text(text))
    } else {
        let mut parts: Vec<ContentPart> = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        for url in images {
            parts.push(ContentPart::ImageUrl {
                image_url: mgate_protocol::openai::chat::ImageUrl { url, detail: None },
            });
        }
        Some(MessageContent::Parts(parts))
    };

    out.push(ChatMessage {
        role: message.role.clone(),
        content,
        name: None,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        reasoning_content: None,
    });
    out
}

/// Accept tool definitions in either wire shape: OpenAI's nested
/// `{type, function: {name, parameters}}` or the flat Claude form
/// `{name, input_schema}` that cross-dialect requests carry.
fn tools_to_openai(value: &serde_json::Value) -> Option<Vec<Tool>> {
    let items = value.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if item.get("function").is_some() {
            if let Ok(tool) = serde_json::from_value::<Tool>(item.clone()) {
                out.push(tool);
            }
        } else if let Some(name) = item.get("name").and_then(|name| name.as_str()) {
            out.push(Tool {
                kind: "function".to_string(),
                function: mgate_protocol::openai::chat::FunctionDef {
                    name: name.to_string(),
                    description: item
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(|d| d.to_string()),
                    parameters: item.get("input_schema").cloned(),
                },
            });
        }
    }
    (!out.is_empty()).then_some(out)
}

pub fn parse_response(body: &[u8]) -> Result<CanonicalResponse, DialectError> {
    let resp: ChatCompletionResponse =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    let mut out = CanonicalResponse {
        role: "assistant".to_string(),
        usage: resp.usage.as_ref().map(usage_from_openai),
        ..CanonicalResponse::default()
    };
    let Some(choice) = resp.choices.first() else {
        return Ok(out);
    };
    out.finish_reason = choice.finish_reason.clone();
    if let Some(reasoning) = &choice.message.reasoning_content {
        out.segments.push(Segment::Reasoning(reasoning.clone()));
    }
    let text = choice.message.content_text();
    if !text.is_empty() {
        out.segments.push(Segment::Text(text));
    }
    if let Some(calls) = &choice.message.tool_calls {
        for call in calls {
            out.segments.push(Segment::ToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            });
        }
    }
    Ok(out)
}

/// Per-connection stream state. The OpenAI chunk shape carries no cross-event
/// bookkeeping beyond the `[DONE]` sentinel, so this stays empty.
#[derive(Debug, Default)]
pub struct StreamState;

pub fn parse_stream_event(
    frame: &SseFrame,
    _state: &mut StreamState,
) -> Result<Vec<StreamDelta>, DialectError> {
    if frame.is_done() {
        return Ok(vec![StreamDelta::Done]);
    }
    let chunk: ChatCompletionChunk = match serde_json::from_str(&frame.data) {
        Ok(chunk) => chunk,
        // Unknown frames are forwarded-compatible noise, not errors.
        Err(_) => return Ok(vec![StreamDelta::Ignore]),
    };

    let mut deltas = Vec::new();
    if let Some(usage) = &chunk.usage {
        deltas.push(StreamDelta::UsageFinal(usage_from_openai(usage)));
    }
    let Some(choice) = chunk.choices.first() else {
        return Ok(if deltas.is_empty() {
            vec![StreamDelta::Ignore]
        } else {
            deltas
        });
    };
    if let Some(role) = &choice.delta.role {
        deltas.push(StreamDelta::Role(role.clone()));
    }
    if let Some(content) = &choice.delta.content {
        deltas.push(StreamDelta::Content(content.clone()));
    }
    if let Some(reasoning) = &choice.delta.reasoning_content {
        deltas.push(StreamDelta::Reasoning(reasoning.clone()));
    }
    if let Some(calls) = &choice.delta.tool_calls {
        for call in calls {
            deltas.push(StreamDelta::ToolCall {
                index: call.index,
                id: call.id.clone(),
                name: call.function.as_ref().and_then(|f| f.name.clone()),
                arguments_fragment: call.function.as_ref().and_then(|f| f.arguments.clone()),
            });
        }
    }
    if let Some(reason) = &choice.finish_reason {
        deltas.push(StreamDelta::FinishReason(reason.clone()));
    }
    if deltas.is_empty() {
        deltas.push(StreamDelta::Ignore);
    }
    Ok(deltas)
}

/// Emitter state for streaming to an OpenAI-dialect client.
#[derive(Debug)]
pub struct EmitState {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    finished: bool,
}

impl EmitState {
    pub fn new(model: &str, created: i64) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created,
            role_sent: false,
            finished: false,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
            system_fingerprint: None,
        }
    }
}

pub fn emit_stream_delta(delta: &StreamDelta, state: &mut EmitState) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    if !state.role_sent
        && !matches!(delta, StreamDelta::Ignore | StreamDelta::Done)
    {
        state.role_sent = true;
        let chunk = state.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                ..ChunkDelta::default()
            },
            None,
        );
        frames.push(data_frame(&chunk));
    }

    match delta {
        StreamDelta::Role(_) | StreamDelta::Ignore => {}
        StreamDelta::Content(text) => {
            let chunk = state.chunk(
                ChunkDelta {
                    content: Some(text.clone()),
                    ..ChunkDelta::default()
                },
                None,
            );
            frames.push(data_frame(&chunk));
        }
        StreamDelta::Reasoning(text) => {
            let chunk = state.chunk(
                ChunkDelta {
                    reasoning_content: Some(text.clone()),
                    ..ChunkDelta::default()
                },
                None,
            );
            frames.push(data_frame(&chunk));
        }
        StreamDelta::ToolCall {
            index,
            id,
            name,
            arguments_fragment,
        } => {
            let chunk = state.chunk(
                ChunkDelta {
                    tool_calls: Some(vec![ToolCallChunk {
                        index: *index,
                        id: id.clone(),
                        kind: id.as_ref().map(|_| "function".to_string()),
                        function: Some(FunctionCallChunk {
                            name: name.clone(),
                            arguments: arguments_fragment.clone(),
                        }),
                    }]),
                    ..ChunkDelta::default()
                },
                None,
            );
            frames.push(data_frame(&chunk));
        }
        StreamDelta::FinishReason(reason) => {
            state.finished = true;
            let chunk = state.chunk(ChunkDelta::default(), Some(reason.clone()));
            frames.push(data_frame(&chunk));
        }
        StreamDelta::UsageFinal(usage) => {
            let mut chunk = state.chunk(ChunkDelta::default(), None);
            chunk.choices.clear();
            chunk.usage = Some(usage_to_openai(usage));
            frames.push(data_frame(&chunk));
        }
        StreamDelta::Done => {
            frames.push(SseFrame::data("[DONE]"));
        }
    }
    frames
}

/// Close out a stream toward an OpenAI client when the upstream never sent a
/// terminal frame of its own.
pub fn emit_stream_tail(state: &mut EmitState) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    if !state.finished {
        state.finished = true;
        let chunk = state.chunk(ChunkDelta::default(), Some("stop".to_string()));
        frames.push(data_frame(&chunk));
    }
    frames.push(SseFrame::data("[DONE]"));
    frames
}

pub fn emit_buffered(
    resp: &CanonicalResponse,
    model: &str,
    created: i64,
) -> Result<Vec<u8>, DialectError> {
    let mut message = ChatMessage {
        role: resp.role.clone(),
        content: None,
        name: None,
        tool_calls: None,
        tool_call_id: None,
        reasoning_content: None,
    };
    let text = resp.text();
    if !text.is_empty() {
        message.content = Some(MessageContent::Text(text));
    }
    let reasoning = resp.reasoning();
    if !reasoning.is_empty() {
        message.reasoning_content = Some(reasoning);
    }
    let calls: Vec<ToolCall> = resp
        .tool_calls()
        .into_iter()
        .map(|(id, name, arguments)| ToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        })
        .collect();
    if !calls.is_empty() {
        message.tool_calls = Some(calls);
    }

    let body = ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: Some(
                resp.finish_reason
                    .clone()
                    .unwrap_or_else(|| "stop".to_string()),
            ),
        }],
        usage: resp.usage.as_ref().map(usage_to_openai),
        system_fingerprint: None,
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

pub fn usage_from_openai(usage: &CompletionUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cached_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens)
            .unwrap_or(0),
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .and_then(|details| details.reasoning_tokens)
            .unwrap_or(0),
        image_tokens: 0,
    }
    .with_totals()
}

pub fn usage_to_openai(usage: &Usage) -> CompletionUsage {
    CompletionUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        prompt_tokens_details: (usage.cached_tokens > 0).then_some(PromptTokensDetails {
            cached_tokens: Some(usage.cached_tokens),
            audio_tokens: None,
        }),
        completion_tokens_details: (usage.reasoning_tokens > 0).then_some(
            CompletionTokensDetails {
                reasoning_tokens: Some(usage.reasoning_tokens),
                audio_tokens: None,
            },
        ),
    }
}

fn data_frame<T: serde::Serialize>(value: &T) -> SseFrame {
    SseFrame::data(serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Aggregator;

    fn frame(json: &str) -> SseFrame {
        SseFrame::data(json)
    }

    #[test]
    fn chunk_stream_aggregates_content_and_usage() {
        let mut state = StreamState;
        let mut agg = Aggregator::new();
        let chunks = [
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"role":"assistant","content":"A"}}]}"#,
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"B"}}]}"#,
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"C"},"finish_reason":"stop"}]}"#,
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[],"usage":{"prompt_tokens":1,"completion_tokens":3,"total_tokens":4}}"#,
        ];
        for chunk in chunks {
            for delta in parse_stream_event(&frame(chunk), &mut state).unwrap() {
                agg.push(&delta);
            }
        }
        for delta in parse_stream_event(&frame("[DONE]"), &mut state).unwrap() {
            agg.push(&delta);
        }
        assert!(agg.saw_done());
        let resp = agg.finish();
        assert_eq!(resp.text(), "ABC");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        let usage = resp.usage.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (1, 3));
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let mut state = StreamState;
        let mut agg = Aggregator::new();
        let chunks = [
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"lookup","arguments":""}}]}}]}"#,
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]}}]}"#,
            r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}"#,
        ];
        for chunk in chunks {
            for delta in parse_stream_event(&frame(chunk), &mut state).unwrap() {
                agg.push(&delta);
            }
        }
        let resp = agg.finish();
        assert_eq!(
            resp.tool_calls(),
            vec![("call_a", "lookup", "{\"q\":\"rust\"}")]
        );
    }

    #[test]
    fn emitted_stream_reaggregates_to_same_text() {
        let mut emit = EmitState::new("m", 1);
        let deltas = [
            StreamDelta::Content("hel".to_string()),
            StreamDelta::Content("lo".to_string()),
            StreamDelta::FinishReason("stop".to_string()),
            StreamDelta::Done,
        ];
        let mut frames = Vec::new();
        for delta in &deltas {
            frames.extend(emit_stream_delta(delta, &mut emit));
        }

        let mut state = StreamState;
        let mut agg = Aggregator::new();
        for frame in &frames {
            for delta in parse_stream_event(frame, &mut state).unwrap() {
                agg.push(&delta);
            }
        }
        let resp = agg.finish();
        assert_eq!(resp.text(), "hello");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn request_round_trip_keeps_model_and_system() {
        let body = br#"{"model":"gpt-4o-mini","messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}],"stream":false,"max_tokens":128}"#;
        let req = decode_request(body).unwrap();
        assert_eq!(req.model, "gpt-4o-mini");
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert_eq!(req.max_output_tokens, Some(128));
        assert!(!req.stream);

        let upstream = build_body(&req, "gpt-4o-mini-2024").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&upstream).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini-2024");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
        assert!(value.get("stream").is_none());
    }
}
