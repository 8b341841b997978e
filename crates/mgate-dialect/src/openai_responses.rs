//! Responses-API codec: canonical <-> `/v1/responses` bodies and the
//! event-typed stream.

use mgate_common::Usage;
use mgate_protocol::openai::responses::{
    OutputContent, OutputItem, ResponsesInputTokensDetails, ResponsesOutputTokensDetails,
    ResponsesRequest, ResponsesResponse, ResponsesStreamEvent, ResponsesUsage,
};
use mgate_protocol::sse::SseFrame;

use crate::canonical::{
    CanonicalResponse, ChatRequest, InboundMessage, MessagePart, Segment, StreamDelta,
};
use crate::codec::DialectError;

pub fn decode_request(body: &[u8]) -> Result<ChatRequest, DialectError> {
    let req: ResponsesRequest =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    if req.model.is_empty() {
        return Err(DialectError::Decode("missing model".to_string()));
    }

    let mut messages = Vec::new();
    match &req.input {
        Some(serde_json::Value::String(text)) => {
            messages.push(InboundMessage::text("user", text.clone()));
        }
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                if let Some(message) = decode_input_item(item) {
                    messages.push(message);
                }
            }
        }
        _ => {}
    }

    Ok(ChatRequest {
        model: req.model,
        stream: req.stream.unwrap_or(false),
        messages,
        system: req.instructions,
        max_output_tokens: req.max_output_tokens,
        temperature: req.temperature,
        top_p: None,
        stop: None,
        tools: req.tools,
        tool_choice: req.tool_choice,
        reasoning_effort: req
            .reasoning
            .as_ref()
            .and_then(|r| r.get("effort"))
            .and_then(|e| e.as_str())
            .map(|e| e.to_string()),
    })
}

fn decode_input_item(item: &serde_json::Value) -> Option<InboundMessage> {
    let role = item.get("role")?.as_str()?.to_string();
    let mut parts = Vec::new();
    match item.get("content") {
        Some(serde_json::Value::String(text)) => parts.push(MessagePart::Text(text.clone())),
        Some(serde_json::Value::Array(content)) => {
            for part in content {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("input_text") | Some("output_text") | Some("text") => {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            parts.push(MessagePart::Text(text.to_string()));
                        }
                    }
                    Some("input_image") => {
                        if let Some(url) = part.get("image_url").and_then(|u| u.as_str()) {
                            parts.push(MessagePart::Image {
                                url: url.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    Some(InboundMessage { role, parts })
}

pub fn build_body(req: &ChatRequest, upstream_model: &str) -> Result<Vec<u8>, DialectError> {
    let input: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|message| {
            serde_json::json!({
                "role": message.role,
                "content": message.plain_text(),
            })
        })
        .collect();

    let body = ResponsesRequest {
        model: upstream_model.to_string(),
        input: Some(serde_json::Value::Array(input)),
        instructions: req.system.clone(),
        stream: req.stream.then_some(true),
        max_output_tokens: req.max_output_tokens,
        temperature: req.temperature,
        tools: req.tools.clone(),
        tool_choice: req.tool_choice.clone(),
        reasoning: req
            .reasoning_effort
            .as_ref()
            .map(|effort| serde_json::json!({ "effort": effort })),
        extra: serde_json::Map::new(),
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

pub fn parse_response(body: &[u8]) -> Result<CanonicalResponse, DialectError> {
    let resp: ResponsesResponse =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    Ok(canonical_from_response(&resp))
}

fn canonical_from_response(resp: &ResponsesResponse) -> CanonicalResponse {
    let mut out = CanonicalResponse {
        role: "assistant".to_string(),
        usage: resp.usage.as_ref().map(usage_from_responses),
        finish_reason: resp.status.as_deref().map(|status| match status {
            "completed" => "stop".to_string(),
            "incomplete" => "length".to_string(),
            other => other.to_string(),
        }),
        ..CanonicalResponse::default()
    };
    for item in &resp.output {
        match item {
            OutputItem::Message { content, .. } => {
                for part in content {
                    match part {
                        OutputContent::OutputText { text, .. } => {
                            out.segments.push(Segment::Text(text.clone()))
                        }
                        OutputContent::Refusal { refusal } => {
                            out.segments.push(Segment::Text(refusal.clone()))
                        }
                        OutputContent::Other(_) => {}
                    }
                }
            }
            OutputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            } => out.segments.push(Segment::ToolCall {
                id: call_id
                    .clone()
                    .or_else(|| id.clone())
                    .unwrap_or_else(|| "call_0".to_string()),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            OutputItem::Reasoning { summary, .. } => {
                let mut text = String::new();
                for part in summary {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                if !text.is_empty() {
                    out.segments.push(Segment::Reasoning(text));
                }
            }
            OutputItem::Other(value) => out.segments.push(Segment::OpaqueJson {
                label: "responses_item".to_string(),
                payload: value.clone(),
            }),
        }
    }
    if out.segments.is_empty()
        && let Some(text) = &resp.output_text
        && !text.is_empty()
    {
        out.segments.push(Segment::Text(text.clone()));
    }
    out
}

#[derive(Debug, Clone, Default)]
struct CallState {
    output_index: i64,
    emitted_len: usize,
}

/// Per-connection state for the event-typed stream.
///
/// Argument payloads can arrive twice: incrementally via
/// `function_call_arguments.delta` and complete via the `.done` event or the
/// finished output item. The buffer tracks how much has already been emitted
/// per call (keyed by `item_id` when present, else by `output_index`), and a
/// complete payload only emits its unseen suffix, so the longer source wins.
#[derive(Debug, Default)]
pub struct StreamState {
    calls_by_item: std::collections::HashMap<String, CallState>,
    calls_by_output: std::collections::HashMap<i64, CallState>,
    finished: bool,
}

impl StreamState {
    fn call_mut(&mut self, item_id: Option<&str>, output_index: i64) -> &mut CallState {
        match item_id {
            Some(id) => self
                .calls_by_item
                .entry(id.to_string())
                .or_insert_with(|| CallState {
                    output_index,
                    emitted_len: 0,
                }),
            None => self
                .calls_by_output
                .entry(output_index)
                .or_insert_with(|| CallState {
                    output_index,
                    emitted_len: 0,
                }),
        }
    }
}

pub fn parse_stream_event(
    frame: &SseFrame,
    state: &mut StreamState,
) -> Result<Vec<StreamDelta>, DialectError> {
    if frame.is_done() {
        return Ok(vec![StreamDelta::Done]);
    }
    let event: ResponsesStreamEvent = match serde_json::from_str(&frame.data) {
        Ok(event) => event,
        Err(_) => return Ok(vec![StreamDelta::Ignore]),
    };

    let deltas = match event {
        ResponsesStreamEvent::Created { .. } | ResponsesStreamEvent::InProgress { .. } => {
            vec![StreamDelta::Role("assistant".to_string())]
        }
        ResponsesStreamEvent::OutputTextDelta { delta, .. } => {
            vec![StreamDelta::Content(delta)]
        }
        ResponsesStreamEvent::OutputTextDone { .. } => vec![StreamDelta::Ignore],
        ResponsesStreamEvent::ReasoningSummaryTextDelta { delta, .. } => {
            vec![StreamDelta::Reasoning(delta)]
        }
        ResponsesStreamEvent::OutputItemAdded { output_index, item } => {
            match item {
                OutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                } => {
                    let key = id.clone();
                    let call = state.call_mut(key.as_deref(), output_index);
                    let mut fragment = None;
                    if arguments.len() > call.emitted_len {
                        fragment = Some(arguments[call.emitted_len..].to_string());
                        call.emitted_len = arguments.len();
                    }
                    vec![StreamDelta::ToolCall {
                        index: output_index,
                        id: call_id.or(id),
                        name: Some(name),
                        arguments_fragment: fragment,
                    }]
                }
                _ => vec![StreamDelta::Ignore],
            }
        }
        ResponsesStreamEvent::FunctionCallArgumentsDelta {
            item_id,
            output_index,
            delta,
        } => {
            let call = state.call_mut(item_id.as_deref(), output_index);
            call.emitted_len += delta.len();
            vec![StreamDelta::ToolCall {
                index: call.output_index,
                id: None,
                name: None,
                arguments_fragment: Some(delta),
            }]
        }
        ResponsesStreamEvent::FunctionCallArgumentsDone {
            item_id,
            output_index,
            name,
            arguments,
        } => {
            let call = state.call_mut(item_id.as_deref(), output_index);
            let mut fragment = None;
            if arguments.len() > call.emitted_len {
                fragment = Some(arguments[call.emitted_len..].to_string());
                call.emitted_len = arguments.len();
            }
            if fragment.is_none() && name.is_none() {
                vec![StreamDelta::Ignore]
            } else {
                vec![StreamDelta::ToolCall {
                    index: call.output_index,
                    id: None,
                    name,
                    arguments_fragment: fragment,
                }]
            }
        }
        ResponsesStreamEvent::OutputItemDone { output_index, item } => match item {
            OutputItem::FunctionCall { id, arguments, .. } => {
                let call = state.call_mut(id.as_deref(), output_index);
                if arguments.len() > call.emitted_len {
                    let fragment = arguments[call.emitted_len..].to_string();
                    call.emitted_len = arguments.len();
                    vec![StreamDelta::ToolCall {
                        index: call.output_index,
                        id: None,
                        name: None,
                        arguments_fragment: Some(fragment),
                    }]
                } else {
                    vec![StreamDelta::Ignore]
                }
            }
            _ => vec![StreamDelta::Ignore],
        },
        ResponsesStreamEvent::Completed { response }
        | ResponsesStreamEvent::Incomplete { response }
        | ResponsesStreamEvent::Failed { response } => {
            state.finished = true;
            let mut deltas = Vec::new();
            if let Some(usage) = &response.usage {
                deltas.push(StreamDelta::UsageFinal(usage_from_responses(usage)));
            }
            let finish = match response.status.as_deref() {
                Some("incomplete") => "length",
                Some("failed") => "error",
                _ => "stop",
            };
            deltas.push(StreamDelta::FinishReason(finish.to_string()));
            deltas.push(StreamDelta::Done);
            deltas
        }
        ResponsesStreamEvent::Other(_) => vec![StreamDelta::Ignore],
    };
    Ok(deltas)
}

/// Emitter state for streaming to a Responses-API client.
#[derive(Debug)]
pub struct EmitState {
    response_id: String,
    model: String,
    created_at: i64,
    started: bool,
    message_item_open: bool,
    text: String,
    usage: Usage,
    completed: bool,
}

impl EmitState {
    pub fn new(model: &str, created_at: i64) -> Self {
        Self {
            response_id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created_at,
            started: false,
            message_item_open: false,
            text: String::new(),
            usage: Usage::default(),
            completed: false,
        }
    }

    fn shell(&self, status: &str, with_output: bool, usage: Option<&Usage>) -> ResponsesResponse {
        let output = if with_output && !self.text.is_empty() {
            vec![OutputItem::Message {
                id: Some(format!("{}-msg0", self.response_id)),
                role: "assistant".to_string(),
                content: vec![OutputContent::OutputText {
                    text: self.text.clone(),
                    annotations: Vec::new(),
                }],
            }]
        } else {
            Vec::new()
        };
        ResponsesResponse {
            id: self.response_id.clone(),
            object: "response".to_string(),
            created_at: self.created_at,
            model: self.model.clone(),
            output,
            output_text: None,
            status: Some(status.to_string()),
            usage: usage.map(usage_to_responses),
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<SseFrame>) {
        if self.started {
            return;
        }
        self.started = true;
        frames.push(typed_frame(
            "response.created",
            &ResponsesStreamEvent::Created {
                response: self.shell("in_progress", false, None),
            },
        ));
    }

    fn ensure_message_item(&mut self, frames: &mut Vec<SseFrame>) {
        if self.message_item_open {
            return;
        }
        self.message_item_open = true;
        frames.push(typed_frame(
            "response.output_item.added",
            &ResponsesStreamEvent::OutputItemAdded {
                output_index: 0,
                item: OutputItem::Message {
                    id: Some(format!("{}-msg0", self.response_id)),
                    role: "assistant".to_string(),
                    content: Vec::new(),
                },
            },
        ));
    }
}

pub fn emit_stream_delta(delta: &StreamDelta, state: &mut EmitState) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    match delta {
        StreamDelta::Ignore | StreamDelta::Role(_) | StreamDelta::Reasoning(_) => {}
        StreamDelta::Content(text) => {
            state.ensure_started(&mut frames);
            state.ensure_message_item(&mut frames);
            state.text.push_str(text);
            frames.push(typed_frame(
                "response.output_text.delta",
                &ResponsesStreamEvent::OutputTextDelta {
                    item_id: Some(format!("{}-msg0", state.response_id)),
                    output_index: 0,
                    content_index: 0,
                    delta: text.clone(),
                },
            ));
        }
        StreamDelta::ToolCall {
            index,
            id,
            name,
            arguments_fragment,
        } => {
            state.ensure_started(&mut frames);
            if let Some(name) = name {
                frames.push(typed_frame(
                    "response.output_item.added",
                    &ResponsesStreamEvent::OutputItemAdded {
                        output_index: *index,
                        item: OutputItem::FunctionCall {
                            id: id.clone(),
                            call_id: id.clone(),
                            name: name.clone(),
                            arguments: String::new(),
                        },
                    },
                ));
            }
            if let Some(fragment) = arguments_fragment
                && !fragment.is_empty()
            {
                frames.push(typed_frame(
                    "response.function_call_arguments.delta",
                    &ResponsesStreamEvent::FunctionCallArgumentsDelta {
                        item_id: id.clone(),
                        output_index: *index,
                        delta: fragment.clone(),
                    },
                ));
            }
        }
        StreamDelta::FinishReason(_) => {}
        StreamDelta::UsageFinal(usage) => {
            state.usage = *usage;
        }
        StreamDelta::Done => {
            state.ensure_started(&mut frames);
            if !state.completed {
                state.completed = true;
                if !state.text.is_empty() {
                    frames.push(typed_frame(
                        "response.output_text.done",
                        &ResponsesStreamEvent::OutputTextDone {
                            item_id: Some(format!("{}-msg0", state.response_id)),
                            output_index: 0,
                            content_index: 0,
                            text: state.text.clone(),
                        },
                    ));
                }
                let usage = state.usage;
                frames.push(typed_frame(
                    "response.completed",
                    &ResponsesStreamEvent::Completed {
                        response: state.shell("completed", true, Some(&usage)),
                    },
                ));
            }
        }
    }
    frames
}

pub fn emit_stream_tail(state: &mut EmitState) -> Vec<SseFrame> {
    emit_stream_delta(&StreamDelta::Done, state)
}

pub fn emit_buffered(
    resp: &CanonicalResponse,
    model: &str,
    created_at: i64,
) -> Result<Vec<u8>, DialectError> {
    let mut output = Vec::new();
    let text = resp.text();
    if !text.is_empty() {
        output.push(OutputItem::Message {
            id: Some("msg_0".to_string()),
            role: resp.role.clone(),
            content: vec![OutputContent::OutputText {
                text: text.clone(),
                annotations: Vec::new(),
            }],
        });
    }
    for (index, (id, name, arguments)) in resp.tool_calls().into_iter().enumerate() {
        output.push(OutputItem::FunctionCall {
            id: Some(format!("fc_{index}")),
            call_id: Some(id.to_string()),
            name: name.to_string(),
            arguments: arguments.to_string(),
        });
    }
    let body = ResponsesResponse {
        id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
        object: "response".to_string(),
        created_at,
        model: model.to_string(),
        output,
        output_text: (!text.is_empty()).then_some(text),
        status: Some("completed".to_string()),
        usage: resp.usage.as_ref().map(usage_to_responses),
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

pub fn usage_from_responses(usage: &ResponsesUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        cached_tokens: usage
            .input_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens)
            .unwrap_or(0),
        reasoning_tokens: usage
            .output_tokens_details
            .as_ref()
            .and_then(|details| details.reasoning_tokens)
            .unwrap_or(0),
        image_tokens: 0,
    }
    .with_totals()
}

pub fn usage_to_responses(usage: &Usage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        input_tokens_details: (usage.cached_tokens > 0).then_some(ResponsesInputTokensDetails {
            cached_tokens: Some(usage.cached_tokens),
        }),
        output_tokens_details: (usage.reasoning_tokens > 0).then_some(
            ResponsesOutputTokensDetails {
                reasoning_tokens: Some(usage.reasoning_tokens),
            },
        ),
    }
}

fn typed_frame(event: &str, value: &ResponsesStreamEvent) -> SseFrame {
    SseFrame {
        event: Some(event.to_string()),
        data: serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Aggregator;

    fn frame(json: &str) -> SseFrame {
        SseFrame::data(json)
    }

    #[test]
    fn text_routed_by_indices() {
        let mut state = StreamState::default();
        let mut agg = Aggregator::new();
        let events = [
            r#"{"type":"response.created","response":{"id":"r","object":"response","created_at":1,"model":"m","output":[]}}"#,
            r#"{"type":"response.output_text.delta","item_id":"m0","output_index":0,"content_index":0,"delta":"foo"}"#,
            r#"{"type":"response.output_text.delta","item_id":"m0","output_index":0,"content_index":0,"delta":"bar"}"#,
            r#"{"type":"response.completed","response":{"id":"r","object":"response","created_at":1,"model":"m","output":[],"status":"completed","usage":{"input_tokens":2,"output_tokens":4,"total_tokens":6}}}"#,
        ];
        for event in events {
            for delta in parse_stream_event(&frame(event), &mut state).unwrap() {
                agg.push(&delta);
            }
        }
        assert!(agg.saw_done());
        let resp = agg.finish();
        assert_eq!(resp.text(), "foobar");
        assert_eq!(resp.usage.unwrap().total_tokens, 6);
    }

    #[test]
    fn done_payload_only_emits_unseen_suffix() {
        // Arguments arrive incrementally and then again complete via the
        // done event; the aggregate must not double up.
        let mut state = StreamState::default();
        let mut agg = Aggregator::new();
        let events = [
            r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc1","call_id":"call_1","name":"search","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","item_id":"fc1","output_index":0,"delta":"{\"q\":"}"#,
            r#"{"type":"response.function_call_arguments.done","item_id":"fc1","output_index":0,"arguments":"{\"q\":\"rust\"}"}"#,
            r#"{"type":"response.output_item.done","output_index":0,"item":{"type":"function_call","id":"fc1","call_id":"call_1","name":"search","arguments":"{\"q\":\"rust\"}"}}"#,
        ];
        for event in events {
            for delta in parse_stream_event(&frame(event), &mut state).unwrap() {
                agg.push(&delta);
            }
        }
        let resp = agg.finish();
        assert_eq!(resp.tool_calls(), vec![("call_1", "search", "{\"q\":\"rust\"}")]);
    }

    #[test]
    fn shorter_done_payload_is_ignored() {
        let mut state = StreamState::default();
        let mut agg = Aggregator::new();
        let events = [
            r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc1","call_id":"call_1","name":"f","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","item_id":"fc1","output_index":0,"delta":"{\"a\":1,\"b\":2}"}"#,
            r#"{"type":"response.function_call_arguments.done","item_id":"fc1","output_index":0,"arguments":"{}"}"#,
        ];
        for event in events {
            for delta in parse_stream_event(&frame(event), &mut state).unwrap() {
                agg.push(&delta);
            }
        }
        let resp = agg.finish();
        assert_eq!(resp.tool_calls()[0].2, "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn buffered_response_parses_output_items() {
        let body = br#"{"id":"r","object":"response","created_at":1,"model":"m","status":"completed","output":[{"type":"message","id":"m0","role":"assistant","content":[{"type":"output_text","text":"hi"}]},{"type":"function_call","call_id":"c1","name":"f","arguments":"{}"}],"usage":{"input_tokens":1,"output_tokens":2,"total_tokens":3}}"#;
        let resp = parse_response(body).unwrap();
        assert_eq!(resp.text(), "hi");
        assert_eq!(resp.tool_calls(), vec![("c1", "f", "{}")]);
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }
}
