//! Anthropic messages codec: canonical <-> `/v1/messages` bodies and the
//! named-event stream.

use mgate_common::Usage;
use mgate_protocol::claude::{
    BlockDelta, ContentBlock, MessageContent, MessageDeltaBody, MessageParam, MessagesRequest,
    MessagesResponse, MessagesUsage, StreamEvent, StreamMessageStart, StreamUsage,
};
use mgate_protocol::sse::SseFrame;

use crate::canonical::{
    CanonicalResponse, ChatRequest, InboundMessage, MessagePart, Segment, StreamDelta,
};
use crate::codec::DialectError;

const DEFAULT_MAX_TOKENS: i64 = 4096;

pub fn decode_request(body: &[u8]) -> Result<ChatRequest, DialectError> {
    let req: MessagesRequest =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    if req.model.is_empty() {
        return Err(DialectError::Decode("missing model".to_string()));
    }

    let system = req.system.as_ref().map(system_text);
    let messages = req.messages.iter().map(decode_message).collect();

    Ok(ChatRequest {
        model: req.model,
        stream: req.stream.unwrap_or(false),
        messages,
        system,
        max_output_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences,
        tools: req
            .tools
            .as_ref()
            .map(|tools| serde_json::to_value(tools).unwrap_or(serde_json::Value::Null)),
        tool_choice: req.tool_choice,
        reasoning_effort: None,
    })
}

fn system_text(system: &serde_json::Value) -> String {
    match system {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn decode_message(message: &MessageParam) -> InboundMessage {
    let mut parts = Vec::new();
    match &message.content {
        MessageContent::Text(text) => parts.push(MessagePart::Text(text.clone())),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(MessagePart::Text(text.clone())),
                    ContentBlock::Thinking { thinking, .. } => {
                        parts.push(MessagePart::Reasoning(thinking.clone()))
                    }
                    ContentBlock::ToolUse { id, name, input } => parts.push(MessagePart::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => parts.push(MessagePart::ToolResult {
                        id: tool_use_id.clone(),
                        name: None,
                        content: content
                            .as_ref()
                            .map(tool_result_text)
                            .unwrap_or_default(),
                    }),
                    ContentBlock::Image { source } => {
                        if let Some(url) = source.get("url").and_then(|u| u.as_str()) {
                            parts.push(MessagePart::Image {
                                url: url.to_string(),
                            });
                        }
                    }
                    ContentBlock::Other(_) => {}
                }
            }
        }
    }
    InboundMessage {
        role: message.role.clone(),
        parts,
    }
}

fn tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub fn build_body(req: &ChatRequest, upstream_model: &str) -> Result<Vec<u8>, DialectError> {
    let messages = req.messages.iter().map(encode_message).collect();
    let body = MessagesRequest {
        model: upstream_model.to_string(),
        messages,
        max_tokens: req.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: req
            .system
            .as_ref()
            .map(|system| serde_json::Value::String(system.clone())),
        stream: req.stream.then_some(true),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop.clone(),
        tools: req.tools.as_ref().and_then(openai_tools_to_claude),
        tool_choice: None,
        thinking: None,
        metadata: None,
        extra: serde_json::Map::new(),
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

/// OpenAI tool definitions carry the schema under `function.parameters`;
/// Claude wants it flat under `input_schema`.
fn openai_tools_to_claude(
    tools: &serde_json::Value,
) -> Option<Vec<mgate_protocol::claude::ToolDef>> {
    let items = tools.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if let Some(function) = item.get("function") {
            out.push(mgate_protocol::claude::ToolDef {
                name: function.get("name")?.as_str()?.to_string(),
                description: function
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(|d| d.to_string()),
                input_schema: function.get("parameters").cloned(),
            });
        } else if let Some(name) = item.get("name").and_then(|n| n.as_str()) {
            out.push(mgate_protocol::claude::ToolDef {
                name: name.to_string(),
                description: item
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(|d| d.to_string()),
                input_schema: item.get("input_schema").cloned(),
            });
        }
    }
    (!out.is_empty()).then_some(out)
}

fn encode_message(message: &InboundMessage) -> MessageParam {
    let mut blocks = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text(text) => blocks.push(ContentBlock::Text { text: text.clone() }),
            MessagePart::Reasoning(text) => blocks.push(ContentBlock::Thinking {
                thinking: text.clone(),
                signature: None,
            }),
            MessagePart::ToolCall {
                id,
                name,
                arguments,
            } => blocks.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: serde_json::from_str(arguments)
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
            }),
            MessagePart::ToolResult { id, content, .. } => blocks.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: Some(serde_json::Value::String(content.clone())),
                is_error: None,
            }),
            MessagePart::Image { url } => blocks.push(ContentBlock::Image {
                source: serde_json::json!({ "type": "url", "url": url }),
            }),
        }
    }
    // Tool results must live in a user turn for Claude.
    let role = if message.role == "tool" {
        "user".to_string()
    } else {
        message.role.clone()
    };
    MessageParam {
        role,
        content: MessageContent::Blocks(blocks),
    }
}

pub fn parse_response(body: &[u8]) -> Result<CanonicalResponse, DialectError> {
    let resp: MessagesResponse =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    let mut out = CanonicalResponse {
        role: resp.role.clone(),
        finish_reason: resp.stop_reason.as_deref().map(stop_reason_to_finish),
        usage: Some(usage_from_claude(&resp.usage)),
        ..CanonicalResponse::default()
    };
    for block in &resp.content {
        match block {
            ContentBlock::Text { text } => out.segments.push(Segment::Text(text.clone())),
            ContentBlock::Thinking { thinking, .. } => {
                out.segments.push(Segment::Reasoning(thinking.clone()))
            }
            ContentBlock::ToolUse { id, name, input } => out.segments.push(Segment::ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
            }),
            other => out.segments.push(Segment::OpaqueJson {
                label: "claude_block".to_string(),
                payload: serde_json::to_value(other).unwrap_or(serde_json::Value::Null),
            }),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
struct BlockState {
    kind: BlockKind,
    tool_index: i64,
    json_buffer: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
enum BlockKind {
    #[default]
    Text,
    Thinking,
    ToolUse,
    Opaque,
}

/// Per-connection state for the Anthropic stream: content blocks keyed by
/// index, each tool-use block owning a partial-JSON buffer that is parsed at
/// `content_block_stop`.
#[derive(Debug, Default)]
pub struct StreamState {
    blocks: std::collections::HashMap<u32, BlockState>,
    next_tool_index: i64,
    usage: Usage,
    saw_usage: bool,
}

pub fn parse_stream_event(
    frame: &SseFrame,
    state: &mut StreamState,
) -> Result<Vec<StreamDelta>, DialectError> {
    let event: StreamEvent = match serde_json::from_str(&frame.data) {
        Ok(event) => event,
        Err(_) => return Ok(vec![StreamDelta::Ignore]),
    };

    let deltas = match event {
        StreamEvent::MessageStart { message } => {
            let mut deltas = vec![StreamDelta::Role(message.role)];
            if merge_stream_usage(&mut state.usage, &message.usage) {
                state.saw_usage = true;
                deltas.push(StreamDelta::UsageFinal(state.usage.with_totals()));
            }
            deltas
        }
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        } => {
            let mut deltas = Vec::new();
            let block = match content_block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        deltas.push(StreamDelta::Content(text));
                    }
                    BlockState {
                        kind: BlockKind::Text,
                        ..BlockState::default()
                    }
                }
                ContentBlock::Thinking { thinking, .. } => {
                    if !thinking.is_empty() {
                        deltas.push(StreamDelta::Reasoning(thinking));
                    }
                    BlockState {
                        kind: BlockKind::Thinking,
                        ..BlockState::default()
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    let tool_index = state.next_tool_index;
                    state.next_tool_index += 1;
                    let seed_args = match &input {
                        serde_json::Value::Object(map) if map.is_empty() => None,
                        serde_json::Value::Null => None,
                        other => serde_json::to_string(other).ok(),
                    };
                    deltas.push(StreamDelta::ToolCall {
                        index: tool_index,
                        id: Some(id),
                        name: Some(name),
                        arguments_fragment: seed_args,
                    });
                    BlockState {
                        kind: BlockKind::ToolUse,
                        tool_index,
                        json_buffer: String::new(),
                    }
                }
                _ => BlockState {
                    kind: BlockKind::Opaque,
                    ..BlockState::default()
                },
            };
            state.blocks.insert(index, block);
            if deltas.is_empty() {
                deltas.push(StreamDelta::Ignore);
            }
            deltas
        }
        StreamEvent::ContentBlockDelta { index, delta } => match delta {
            BlockDelta::TextDelta { text } => vec![StreamDelta::Content(text)],
            BlockDelta::ThinkingDelta { thinking } => vec![StreamDelta::Reasoning(thinking)],
            BlockDelta::InputJsonDelta { partial_json } => {
                let Some(block) = state.blocks.get_mut(&index) else {
                    return Ok(vec![StreamDelta::Ignore]);
                };
                block.json_buffer.push_str(&partial_json);
                vec![StreamDelta::ToolCall {
                    index: block.tool_index,
                    id: None,
                    name: None,
                    arguments_fragment: Some(partial_json),
                }]
            }
            BlockDelta::SignatureDelta { .. } | BlockDelta::Other(_) => {
                vec![StreamDelta::Ignore]
            }
        },
        StreamEvent::ContentBlockStop { index } => {
            // The buffered partial JSON must parse once the block closes;
            // a parse failure means the upstream truncated the arguments.
            if let Some(block) = state.blocks.get(&index)
                && block.kind == BlockKind::ToolUse
                && !block.json_buffer.is_empty()
                && serde_json::from_str::<serde_json::Value>(&block.json_buffer).is_err()
            {
                return Err(DialectError::Decode(format!(
                    "tool input for block {index} is not valid json at stop"
                )));
            }
            vec![StreamDelta::Ignore]
        }
        StreamEvent::MessageDelta { delta, usage } => {
            let mut deltas = Vec::new();
            if let Some(usage) = usage
                && merge_stream_usage(&mut state.usage, &usage)
            {
                state.saw_usage = true;
                deltas.push(StreamDelta::UsageFinal(state.usage.with_totals()));
            }
            if let Some(stop_reason) = delta.stop_reason {
                deltas.push(StreamDelta::FinishReason(stop_reason_to_finish(
                    &stop_reason,
                )));
            }
            if deltas.is_empty() {
                deltas.push(StreamDelta::Ignore);
            }
            deltas
        }
        StreamEvent::MessageStop => vec![StreamDelta::Done],
        StreamEvent::Ping | StreamEvent::Error { .. } | StreamEvent::Other(_) => {
            vec![StreamDelta::Ignore]
        }
    };
    Ok(deltas)
}

fn merge_stream_usage(base: &mut Usage, incoming: &StreamUsage) -> bool {
    let mut changed = false;
    if let Some(input) = incoming.input_tokens {
        base.prompt_tokens = input;
        changed = true;
    }
    if let Some(output) = incoming.output_tokens {
        base.completion_tokens = output;
        changed = true;
    }
    if let Some(cached) = incoming.cache_read_input_tokens {
        base.cached_tokens = cached;
        changed = true;
    }
    changed
}

fn stop_reason_to_finish(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

fn finish_to_stop_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EmitBlock {
    None,
    Text,
    Thinking,
    ToolUse(i64),
}

/// Emitter state for streaming to an Anthropic-dialect client. Tracks the
/// open content block so deltas of a different kind close it first.
#[derive(Debug)]
pub struct EmitState {
    model: String,
    message_id: String,
    started: bool,
    open: EmitBlock,
    next_index: u32,
    usage: Usage,
    finish_reason: Option<String>,
    stopped: bool,
}

impl EmitState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            open: EmitBlock::None,
            next_index: 0,
            usage: Usage::default(),
            finish_reason: None,
            stopped: false,
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<SseFrame>) {
        if self.started {
            return;
        }
        self.started = true;
        let start = StreamEvent::MessageStart {
            message: StreamMessageStart {
                id: self.message_id.clone(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                usage: StreamUsage::default(),
            },
        };
        frames.push(named_frame("message_start", &start));
    }

    fn close_open_block(&mut self, frames: &mut Vec<SseFrame>) {
        if self.open == EmitBlock::None {
            return;
        }
        let index = self.next_index - 1;
        frames.push(named_frame(
            "content_block_stop",
            &StreamEvent::ContentBlockStop { index },
        ));
        self.open = EmitBlock::None;
    }

    fn open_block(&mut self, block: ContentBlock, frames: &mut Vec<SseFrame>) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        frames.push(named_frame(
            "content_block_start",
            &StreamEvent::ContentBlockStart {
                index,
                content_block: block,
            },
        ));
        index
    }
}

pub fn emit_stream_delta(delta: &StreamDelta, state: &mut EmitState) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    match delta {
        StreamDelta::Ignore | StreamDelta::Role(_) => {}
        StreamDelta::Content(text) => {
            state.ensure_started(&mut frames);
            if state.open != EmitBlock::Text {
                state.close_open_block(&mut frames);
                state.open_block(
                    ContentBlock::Text {
                        text: String::new(),
                    },
                    &mut frames,
                );
                state.open = EmitBlock::Text;
            }
            frames.push(named_frame(
                "content_block_delta",
                &StreamEvent::ContentBlockDelta {
                    index: state.next_index - 1,
                    delta: BlockDelta::TextDelta { text: text.clone() },
                },
            ));
        }
        StreamDelta::Reasoning(text) => {
            state.ensure_started(&mut frames);
            if state.open != EmitBlock::Thinking {
                state.close_open_block(&mut frames);
                state.open_block(
                    ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    &mut frames,
                );
                state.open = EmitBlock::Thinking;
            }
            frames.push(named_frame(
                "content_block_delta",
                &StreamEvent::ContentBlockDelta {
                    index: state.next_index - 1,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: text.clone(),
                    },
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
            if state.open != EmitBlock::ToolUse(*index) {
                state.close_open_block(&mut frames);
                state.open_block(
                    ContentBlock::ToolUse {
                        id: id.clone().unwrap_or_else(|| format!("toolu_{index}")),
                        name: name.clone().unwrap_or_else(|| "tool".to_string()),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                    &mut frames,
                );
                state.open = EmitBlock::ToolUse(*index);
            }
            if let Some(fragment) = arguments_fragment
                && !fragment.is_empty()
            {
                frames.push(named_frame(
                    "content_block_delta",
                    &StreamEvent::ContentBlockDelta {
                        index: state.next_index - 1,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: fragment.clone(),
                        },
                    },
                ));
            }
        }
        StreamDelta::FinishReason(reason) => {
            state.finish_reason = Some(reason.clone());
        }
        StreamDelta::UsageFinal(usage) => {
            state.usage = *usage;
        }
        StreamDelta::Done => {
            state.ensure_started(&mut frames);
            state.close_open_block(&mut frames);
            if !state.stopped {
                state.stopped = true;
                let finish = state.finish_reason.as_deref().unwrap_or("stop");
                frames.push(named_frame(
                    "message_delta",
                    &StreamEvent::MessageDelta {
                        delta: MessageDeltaBody {
                            stop_reason: Some(finish_to_stop_reason(finish)),
                            stop_sequence: None,
                        },
                        usage: Some(StreamUsage {
                            input_tokens: Some(state.usage.prompt_tokens),
                            output_tokens: Some(state.usage.completion_tokens),
                            cache_read_input_tokens: (state.usage.cached_tokens > 0)
                                .then_some(state.usage.cached_tokens),
                            cache_creation_input_tokens: None,
                        }),
                    },
                ));
                frames.push(named_frame("message_stop", &StreamEvent::MessageStop));
            }
        }
    }
    frames
}

pub fn emit_stream_tail(state: &mut EmitState) -> Vec<SseFrame> {
    emit_stream_delta(&StreamDelta::Done, state)
}

pub fn emit_buffered(resp: &CanonicalResponse, model: &str) -> Result<Vec<u8>, DialectError> {
    let mut content = Vec::new();
    for segment in &resp.segments {
        match segment {
            Segment::Text(text) => content.push(ContentBlock::Text { text: text.clone() }),
            Segment::Reasoning(text) => content.push(ContentBlock::Thinking {
                thinking: text.clone(),
                signature: None,
            }),
            Segment::ToolCall {
                id,
                name,
                arguments,
            } => content.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: serde_json::from_str(arguments)
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
            }),
            Segment::ToolResult { id, content: c, .. } => content.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: Some(serde_json::Value::String(c.clone())),
                is_error: None,
            }),
            Segment::OpaqueJson { payload, .. } => {
                if let Ok(block) = serde_json::from_value::<ContentBlock>(payload.clone()) {
                    content.push(block);
                }
            }
        }
    }

    let usage = resp.usage.unwrap_or_default();
    let body = MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        kind: "message".to_string(),
        role: resp.role.clone(),
        model: model.to_string(),
        content,
        stop_reason: Some(finish_to_stop_reason(
            resp.finish_reason.as_deref().unwrap_or("stop"),
        )),
        stop_sequence: None,
        usage: MessagesUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: (usage.cached_tokens > 0).then_some(usage.cached_tokens),
            cache_creation_input_tokens: None,
        },
    };
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

pub fn usage_from_claude(usage: &MessagesUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        cached_tokens: usage.cache_read_input_tokens.unwrap_or(0),
        ..Usage::default()
    }
    .with_totals()
}

fn named_frame(event: &str, value: &StreamEvent) -> SseFrame {
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

    fn run(events: &[&str]) -> (Vec<StreamDelta>, StreamState) {
        let mut state = StreamState::default();
        let mut out = Vec::new();
        for event in events {
            out.extend(parse_stream_event(&frame(event), &mut state).unwrap());
        }
        (out, state)
    }

    #[test]
    fn text_delta_stream_aggregates() {
        let (deltas, _) = run(&[
            r#"{"type":"message_start","message":{"id":"msg_1","role":"assistant","model":"claude","content":[],"usage":{"input_tokens":9}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let mut agg = Aggregator::new();
        for delta in &deltas {
            agg.push(delta);
        }
        assert!(agg.saw_done());
        let resp = agg.finish();
        assert_eq!(resp.text(), "Hello");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        let usage = resp.usage.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (9, 2));
    }

    #[test]
    fn input_json_buffer_parsed_at_stop() {
        let (deltas, _) = run(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"search","input":{}}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"x\"}"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
        ]);
        let mut agg = Aggregator::new();
        for delta in &deltas {
            agg.push(delta);
        }
        let resp = agg.finish();
        assert_eq!(resp.tool_calls(), vec![("toolu_1", "search", "{\"q\":\"x\"}")]);
    }

    #[test]
    fn truncated_tool_json_is_an_error_at_stop() {
        let mut state = StreamState::default();
        for event in [
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t","name":"f","input":{}}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
        ] {
            parse_stream_event(&frame(event), &mut state).unwrap();
        }
        let result = parse_stream_event(&frame(r#"{"type":"content_block_stop","index":0}"#), &mut state);
        assert!(result.is_err());
    }

    #[test]
    fn thinking_delta_becomes_reasoning() {
        let (deltas, _) = run(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
        ]);
        assert!(deltas.contains(&StreamDelta::Reasoning("hmm".to_string())));
    }

    #[test]
    fn emit_to_claude_opens_and_closes_blocks() {
        let mut state = EmitState::new("claude-test");
        let mut frames = Vec::new();
        frames.extend(emit_stream_delta(
            &StreamDelta::Content("hi".to_string()),
            &mut state,
        ));
        frames.extend(emit_stream_delta(
            &StreamDelta::ToolCall {
                index: 0,
                id: Some("t1".to_string()),
                name: Some("f".to_string()),
                arguments_fragment: Some("{}".to_string()),
            },
            &mut state,
        ));
        frames.extend(emit_stream_delta(&StreamDelta::Done, &mut state));

        let names: Vec<&str> = frames
            .iter()
            .filter_map(|f| f.event.as_deref())
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }
}
