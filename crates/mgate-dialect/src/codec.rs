//! Codec dispatch: the closed set of inbound dialects and upstream wire
//! protocols, with one entry point per codec operation. No trait objects;
//! the variants are explicit and finite, and each stream parser owns its
//! per-connection state bag.

use mgate_common::Usage;
use mgate_protocol::sse::SseFrame;

use crate::canonical::{CanonicalResponse, ChatRequest, StreamDelta};
use crate::{claude, gemini, misc, openai_chat, openai_responses};

#[derive(Debug, thiserror::Error)]
pub enum DialectError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// The dialect the client spoke on the inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    OpenAiChat,
    OpenAiCompletions,
    OpenAiEmbeddings,
    OpenAiImages,
    OpenAiAudioSpeech,
    OpenAiAudioTranscription,
    OpenAiAudioTranslation,
    OpenAiResponses,
    ClaudeMessages,
    GeminiGenerate,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAiChat => "openai.chat",
            Dialect::OpenAiCompletions => "openai.completions",
            Dialect::OpenAiEmbeddings => "openai.embeddings",
            Dialect::OpenAiImages => "openai.images",
            Dialect::OpenAiAudioSpeech => "openai.audio_speech",
            Dialect::OpenAiAudioTranscription => "openai.audio_transcription",
            Dialect::OpenAiAudioTranslation => "openai.audio_translation",
            Dialect::OpenAiResponses => "openai.responses",
            Dialect::ClaudeMessages => "claude.messages",
            Dialect::GeminiGenerate => "gemini.generate",
        }
    }

    /// Dialects that run through the canonical chat pipeline; the rest are
    /// relayed as model-rewritten passthrough.
    pub fn is_chat(&self) -> bool {
        matches!(
            self,
            Dialect::OpenAiChat
                | Dialect::OpenAiResponses
                | Dialect::ClaudeMessages
                | Dialect::GeminiGenerate
        )
    }
}

/// The wire protocol spoken with an upstream channel for chat traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    OpenAiChat,
    OpenAiResponses,
    Claude,
    Gemini,
}

/// A decoded inbound request, either canonical chat or an opaque non-chat
/// payload that is relayed with only the model rewritten.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Chat(ChatRequest),
    Passthrough {
        dialect: Dialect,
        model: String,
        stream: bool,
        body: serde_json::Value,
    },
    /// Multipart and other opaque bodies (audio uploads): forwarded verbatim.
    Opaque {
        dialect: Dialect,
        model: String,
        content_type: String,
        body: bytes::Bytes,
    },
}

impl RequestPayload {
    pub fn model(&self) -> &str {
        match self {
            RequestPayload::Chat(req) => &req.model,
            RequestPayload::Passthrough { model, .. } => model,
            RequestPayload::Opaque { model, .. } => model,
        }
    }

    pub fn stream(&self) -> bool {
        match self {
            RequestPayload::Chat(req) => req.stream,
            RequestPayload::Passthrough { stream, .. } => *stream,
            RequestPayload::Opaque { .. } => false,
        }
    }
}

/// Decode an inbound body in the given dialect. `path_model` carries the
/// model for dialects that put it in the URL (Gemini).
pub fn decode_request(
    dialect: Dialect,
    body: &[u8],
    path_model: Option<&str>,
    stream_hint: bool,
) -> Result<RequestPayload, DialectError> {
    match dialect {
        Dialect::OpenAiChat => openai_chat::decode_request(body).map(RequestPayload::Chat),
        Dialect::OpenAiResponses => {
            openai_responses::decode_request(body).map(RequestPayload::Chat)
        }
        Dialect::ClaudeMessages => claude::decode_request(body).map(RequestPayload::Chat),
        Dialect::GeminiGenerate => {
            let model = path_model
                .ok_or_else(|| DialectError::Decode("missing model in path".to_string()))?;
            gemini::decode_request(body, model, stream_hint).map(RequestPayload::Chat)
        }
        Dialect::OpenAiCompletions
        | Dialect::OpenAiEmbeddings
        | Dialect::OpenAiImages
        | Dialect::OpenAiAudioSpeech => misc::decode_passthrough(dialect, body),
        Dialect::OpenAiAudioTranscription | Dialect::OpenAiAudioTranslation => Err(
            DialectError::Unsupported("multipart bodies decode via RequestPayload::Opaque".into()),
        ),
    }
}

/// The upstream body plus the protocol-relative path for one chat attempt.
/// The transport layer composes the final URL from the channel base.
#[derive(Debug, Clone)]
pub struct UpstreamPlan {
    pub path: &'static str,
    pub body: Vec<u8>,
    pub is_stream: bool,
}

pub fn build_upstream_payload(
    proto: Proto,
    req: &ChatRequest,
    upstream_model: &str,
) -> Result<UpstreamPlan, DialectError> {
    let (path, body) = match proto {
        Proto::OpenAiChat => (
            "/v1/chat/completions",
            openai_chat::build_body(req, upstream_model)?,
        ),
        Proto::OpenAiResponses => (
            "/v1/responses",
            openai_responses::build_body(req, upstream_model)?,
        ),
        Proto::Claude => ("/v1/messages", claude::build_body(req, upstream_model)?),
        // The Gemini path embeds the model and action; the transport patches
        // the placeholders from the channel + stream flag.
        Proto::Gemini => ("/v1beta/models/{model}:{action}", gemini::build_body(req)?),
    };
    Ok(UpstreamPlan {
        path,
        body,
        is_stream: req.stream,
    })
}

pub fn parse_buffered_response(
    proto: Proto,
    body: &[u8],
) -> Result<CanonicalResponse, DialectError> {
    match proto {
        Proto::OpenAiChat => openai_chat::parse_response(body),
        Proto::OpenAiResponses => openai_responses::parse_response(body),
        Proto::Claude => claude::parse_response(body),
        Proto::Gemini => gemini::parse_response(body),
    }
}

/// Per-connection stream parser for one upstream protocol.
pub enum StreamParser {
    OpenAiChat(openai_chat::StreamState),
    OpenAiResponses(openai_responses::StreamState),
    Claude(claude::StreamState),
    Gemini(gemini::StreamState),
}

pub fn stream_parser_for(proto: Proto) -> StreamParser {
    match proto {
        Proto::OpenAiChat => StreamParser::OpenAiChat(openai_chat::StreamState),
        Proto::OpenAiResponses => {
            StreamParser::OpenAiResponses(openai_responses::StreamState::default())
        }
        Proto::Claude => StreamParser::Claude(claude::StreamState::default()),
        Proto::Gemini => StreamParser::Gemini(gemini::StreamState::default()),
    }
}

impl StreamParser {
    pub fn push_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamDelta>, DialectError> {
        match self {
            StreamParser::OpenAiChat(state) => openai_chat::parse_stream_event(frame, state),
            StreamParser::OpenAiResponses(state) => {
                openai_responses::parse_stream_event(frame, state)
            }
            StreamParser::Claude(state) => claude::parse_stream_event(frame, state),
            StreamParser::Gemini(state) => gemini::parse_stream_event(frame, state),
        }
    }
}

/// Client-side emitter for one inbound dialect.
pub enum Emitter {
    OpenAiChat(openai_chat::EmitState),
    OpenAiResponses(openai_responses::EmitState),
    Claude(claude::EmitState),
    Gemini(gemini::EmitState),
}

pub fn emitter_for(dialect: Dialect, model: &str, created: i64) -> Result<Emitter, DialectError> {
    match dialect {
        Dialect::OpenAiChat | Dialect::OpenAiCompletions => {
            Ok(Emitter::OpenAiChat(openai_chat::EmitState::new(model, created)))
        }
        Dialect::OpenAiResponses => Ok(Emitter::OpenAiResponses(
            openai_responses::EmitState::new(model, created),
        )),
        Dialect::ClaudeMessages => Ok(Emitter::Claude(claude::EmitState::new(model))),
        Dialect::GeminiGenerate => Ok(Emitter::Gemini(gemini::EmitState::new())),
        other => Err(DialectError::Unsupported(format!(
            "no stream emitter for {}",
            other.as_str()
        ))),
    }
}

impl Emitter {
    pub fn emit(&mut self, delta: &StreamDelta) -> Vec<SseFrame> {
        match self {
            Emitter::OpenAiChat(state) => openai_chat::emit_stream_delta(delta, state),
            Emitter::OpenAiResponses(state) => openai_responses::emit_stream_delta(delta, state),
            Emitter::Claude(state) => claude::emit_stream_delta(delta, state),
            Emitter::Gemini(state) => gemini::emit_stream_delta(delta, state),
        }
    }

    /// Terminal frames when the upstream ended without its own terminator.
    pub fn tail(&mut self) -> Vec<SseFrame> {
        match self {
            Emitter::OpenAiChat(state) => openai_chat::emit_stream_tail(state),
            Emitter::OpenAiResponses(state) => openai_responses::emit_stream_tail(state),
            Emitter::Claude(state) => claude::emit_stream_tail(state),
            Emitter::Gemini(state) => gemini::emit_stream_tail(state),
        }
    }

    pub fn content_type(&self) -> &'static str {
        "text/event-stream"
    }
}

pub fn emit_buffered_response(
    dialect: Dialect,
    resp: &CanonicalResponse,
    model: &str,
    created: i64,
) -> Result<Vec<u8>, DialectError> {
    match dialect {
        Dialect::OpenAiChat => openai_chat::emit_buffered(resp, model, created),
        Dialect::OpenAiResponses => openai_responses::emit_buffered(resp, model, created),
        Dialect::ClaudeMessages => claude::emit_buffered(resp, model),
        Dialect::GeminiGenerate => gemini::emit_buffered(resp),
        other => Err(DialectError::Unsupported(format!(
            "no buffered emitter for {}",
            other.as_str()
        ))),
    }
}

/// Extract reported usage from a passthrough (non-chat) response body.
pub fn passthrough_usage(dialect: Dialect, body: &[u8]) -> Option<Usage> {
    misc::extract_usage(dialect, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_dialect_stream_translation() {
        // A Claude upstream stream re-emitted as OpenAI chunks. Aggregated
        // output text must equal the concatenation of the text deltas.
        let upstream = [
            r#"{"type":"message_start","message":{"id":"m","role":"assistant","model":"claude-3","content":[],"usage":{"input_tokens":4}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"A"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"B"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            r#"{"type":"message_stop"}"#,
        ];

        let mut parser = stream_parser_for(Proto::Claude);
        let mut emitter = emitter_for(Dialect::OpenAiChat, "claude-3", 1).unwrap();
        let mut client_frames = Vec::new();
        for data in upstream {
            for delta in parser.push_frame(&SseFrame::data(data)).unwrap() {
                client_frames.extend(emitter.emit(&delta));
            }
        }

        // The client sees OpenAI chunks; re-aggregate them.
        let mut reparse = stream_parser_for(Proto::OpenAiChat);
        let mut agg = crate::canonical::Aggregator::new();
        for frame in &client_frames {
            for delta in reparse.push_frame(frame).unwrap() {
                agg.push(&delta);
            }
        }
        let resp = agg.finish();
        assert_eq!(resp.text(), "AB");
        assert!(agg.saw_done());
        let usage = resp.usage.unwrap();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (4, 2));
    }

    #[test]
    fn chat_plan_paths() {
        let req = ChatRequest {
            model: "m".to_string(),
            stream: true,
            messages: vec![crate::canonical::InboundMessage::text("user", "hi")],
            ..ChatRequest::default()
        };
        let plan = build_upstream_payload(Proto::OpenAiChat, &req, "m").unwrap();
        assert_eq!(plan.path, "/v1/chat/completions");
        assert!(plan.is_stream);
        let plan = build_upstream_payload(Proto::Claude, &req, "m").unwrap();
        assert_eq!(plan.path, "/v1/messages");
    }
}
