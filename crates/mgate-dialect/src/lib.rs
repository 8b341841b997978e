//! Dialect codecs: translate between the wire dialects in `mgate-protocol`
//! and the canonical model the relay pipeline works with.
//!
//! Each provider family gets one codec covering four operations: build the
//! upstream request, parse a buffered response, parse one stream event into
//! canonical deltas, and emit canonical data in the client's dialect. The
//! codecs are pure; IO lives in `mgate-core`.

pub mod canonical;
pub mod claude;
pub mod codec;
pub mod gemini;
pub mod misc;
pub mod openai_chat;
pub mod openai_responses;

pub use canonical::{
    Aggregator, CanonicalResponse, ChatRequest, InboundMessage, MessagePart, Segment, StreamDelta,
};
pub use codec::{
    Dialect, DialectError, Emitter, Proto, RequestPayload, StreamParser, UpstreamPlan,
    build_upstream_payload, decode_request, emit_buffered_response, emitter_for,
    parse_buffered_response, passthrough_usage, stream_parser_for,
};
