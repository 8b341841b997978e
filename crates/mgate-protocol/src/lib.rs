//! Wire types for the dialects mgate speaks, plus the SSE parser.
//!
//! This crate holds serde structs only; no IO and no HTTP types. Codecs in
//! `mgate-dialect` translate between these shapes and the canonical model.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;
