//! Inbound HTTP surface: the OpenAI-compatible superset plus the Anthropic-
//! and Gemini-native entry points, all funneling into the relay controller.

mod proxy;

pub use proxy::relay_router;
