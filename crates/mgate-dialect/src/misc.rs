//! Non-chat payload handling: legacy completions, embeddings, images, and
//! audio relay as model-rewritten passthrough. The body keeps its original
//! shape; only the model field is mapped and usage is extracted from the
//! response for metering.

use mgate_common::Usage;
use serde_json::Value;

use crate::codec::{Dialect, DialectError, RequestPayload};

pub fn decode_passthrough(dialect: Dialect, body: &[u8]) -> Result<RequestPayload, DialectError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| DialectError::Decode(err.to_string()))?;
    let model = value
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| DialectError::Decode("missing model".to_string()))?
        .to_string();
    let stream = value
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    Ok(RequestPayload::Passthrough {
        dialect,
        model,
        stream,
        body: value,
    })
}

/// Rewrite the model field for the upstream and re-serialise.
pub fn rewrite_model(body: &Value, upstream_model: &str) -> Result<Vec<u8>, DialectError> {
    let mut body = body.clone();
    if let Some(object) = body.as_object_mut() {
        object.insert(
            "model".to_string(),
            Value::String(upstream_model.to_string()),
        );
    }
    serde_json::to_vec(&body).map_err(|err| DialectError::Encode(err.to_string()))
}

pub fn upstream_path(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::OpenAiCompletions => "/v1/completions",
        Dialect::OpenAiEmbeddings => "/v1/embeddings",
        Dialect::OpenAiImages => "/v1/images/generations",
        Dialect::OpenAiAudioSpeech => "/v1/audio/speech",
        Dialect::OpenAiAudioTranscription => "/v1/audio/transcriptions",
        Dialect::OpenAiAudioTranslation => "/v1/audio/translations",
        // Chat dialects have their own plans; this is never asked of them.
        _ => "/v1/chat/completions",
    }
}

/// Pull reported usage out of a passthrough response body, when present.
pub fn extract_usage(dialect: Dialect, body: &[u8]) -> Option<Usage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let total = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let image_tokens = match dialect {
        Dialect::OpenAiImages => usage
            .get("output_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        _ => 0,
    };
    Some(
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            image_tokens,
            ..Usage::default()
        }
        .with_totals(),
    )
}

/// Billable image count for generation requests without reported usage.
pub fn image_count(body: &Value) -> i64 {
    body.get("n").and_then(|n| n.as_i64()).unwrap_or(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_passthrough_decodes_model() {
        let body = br#"{"model":"text-embedding-3-small","input":["a","b"]}"#;
        let payload = decode_passthrough(Dialect::OpenAiEmbeddings, body).unwrap();
        assert_eq!(payload.model(), "text-embedding-3-small");
        assert!(!payload.stream());
    }

    #[test]
    fn model_rewrite_preserves_rest() {
        let body: Value = serde_json::json!({"model":"a","input":"x","dimensions":64});
        let rewritten = rewrite_model(&body, "b").unwrap();
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "b");
        assert_eq!(value["dimensions"], 64);
    }

    #[test]
    fn usage_extraction_handles_both_namings() {
        let openai = br#"{"usage":{"prompt_tokens":7,"total_tokens":7}}"#;
        let usage = extract_usage(Dialect::OpenAiEmbeddings, openai).unwrap();
        assert_eq!(usage.prompt_tokens, 7);

        let responses_style = br#"{"usage":{"input_tokens":3,"output_tokens":5}}"#;
        let usage = extract_usage(Dialect::OpenAiImages, responses_style).unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.image_tokens, 5);
        assert_eq!(usage.total_tokens, 8);
    }
}
