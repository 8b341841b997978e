use mgate_common::{Usage, UsageAuthority};
use mgate_dialect::canonical::ChatRequest;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Dissent wider than this between reported and computed completion tokens
/// gets a log line; billing always takes the reported value.
const DISSENT_RATIO: f64 = 0.10;

/// Merge upstream-reported usage with locally computed numbers.
///
/// Reported wins whenever present. The computed path only exists so that
/// upstreams which omit usage still get billed deterministically.
pub fn reconcile(reported: Option<Usage>, computed: Option<Usage>) -> (Usage, UsageAuthority) {
    match (reported, computed) {
        (Some(reported), Some(computed)) => {
            note_dissent(&reported, &computed);
            (reported.with_totals(), UsageAuthority::Reconciled)
        }
        (Some(reported), None) => (reported.with_totals(), UsageAuthority::Reported),
        (None, Some(computed)) => (computed.with_totals(), UsageAuthority::Computed),
        (None, None) => (Usage::default(), UsageAuthority::Computed),
    }
}

fn note_dissent(reported: &Usage, computed: &Usage) {
    let reported_total = reported.completion_tokens.max(1) as f64;
    let delta = (reported.completion_tokens - computed.completion_tokens).abs() as f64;
    if delta / reported_total > DISSENT_RATIO {
        warn!(
            event = "usage_dissent",
            reported = reported.completion_tokens,
            computed = computed.completion_tokens
        );
    }
}

static CL100K: std::sync::OnceLock<Option<CoreBPE>> = std::sync::OnceLock::new();
static O200K: std::sync::OnceLock<Option<CoreBPE>> = std::sync::OnceLock::new();

/// Deterministic token counter: same (model, text) in, same count out. It
/// does not need to match the upstream tokeniser exactly, only to be stable
/// so billing is reproducible. Encoders are built once per process.
pub struct TokenCounter {
    bpe: Option<&'static CoreBPE>,
}

impl TokenCounter {
    pub fn for_model(model: &str) -> Self {
        let bpe = if uses_o200k(model) {
            O200K.get_or_init(|| tiktoken_rs::o200k_base().ok()).as_ref()
        } else {
            CL100K
                .get_or_init(|| tiktoken_rs::cl100k_base().ok())
                .as_ref()
        };
        Self { bpe }
    }

    pub fn count(&self, text: &str) -> i64 {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as i64,
            // Families without a published vocabulary get a stable
            // characters/4 approximation.
            None => {
                let n = text.chars().count() as i64;
                (n + 3) / 4
            }
        }
    }

    /// Prompt-side count: every message's text plus a small per-message
    /// framing constant, mirroring the chat-format overhead.
    pub fn count_prompt(&self, req: &ChatRequest) -> i64 {
        let mut total: i64 = 0;
        if let Some(system) = &req.system {
            total += self.count(system) + 4;
        }
        for message in &req.messages {
            total += self.count(&message.plain_text()) + 4;
        }
        total.max(1)
    }
}

fn uses_o200k(model: &str) -> bool {
    model.starts_with("gpt-4o")
        || model.starts_with("gpt-4.1")
        || model.starts_with("gpt-5")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
}

/// Compute fallback usage for a request/response pair without reported
/// numbers. Completion counts output text plus tool-call arguments plus
/// reasoning, per the canonical countable form.
pub fn compute_usage(req: &ChatRequest, countable_output: &str) -> Usage {
    let counter = TokenCounter::for_model(&req.model);
    let prompt_tokens = counter.count_prompt(req);
    let completion_tokens = if countable_output.is_empty() {
        0
    } else {
        counter.count(countable_output)
    };
    Usage {
        prompt_tokens,
        completion_tokens,
        ..Usage::default()
    }
    .with_totals()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgate_dialect::canonical::InboundMessage;

    fn usage(prompt: i64, completion: i64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            ..Usage::default()
        }
    }

    #[test]
    fn reported_wins() {
        let (merged, authority) = reconcile(Some(usage(10, 20)), Some(usage(11, 19)));
        assert_eq!(merged.prompt_tokens, 10);
        assert_eq!(merged.completion_tokens, 20);
        assert_eq!(authority, UsageAuthority::Reconciled);
    }

    #[test]
    fn computed_fills_gap() {
        let (merged, authority) = reconcile(None, Some(usage(5, 7)));
        assert_eq!(merged.total_tokens, 12);
        assert_eq!(authority, UsageAuthority::Computed);
    }

    #[test]
    fn counting_is_deterministic() {
        let req = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![InboundMessage::text("user", "hello world")],
            ..ChatRequest::default()
        };
        let first = compute_usage(&req, "some output text");
        let second = compute_usage(&req, "some output text");
        assert_eq!(first, second);
        assert!(first.prompt_tokens > 0);
        assert!(first.completion_tokens > 0);
        assert_eq!(
            first.total_tokens,
            first.prompt_tokens + first.completion_tokens
        );
    }

    #[test]
    fn empty_output_counts_zero_completion() {
        let req = ChatRequest {
            model: "unknown-model".to_string(),
            messages: vec![InboundMessage::text("user", "hi")],
            ..ChatRequest::default()
        };
        let usage = compute_usage(&req, "");
        assert_eq!(usage.completion_tokens, 0);
        assert!(usage.prompt_tokens > 0);
    }
}
