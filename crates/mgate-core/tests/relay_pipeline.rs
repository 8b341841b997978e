use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use mgate_core::dispatch::Dispatcher;
use mgate_core::ledger::{Ledger, MemoryQuotaStore, PriceTable, QuotaStore};
use mgate_core::relay::{InboundRequest, RelayController, RelayOptions, RelayResponse};
use mgate_core::transport::{UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse};
use mgate_core::{AuthSnapshot, ChannelRegistry, RelayConfig, RelayError, TokenAuth};
use mgate_dialect::Dialect;
use mgate_storage::{AuthRows, ChannelRow, TokenRow, UserRow};

#[derive(Clone)]
enum MockReply {
    Json(u16, String),
    Stream(Vec<String>),
}

struct MockUpstream {
    calls: Mutex<Vec<UpstreamRequest>>,
    replies: Mutex<Vec<MockReply>>,
}

impl MockUpstream {
    fn new(replies: Vec<MockReply>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(replies),
        })
    }

    fn calls(&self) -> Vec<UpstreamRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl UpstreamClient for MockUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, RelayError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(req);
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.len() > 1 {
                    replies.remove(0)
                } else {
                    replies[0].clone()
                }
            };
            match reply {
                MockReply::Json(status, body) => Ok(UpstreamResponse {
                    status,
                    headers: vec![(
                        "content-type".to_string(),
                        "application/json".to_string(),
                    )],
                    body: UpstreamBody::Bytes(Bytes::from(body)),
                }),
                MockReply::Stream(chunks) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(Bytes::from(chunk)).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: UpstreamBody::Stream(rx),
                    })
                }
            }
        })
    }
}

fn channel_row(id: i64, family: &str, base_url: &str, models: &str) -> ChannelRow {
    ChannelRow {
        id,
        name: format!("ch{id}"),
        family: family.to_string(),
        base_url: base_url.to_string(),
        credential: "sk-u".to_string(),
        status: 0,
        priority: 0,
        weight: 1,
        models: models.to_string(),
        model_rewrite: None,
        channel_groups: "default".to_string(),
        header_override: None,
        pass_through_errors: false,
    }
}

fn auth_rows() -> AuthRows {
    AuthRows {
        tokens: vec![TokenRow {
            id: 1,
            user_id: 10,
            secret: "u".to_string(),
            remaining_quota: 1_000_000,
            shared_quota: false,
            unlimited_quota: false,
            token_groups: "default".to_string(),
            allowed_models: None,
            expires_at: None,
            enabled: true,
        }],
        users: vec![UserRow {
            id: 10,
            user_group: "default".to_string(),
            remaining_quota: 0,
            enabled: true,
        }],
    }
}

struct Harness {
    controller: RelayController,
    upstream: Arc<MockUpstream>,
    quota: Arc<MemoryQuotaStore>,
}

fn harness(channels: Vec<ChannelRow>, balance: i64, replies: Vec<MockReply>) -> Harness {
    let upstream = MockUpstream::new(replies);
    let quota = Arc::new(MemoryQuotaStore::with_balance(1, balance));
    let quota_dyn: Arc<dyn QuotaStore> = quota.clone();
    let registry = Arc::new(ChannelRegistry::new(&channels, true, 1));
    let controller = RelayController::new(
        RelayConfig::default(),
        RelayOptions::default(),
        Arc::new(TokenAuth::new(AuthSnapshot::from_rows(&auth_rows()))),
        Dispatcher::new(registry, 3, Duration::from_secs(60)),
        Arc::new(Ledger::new(quota_dyn, PriceTable::default())),
        upstream.clone(),
        None,
    );
    Harness {
        controller,
        upstream,
        quota,
    }
}

fn inbound(dialect: Dialect, body: &str) -> InboundRequest {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer sk-u".parse().unwrap());
    InboundRequest {
        dialect,
        headers,
        body: Bytes::from(body.to_string()),
        path_model: None,
        stream_hint: false,
        client_ip: Some("127.0.0.1".to_string()),
    }
}

async fn collect_stream(mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> String {
    let mut out = String::new();
    while let Some(chunk) = rx.recv().await {
        out.push_str(&String::from_utf8_lossy(&chunk));
    }
    out
}

async fn wait_for_balance_change(quota: &MemoryQuotaStore, initial: i64) -> i64 {
    for _ in 0..100 {
        let balance = quota.balance(1);
        if balance != initial {
            return balance;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    quota.balance(1)
}

#[tokio::test]
async fn chat_non_streaming_single_channel() {
    // One OpenAI channel, buffered chat; upstream body returned
    // verbatim, usage taken from the upstream, quota settled.
    let upstream_body = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"hi there"},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#;
    let h = harness(
        vec![channel_row(1, "openai", "https://api.openai.com", "gpt-4o-mini")],
        1_000_000,
        vec![MockReply::Json(200, upstream_body.to_string())],
    );

    let request =
        r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"stream":false}"#;
    let response = h
        .controller
        .handle(inbound(Dialect::OpenAiChat, request))
        .await;

    let RelayResponse::Json { status, body, .. } = response else {
        panic!("expected buffered response");
    };
    assert_eq!(status, 200);
    assert_eq!(body, Bytes::from(upstream_body));

    let calls = h.upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://api.openai.com/v1/chat/completions");
    let auth = calls[0]
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.as_str());
    assert_eq!(auth, Some("Bearer sk-u"));

    // Default price table: prompt 2, completion 6 per token.
    assert_eq!(h.quota.balance(1), 1_000_000 - (2 * 1 + 6 * 2));
}

#[tokio::test]
async fn chat_stream_passthrough_and_settle() {
    // Streamed deltas forwarded in order, usage captured from the final
    // event, ledger settled after the stream closes.
    let chunks = vec![
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"A\"}}]}\n\n".to_string(),
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"B\"}}]}\n\n".to_string(),
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"C\"},\"finish_reason\":\"stop\"}]}\n\n".to_string(),
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":3,\"total_tokens\":4}}\n\n".to_string(),
        "data: [DONE]\n\n".to_string(),
    ];
    let h = harness(
        vec![channel_row(1, "openai", "https://api.openai.com", "gpt-4o-mini")],
        1_000_000,
        vec![MockReply::Stream(chunks)],
    );

    let request =
        r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
    let response = h
        .controller
        .handle(inbound(Dialect::OpenAiChat, request))
        .await;

    let RelayResponse::Stream { body, .. } = response else {
        panic!("expected stream response");
    };
    let wire = collect_stream(body).await;
    let a = wire.find("\"A\"").unwrap();
    let b = wire.find("\"B\"").unwrap();
    let c = wire.find("\"C\"").unwrap();
    assert!(a < b && b < c, "deltas out of order");
    assert!(wire.contains("[DONE]"));

    let balance = wait_for_balance_change(&h.quota, 1_000_000).await;
    assert_eq!(balance, 1_000_000 - (2 * 1 + 6 * 3));
}

#[tokio::test]
async fn exhausted_channels_refund_in_full() {
    // Both channels return 500, nothing further to try. Client sees a
    // 503 and the pre-charge comes back untouched.
    let h = harness(
        vec![
            channel_row(1, "openai", "https://a.example.com", "gpt-4o-mini"),
            channel_row(2, "openai", "https://b.example.com", "gpt-4o-mini"),
        ],
        1_000_000,
        vec![MockReply::Json(500, "{\"error\":\"boom\"}".to_string())],
    );

    let request =
        r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"stream":false}"#;
    let response = h
        .controller
        .handle(inbound(Dialect::OpenAiChat, request))
        .await;

    let RelayResponse::Json { status, .. } = response else {
        panic!("expected error response");
    };
    assert_eq!(status, 503);
    assert_eq!(h.upstream.calls().len(), 2);
    assert_eq!(h.quota.balance(1), 1_000_000);
}

#[tokio::test]
async fn anthropic_stream_translated_to_openai_chunks() {
    // Client speaks OpenAI, the channel is Anthropic-family. The codec
    // rewrites the request, parses content_block deltas, and re-emits
    // chat.completion.chunk events.
    let chunks = vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\",\"role\":\"assistant\",\"model\":\"claude-3-haiku\",\"content\":[],\"usage\":{\"input_tokens\":4}}}\n\n".to_string(),
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n".to_string(),
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n".to_string(),
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n".to_string(),
        "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n".to_string(),
        "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n".to_string(),
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string(),
    ];
    let h = harness(
        vec![channel_row(1, "claude", "https://api.anthropic.com", "claude-3-haiku")],
        1_000_000,
        vec![MockReply::Stream(chunks)],
    );

    let request =
        r#"{"model":"claude-3-haiku","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
    let response = h
        .controller
        .handle(inbound(Dialect::OpenAiChat, request))
        .await;

    let RelayResponse::Stream { body, .. } = response else {
        panic!("expected stream response");
    };
    let wire = collect_stream(body).await;

    // Client-side frames are OpenAI chunks, not Anthropic events.
    assert!(wire.contains("chat.completion.chunk"));
    assert!(!wire.contains("content_block_delta"));
    // Re-aggregating the emitted frames yields the upstream text.
    let mut text = String::new();
    for line in wire.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.trim() == "[DONE]" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data)
            && let Some(delta) = value["choices"][0]["delta"]["content"].as_str()
        {
            text.push_str(delta);
        }
    }
    assert_eq!(text, "Hello");

    let calls = h.upstream.calls();
    assert_eq!(calls[0].url, "https://api.anthropic.com/v1/messages");
    let api_key = calls[0]
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-api-key"))
        .map(|(_, value)| value.as_str());
    assert_eq!(api_key, Some("sk-u"));

    // Claude usage (4 in, 2 out) settles at the default rates.
    let balance = wait_for_balance_change(&h.quota, 1_000_000).await;
    assert_eq!(balance, 1_000_000 - (2 * 4 + 6 * 2));
}

#[tokio::test]
async fn header_hygiene_with_override_template() {
    // Credentials, hop-by-hop headers, and Connection-nominated headers
    // never reach the upstream; ordinary headers do, and override templates
    // resolve from the client's request.
    let upstream_body = r#"{"id":"c","object":"chat.completion","created":1,"model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"ok"},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#;
    let mut channel = channel_row(1, "openai", "https://api.openai.com", "gpt-4o-mini");
    channel.credential = "upstream-key".to_string();
    channel.header_override = Some(serde_json::json!({
        "X-Upstream-Trace": "{client_header:X-Trace-Id}"
    }));
    let h = harness(
        vec![channel],
        1_000_000,
        vec![MockReply::Json(200, upstream_body.to_string())],
    );

    let mut req = inbound(
        Dialect::OpenAiChat,
        r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#,
    );
    req.headers.insert("cookie", "s=1".parse().unwrap());
    req.headers
        .insert("connection", "X-Hop, keep-alive".parse().unwrap());
    req.headers.insert("x-hop", "1".parse().unwrap());
    req.headers.insert("x-trace-id", "t".parse().unwrap());

    let response = h.controller.handle(req).await;
    let RelayResponse::Json { status, .. } = response else {
        panic!("expected buffered response");
    };
    assert_eq!(status, 200);

    let calls = h.upstream.calls();
    let header = |name: &str| {
        calls[0]
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    assert_eq!(header("authorization").as_deref(), Some("Bearer upstream-key"));
    assert_eq!(header("x-trace-id").as_deref(), Some("t"));
    assert_eq!(header("x-upstream-trace").as_deref(), Some("t"));
    for stripped in ["cookie", "x-hop", "connection", "keep-alive"] {
        assert!(header(stripped).is_none(), "{stripped} leaked upstream");
    }
}

#[tokio::test]
async fn insufficient_quota_rejected_up_front() {
    let h = harness(
        vec![channel_row(1, "openai", "https://api.openai.com", "gpt-4o-mini")],
        3,
        vec![MockReply::Json(200, "{}".to_string())],
    );

    let request =
        r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"stream":false}"#;
    let response = h
        .controller
        .handle(inbound(Dialect::OpenAiChat, request))
        .await;

    let RelayResponse::Json { status, body, .. } = response else {
        panic!("expected error response");
    };
    assert_eq!(status, 402);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["code"], "insufficient_quota");
    // Nothing reached the upstream and nothing was debited.
    assert!(h.upstream.calls().is_empty());
    assert_eq!(h.quota.balance(1), 3);
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let h = harness(
        vec![channel_row(1, "openai", "https://api.openai.com", "gpt-4o-mini")],
        1_000,
        vec![MockReply::Json(200, "{}".to_string())],
    );
    let mut req = inbound(
        Dialect::OpenAiChat,
        r#"{"model":"gpt-4o-mini","messages":[]}"#,
    );
    req.headers
        .insert("authorization", "Bearer sk-wrong".parse().unwrap());
    let response = h.controller.handle(req).await;
    let RelayResponse::Json { status, .. } = response else {
        panic!("expected error response");
    };
    assert_eq!(status, 401);
}
