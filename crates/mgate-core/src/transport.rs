use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::HeaderMap;
use wreq::{Client, Method};

use crate::channel::{Channel, Family};
use crate::error::RelayError;
use mgate_common::ErrorKind;

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, RelayError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// wreq-backed transport, one client per distinct request timeout (the
/// builder pins the total timeout, and streaming requests use the longer
/// deadline).
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<u64, Client>>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn client_for_timeout(&self, timeout: Duration) -> Result<Client, RelayError> {
        let key = timeout.as_millis() as u64;
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| RelayError::internal("upstream client cache lock failed"))?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(timeout)
            .read_timeout(self.config.stream_idle_timeout)
            .build()
            .map_err(map_wreq_error)?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, RelayError>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client_for_timeout(req.timeout)?;
            let mut builder = client.request(req.method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }
            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamResponse, RelayError> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());
    let streamed = want_stream && (200..300).contains(&status) && looks_streamed(&headers);

    if !streamed {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(stream_idle_timeout, stream.next()).await;
            let Ok(item) = next else { break };
            let Some(item) = item else { break };
            let Ok(chunk) = item else { break };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

/// Streams announce themselves by media type or chunked transfer encoding.
fn looks_streamed(headers: &Headers) -> bool {
    let content_type = header_get(headers, "content-type").unwrap_or("");
    if content_type.starts_with("text/event-stream") {
        return true;
    }
    header_get(headers, "transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

// Timeouts, refused connections, and resets all retry on another channel.
fn map_wreq_error(err: wreq::Error) -> RelayError {
    RelayError::new(
        ErrorKind::ChannelRetryable,
        format!("upstream transport error: {err}"),
    )
}

/// End-to-end-incompatible headers that never cross the proxy boundary.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "api-key",
    "x-api-key",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "host",
    "content-length",
];

/// Pass-through header filter: drop credentials, hop-by-hop headers, and
/// everything the inbound `Connection` header nominated.
pub fn filter_inbound_headers(inbound: &HeaderMap) -> Headers {
    let mut connection_tokens: Vec<String> = Vec::new();
    for value in inbound.get_all("connection") {
        if let Ok(value) = value.to_str() {
            connection_tokens.extend(
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .filter(|token| !token.is_empty()),
            );
        }
    }

    let mut out = Vec::new();
    for (name, value) in inbound {
        let lowered = name.as_str().to_ascii_lowercase();
        if STRIPPED_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        if connection_tokens.contains(&lowered) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

/// OpenAI-family URL rule: a bare host gets `/v1/...` appended as-is, a base
/// with a path swallows the request's `/v1` prefix. Cloudflare AI-gateway
/// bases keep their full shape. Non-OpenAI families always append verbatim.
pub fn build_url(base_url: &str, request_path: &str, openai_rule: bool) -> String {
    let base = base_url.trim_end_matches('/');
    if !openai_rule {
        return format!("{base}{request_path}");
    }
    if base.contains("gateway.ai.cloudflare.com") {
        return format!("{base}{request_path}");
    }
    let has_path = base
        .splitn(4, '/')
        .nth(3)
        .is_some_and(|path| !path.is_empty());
    if has_path {
        let stripped = request_path.strip_prefix("/v1").unwrap_or(request_path);
        format!("{base}{stripped}")
    } else {
        format!("{base}{request_path}")
    }
}

/// Credential injection per provider family.
pub fn auth_headers(family: Family, key: &str) -> Headers {
    match family {
        Family::OpenAi | Family::Bedrock | Family::Custom => {
            vec![("Authorization".to_string(), format!("Bearer {key}"))]
        }
        Family::Claude => vec![
            ("x-api-key".to_string(), key.to_string()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ],
        Family::Gemini => vec![("x-goog-api-key".to_string(), key.to_string())],
        Family::Azure => vec![("api-key".to_string(), key.to_string())],
    }
}

/// Compose the final chat URL for one attempt. The Gemini plan path carries
/// `{model}`/`{action}` placeholders since its URL embeds both.
pub fn compose_chat_url(
    channel: &Channel,
    plan_path: &str,
    upstream_model: &str,
    is_stream: bool,
) -> String {
    let path = if plan_path.contains("{model}") {
        let action = if is_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut path = plan_path
            .replace("{model}", upstream_model)
            .replace("{action}", action);
        if is_stream {
            path.push_str("?alt=sse");
        }
        path
    } else {
        plan_path.to_string()
    };
    build_url(&channel.base_url, &path, channel.family.openai_url_rule())
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown header template placeholder: {{{0}}}")]
    UnknownPlaceholder(String),
}

/// Context for header-override template resolution. `client_headers` is
/// `None` during synthetic channel-test requests, where client-header
/// placeholders resolve to empty.
pub struct TemplateContext<'a> {
    pub client_headers: Option<&'a HeaderMap>,
    pub channel_key: &'a str,
    pub request_id: &'a str,
}

/// Placeholders are a small enumerated set; anything else is a
/// configuration error surfaced at channel validation, not at runtime.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    for placeholder in placeholders(template) {
        let known = placeholder == "channel_key"
            || placeholder == "request_id"
            || placeholder.starts_with("client_header:");
        if !known {
            return Err(TemplateError::UnknownPlaceholder(placeholder));
        }
    }
    Ok(())
}

pub fn resolve_template(template: &str, ctx: &TemplateContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let placeholder = &rest[start + 1..start + end];
        match placeholder {
            "channel_key" => out.push_str(ctx.channel_key),
            "request_id" => out.push_str(ctx.request_id),
            _ => {
                if let Some(header) = placeholder.strip_prefix("client_header:") {
                    if let Some(headers) = ctx.client_headers
                        && let Some(value) = headers.get(header)
                        && let Ok(value) = value.to_str()
                    {
                        out.push_str(value);
                    }
                    // Synthetic channel tests resolve client headers to empty.
                } else {
                    out.push('{');
                    out.push_str(placeholder);
                    out.push('}');
                }
            }
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    out
}

fn placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        out.push(rest[start + 1..start + end].to_string());
        rest = &rest[start + end + 1..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_rule_table() {
        // Bare host: suffix the request path untouched.
        assert_eq!(
            build_url("https://x", "/v1/z", true),
            "https://x/v1/z"
        );
        // Base with a path: strip the request's /v1.
        assert_eq!(build_url("https://x/y", "/v1/z", true), "https://x/y/z");
        // Non-OpenAI families never strip.
        assert_eq!(
            build_url("https://o/api", "/v1/z", false),
            "https://o/api/v1/z"
        );
        // Cloudflare gateway shape passes verbatim.
        assert_eq!(
            build_url(
                "https://gateway.ai.cloudflare.com/v1/acct/gw/openai",
                "/v1/chat/completions",
                true
            ),
            "https://gateway.ai.cloudflare.com/v1/acct/gw/openai/v1/chat/completions"
        );
        // Trailing slash on a bare host is not a path.
        assert_eq!(
            build_url("https://api.openai.com/", "/v1/chat/completions", true),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn header_filter_strips_credentials_and_hop_by_hop() {
        let mut inbound = HeaderMap::new();
        inbound.insert("authorization", "Bearer sk-client".parse().unwrap());
        inbound.insert("cookie", "s=1".parse().unwrap());
        inbound.insert("connection", "X-Hop, keep-alive".parse().unwrap());
        inbound.insert("x-hop", "1".parse().unwrap());
        inbound.insert("keep-alive", "timeout=5".parse().unwrap());
        inbound.insert("transfer-encoding", "chunked".parse().unwrap());
        inbound.insert("x-trace-id", "t".parse().unwrap());
        inbound.insert("accept", "application/json".parse().unwrap());

        let filtered = filter_inbound_headers(&inbound);
        let names: Vec<&str> = filtered.iter().map(|(name, _)| name.as_str()).collect();
        assert!(names.contains(&"x-trace-id"));
        assert!(names.contains(&"accept"));
        for stripped in [
            "authorization",
            "cookie",
            "connection",
            "x-hop",
            "keep-alive",
            "transfer-encoding",
        ] {
            assert!(!names.contains(&stripped), "{stripped} leaked through");
        }
    }

    #[test]
    fn template_resolution() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "t".parse().unwrap());
        let ctx = TemplateContext {
            client_headers: Some(&headers),
            channel_key: "sk-u",
            request_id: "req-1",
        };
        assert_eq!(
            resolve_template("{client_header:X-Trace-Id}", &ctx),
            "t"
        );
        assert_eq!(resolve_template("Bearer {channel_key}", &ctx), "Bearer sk-u");
        assert_eq!(resolve_template("{request_id}-suffix", &ctx), "req-1-suffix");

        // Channel-test context: client headers resolve to empty.
        let synthetic = TemplateContext {
            client_headers: None,
            channel_key: "sk-u",
            request_id: "req-2",
        };
        assert_eq!(resolve_template("{client_header:X-Trace-Id}", &synthetic), "");
    }

    #[test]
    fn template_validation() {
        assert!(validate_template("{channel_key}").is_ok());
        assert!(validate_template("{client_header:X-A}").is_ok());
        assert!(validate_template("{bogus}").is_err());
    }

    #[test]
    fn gemini_chat_url_patches_model_and_action() {
        let row = mgate_storage::ChannelRow {
            id: 1,
            name: "g".to_string(),
            family: "gemini".to_string(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            credential: "k".to_string(),
            status: 0,
            priority: 0,
            weight: 1,
            models: "gemini-pro".to_string(),
            model_rewrite: None,
            channel_groups: "default".to_string(),
            header_override: None,
            pass_through_errors: false,
        };
        let channel = Channel::from_row(&row);
        let url = compose_chat_url(&channel, "/v1beta/models/{model}:{action}", "gemini-pro", true);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn stream_detection() {
        let sse = vec![("content-type".to_string(), "text/event-stream; charset=utf-8".to_string())];
        assert!(looks_streamed(&sse));
        let chunked = vec![("transfer-encoding".to_string(), "Chunked".to_string())];
        assert!(looks_streamed(&chunked));
        let plain = vec![("content-type".to_string(), "application/json".to_string())];
        assert!(!looks_streamed(&plain));
    }
}
