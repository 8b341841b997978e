use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use mgate_core::relay::{InboundRequest, RelayController, RelayResponse};
use mgate_dialect::Dialect;
use tokio_stream::wrappers::ReceiverStream;

pub fn relay_router(controller: Arc<RelayController>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(images))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/audio/translations", post(audio_translations))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route("/v1/models", get(list_models))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .with_state(controller)
}

async fn chat_completions(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(controller, Dialect::OpenAiChat, headers, body, None, false, addr).await
}

async fn completions(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(controller, Dialect::OpenAiCompletions, headers, body, None, false, addr).await
}

async fn embeddings(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(controller, Dialect::OpenAiEmbeddings, headers, body, None, false, addr).await
}

async fn images(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(controller, Dialect::OpenAiImages, headers, body, None, false, addr).await
}

async fn audio_speech(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(controller, Dialect::OpenAiAudioSpeech, headers, body, None, false, addr).await
}

async fn audio_transcriptions(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_opaque(controller, Dialect::OpenAiAudioTranscription, headers, body, addr).await
}

async fn audio_translations(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_opaque(controller, Dialect::OpenAiAudioTranslation, headers, body, addr).await
}

async fn responses(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(controller, Dialect::OpenAiResponses, headers, body, None, false, addr).await
}

async fn messages(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay(controller, Dialect::ClaudeMessages, headers, body, None, false, addr).await
}

/// Gemini puts both the model and the action in the last path segment:
/// `models/{model}:generateContent` or `:streamGenerateContent`. The API key
/// may arrive as a `?key=` query parameter instead of a header.
async fn gemini_generate(
    State(controller): State<Arc<RelayController>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(model_action): Path<String>,
    RawQuery(query): RawQuery,
    mut headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return plain_error(StatusCode::NOT_FOUND, "missing model action");
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return plain_error(StatusCode::NOT_FOUND, "unknown model action"),
    };
    if !headers.contains_key("x-goog-api-key")
        && let Some(key) = query_param(query.as_deref(), "key")
        && let Ok(value) = HeaderValue::from_str(&key)
    {
        headers.insert("x-goog-api-key", value);
    }
    relay(
        controller,
        Dialect::GeminiGenerate,
        headers,
        body,
        Some(model.to_string()),
        stream,
        addr,
    )
    .await
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for pair in query?.split('&') {
        if let Some((k, v)) = pair.split_once('=')
            && k == name
            && !v.is_empty()
        {
            return Some(v.to_string());
        }
    }
    None
}

/// Models visible through the presented token's groups.
async fn list_models(
    State(controller): State<Arc<RelayController>>,
    headers: HeaderMap,
) -> Response {
    match controller.list_models(&headers) {
        Ok(models) => {
            let list = mgate_protocol::openai::misc::ModelList {
                object: "list".to_string(),
                data: models
                    .into_iter()
                    .map(|model| mgate_protocol::openai::misc::ModelEntry::new(model, "mgate"))
                    .collect(),
            };
            json_response(
                StatusCode::OK,
                serde_json::to_vec(&list).unwrap_or_default().into(),
            )
        }
        Err(err) => json_response(err.status(), err.to_body(Dialect::OpenAiChat)),
    }
}

async fn relay(
    controller: Arc<RelayController>,
    dialect: Dialect,
    headers: HeaderMap,
    body: Bytes,
    path_model: Option<String>,
    stream_hint: bool,
    addr: SocketAddr,
) -> Response {
    let inbound = InboundRequest {
        dialect,
        headers,
        body,
        path_model,
        stream_hint,
        client_ip: Some(addr.ip().to_string()),
    };
    to_response(controller.handle(inbound).await)
}

/// Multipart audio uploads relay as opaque bodies.
async fn relay_opaque(
    controller: Arc<RelayController>,
    dialect: Dialect,
    headers: HeaderMap,
    body: Bytes,
    addr: SocketAddr,
) -> Response {
    let inbound = InboundRequest {
        dialect,
        headers,
        body,
        path_model: None,
        stream_hint: false,
        client_ip: Some(addr.ip().to_string()),
    };
    to_response(controller.handle_opaque(inbound).await)
}

fn to_response(relayed: RelayResponse) -> Response {
    match relayed {
        RelayResponse::Json {
            status,
            content_type,
            body,
        } => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            resp
        }
        RelayResponse::Stream {
            status,
            content_type,
            body,
        } => {
            let stream = ReceiverStream::new(body).map(Ok::<_, std::io::Error>);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            resp.headers_mut()
                .insert("cache-control", HeaderValue::from_static("no-cache"));
            resp
        }
    }
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": { "message": message, "type": "invalid_request_error" }
    });
    json_response(status, Bytes::from(body.to_string()))
}
