use bytes::Bytes;
use http::StatusCode;
use mgate_common::ErrorKind;
use mgate_dialect::Dialect;

/// The pipeline-wide error: a classified kind plus the message shown to the
/// client. Upstream error bodies are kept separately for the log and only
/// forwarded on pass-through channels.
#[derive(Debug, Clone)]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
    /// Verbatim upstream body, logged but not sent unless pass-through.
    pub upstream_body: Option<Bytes>,
    pub upstream_status: Option<u16>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_body: None,
            upstream_status: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_upstream(mut self, status: u16, body: Bytes) -> Self {
        self.upstream_status = Some(status);
        self.upstream_body = Some(body);
        self
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Render in the client's chosen dialect. The normalised message is used
    /// even when an upstream body is attached; pass-through is the caller's
    /// decision.
    pub fn to_body(&self, dialect: Dialect) -> Bytes {
        let body = match dialect {
            Dialect::ClaudeMessages => serde_json::to_vec(
                &mgate_protocol::claude::ErrorEnvelope::new(
                    claude_error_type(self.kind),
                    self.message.clone(),
                ),
            ),
            Dialect::GeminiGenerate => serde_json::to_vec(
                &mgate_protocol::gemini::ErrorEnvelope::new(
                    i64::from(self.kind.http_status()),
                    self.message.clone(),
                    gemini_status(self.kind),
                ),
            ),
            _ => serde_json::to_vec(&mgate_protocol::openai::error::ErrorEnvelope::new(
                self.message.clone(),
                openai_error_type(self.kind),
                Some(self.kind.as_str().to_string()),
            )),
        };
        body.map(Bytes::from).unwrap_or_else(|_| {
            Bytes::from_static(b"{\"error\":{\"message\":\"internal error\"}}")
        })
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for RelayError {}

fn openai_error_type(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "invalid_request_error",
        ErrorKind::Unauthorized => "authentication_error",
        ErrorKind::ForbiddenModel | ErrorKind::ForbiddenGroup => "permission_error",
        ErrorKind::InsufficientQuota => "insufficient_quota",
        ErrorKind::NoChannel | ErrorKind::ChannelRetryable | ErrorKind::ChannelFatal => {
            "upstream_error"
        }
        ErrorKind::ClientCancelled => "client_cancelled",
        ErrorKind::Internal => "api_error",
    }
}

fn claude_error_type(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "invalid_request_error",
        ErrorKind::Unauthorized => "authentication_error",
        ErrorKind::ForbiddenModel | ErrorKind::ForbiddenGroup => "permission_error",
        ErrorKind::InsufficientQuota => "billing_error",
        ErrorKind::NoChannel | ErrorKind::ChannelRetryable | ErrorKind::ChannelFatal => {
            "api_error"
        }
        ErrorKind::ClientCancelled => "api_error",
        ErrorKind::Internal => "api_error",
    }
}

fn gemini_status(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "INVALID_ARGUMENT",
        ErrorKind::Unauthorized => "UNAUTHENTICATED",
        ErrorKind::ForbiddenModel | ErrorKind::ForbiddenGroup => "PERMISSION_DENIED",
        ErrorKind::InsufficientQuota => "RESOURCE_EXHAUSTED",
        ErrorKind::NoChannel => "UNAVAILABLE",
        ErrorKind::ChannelRetryable | ErrorKind::ChannelFatal => "UNAVAILABLE",
        ErrorKind::ClientCancelled => "CANCELLED",
        ErrorKind::Internal => "INTERNAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_shape_for_openai_dialects() {
        let err = RelayError::new(ErrorKind::InsufficientQuota, "quota exhausted");
        let body = err.to_body(Dialect::OpenAiChat);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "insufficient_quota");
        assert_eq!(value["error"]["code"], "insufficient_quota");
        assert_eq!(err.status().as_u16(), 402);
    }

    #[test]
    fn claude_shape_for_messages_dialect() {
        let err = RelayError::unauthorized("bad key");
        let value: serde_json::Value =
            serde_json::from_slice(&err.to_body(Dialect::ClaudeMessages)).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["type"], "authentication_error");
    }

    #[test]
    fn gemini_shape_carries_grpc_status() {
        let err = RelayError::new(ErrorKind::NoChannel, "no candidates");
        let value: serde_json::Value =
            serde_json::from_slice(&err.to_body(Dialect::GeminiGenerate)).unwrap();
        assert_eq!(value["error"]["status"], "UNAVAILABLE");
        assert_eq!(value["error"]["code"], 503);
    }
}
