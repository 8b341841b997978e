use serde::{Deserialize, Serialize};

/// Canonical token usage for one relayed request.
///
/// Upstreams report some subset of these; the reconciler fills in the rest.
/// `total_tokens` is at least `prompt_tokens + completion_tokens` whenever
/// all three are known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub image_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    pub fn with_totals(mut self) -> Self {
        let floor = self.prompt_tokens + self.completion_tokens;
        if self.total_tokens < floor {
            self.total_tokens = floor;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Where the usage numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageAuthority {
    /// The upstream reported them.
    Reported,
    /// Computed locally by tokenising request and response text.
    Computed,
    /// Both were available; reported values were preferred.
    Reconciled,
}

/// One error family across the whole relay pipeline.
///
/// The kind decides the client status, whether the pre-charge is refunded,
/// and whether the dispatcher keeps trying other channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    Unauthorized,
    ForbiddenModel,
    ForbiddenGroup,
    InsufficientQuota,
    NoChannel,
    ChannelRetryable,
    ChannelFatal,
    ClientCancelled,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::InsufficientQuota => 402,
            ErrorKind::ForbiddenModel | ErrorKind::ForbiddenGroup => 403,
            ErrorKind::NoChannel => 503,
            ErrorKind::ChannelRetryable | ErrorKind::ChannelFatal => 502,
            ErrorKind::ClientCancelled => 499,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether the dispatcher may move on to another channel.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::ChannelRetryable | ErrorKind::ChannelFatal)
    }

    /// Whether a held pre-charge is returned in full.
    pub fn refundable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoChannel | ErrorKind::Internal | ErrorKind::ChannelRetryable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ForbiddenModel => "forbidden_model",
            ErrorKind::ForbiddenGroup => "forbidden_group",
            ErrorKind::InsufficientQuota => "insufficient_quota",
            ErrorKind::NoChannel => "no_channel",
            ErrorKind::ChannelRetryable => "channel_retryable",
            ErrorKind::ChannelFatal => "channel_fatal",
            ErrorKind::ClientCancelled => "client_cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Terminal status recorded on a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Ok,
    PartiallyDelivered,
    Failed,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Ok => "ok",
            RelayStatus::PartiallyDelivered => "partially_delivered",
            RelayStatus::Failed => "failed",
        }
    }

    /// Statuses that count toward quota conservation.
    pub fn billable(&self) -> bool {
        matches!(self, RelayStatus::Ok | RelayStatus::PartiallyDelivered)
    }
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_floor() {
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 0,
            ..Usage::default()
        }
        .with_totals();
        assert_eq!(usage.total_tokens, 15);

        let reported = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 20,
            ..Usage::default()
        }
        .with_totals();
        assert_eq!(reported.total_tokens, 20);
    }

    #[test]
    fn error_kind_semantics() {
        assert!(ErrorKind::ChannelRetryable.retryable());
        assert!(ErrorKind::ChannelFatal.retryable());
        assert!(!ErrorKind::InvalidRequest.retryable());
        assert!(ErrorKind::NoChannel.refundable());
        assert!(!ErrorKind::ClientCancelled.refundable());
        assert_eq!(ErrorKind::InsufficientQuota.http_status(), 402);
    }
}
