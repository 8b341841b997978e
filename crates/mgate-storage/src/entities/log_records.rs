use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Small, kept long-term. The paired payload row lives in `log_details` and
/// is trimmed by the retention sweep.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "log_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: OffsetDateTime,
    #[sea_orm(unique_key = "log_request_id")]
    pub request_id: String,
    pub user_id: Option<i64>,
    pub token_id: Option<i64>,
    /// Channel that produced the final outcome.
    pub channel_id: Option<i64>,
    /// Channel tried first, recorded even when a retry succeeded elsewhere.
    pub first_channel_id: Option<i64>,
    pub dialect: String,
    pub model: String,
    pub is_stream: bool,
    pub status: String,
    pub error_kind: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub image_tokens: i64,
    pub total_tokens: i64,
    /// Micro-units actually settled against the quota pool.
    pub quota_debited: i64,
    pub latency_ms: i64,
    /// First-response-time: accept to first byte toward the client.
    pub frt_ms: Option<i64>,
    pub client_ip: Option<String>,
    #[sea_orm(has_many)]
    pub details: HasMany<super::log_details::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
