use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// Provider family tag: openai, claude, gemini, azure, bedrock, custom.
    pub family: String,
    pub base_url: String,
    /// Opaque credential material; comma-separated entries form a key pool.
    pub credential: String,
    /// 0 enabled, 1 manually disabled, 2 auto-disabled.
    pub status: i32,
    pub priority: i32,
    pub weight: i32,
    /// Comma-separated model names this channel serves.
    pub models: String,
    /// Optional JSON map client-model -> upstream-model.
    pub model_rewrite: Option<Json>,
    /// Comma-separated group tags.
    pub channel_groups: String,
    /// Optional JSON map of header name -> template string.
    pub header_override: Option<Json>,
    /// Forward upstream error bodies verbatim instead of normalising.
    pub pass_through_errors: bool,
    pub rpm_limit: Option<i32>,
    pub tpm_limit: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
