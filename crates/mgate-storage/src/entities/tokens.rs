use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    /// The presented credential, without the `sk-` prefix.
    #[sea_orm(unique_key = "token_secret")]
    pub secret: String,
    pub name: Option<String>,
    /// Isolated quota pool, in micro-units. Ignored when `shared_quota`.
    pub remaining_quota: i64,
    /// Bill against the owning user's pool instead of this token's.
    pub shared_quota: bool,
    pub unlimited_quota: bool,
    /// Comma-separated group tags this token may route through.
    pub token_groups: String,
    /// Optional JSON array of allowed model names.
    pub allowed_models: Option<Json>,
    pub expires_at: Option<OffsetDateTime>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
