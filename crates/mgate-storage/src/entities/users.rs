use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "user_name")]
    pub name: String,
    /// Channel-group tag deciding which channels this user's traffic may use.
    pub user_group: String,
    /// Shared quota pool for tokens marked shared, in micro-units.
    pub remaining_quota: i64,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub tokens: HasMany<super::tokens::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
