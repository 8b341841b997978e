use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Large payload row, 1:1 with `log_records`, deleted after the retention
/// window. `created_at` is indexed so the sweep's ranged scans stay cheap.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "log_details")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(indexed)]
    pub created_at: OffsetDateTime,
    #[sea_orm(unique_key = "log_detail_record")]
    pub record_id: i64,
    pub request_preview: String,
    pub request_full: String,
    pub response_preview: String,
    pub response_full: String,
    #[sea_orm(belongs_to, from = "record_id", to = "id", on_delete = "Cascade")]
    pub record: HasOne<super::log_records::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
