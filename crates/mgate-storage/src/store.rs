use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, ExprTrait, QueryFilter, Schema,
};
use time::OffsetDateTime;

use crate::db::connect_shared;
use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// In-memory copies of the rows the relay runtime works from. The registry
/// and auth snapshots are rebuilt from these on refresh; the request path
/// itself never queries the database.
#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub name: String,
    pub family: String,
    pub base_url: String,
    pub credential: String,
    pub status: i32,
    pub priority: i32,
    pub weight: i32,
    pub models: String,
    pub model_rewrite: Option<serde_json::Value>,
    pub channel_groups: String,
    pub header_override: Option<serde_json::Value>,
    pub pass_through_errors: bool,
}

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub secret: String,
    pub remaining_quota: i64,
    pub shared_quota: bool,
    pub unlimited_quota: bool,
    pub token_groups: String,
    pub allowed_models: Option<serde_json::Value>,
    pub expires_at: Option<OffsetDateTime>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub user_group: String,
    pub remaining_quota: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AuthRows {
    pub tokens: Vec<TokenRow>,
    pub users: Vec<UserRow>,
}

#[derive(Debug, Clone)]
pub struct LogRecordInput {
    pub request_id: String,
    pub user_id: Option<i64>,
    pub token_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub first_channel_id: Option<i64>,
    pub dialect: String,
    pub model: String,
    pub is_stream: bool,
    pub status: String,
    pub error_kind: Option<String>,
    pub usage: mgate_common::Usage,
    pub quota_debited: i64,
    pub latency_ms: i64,
    pub frt_ms: Option<i64>,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogDetailInput {
    pub request_preview: String,
    pub request_full: String,
    pub response_preview: String,
    pub response_full: String,
}

#[derive(Clone)]
pub struct GatewayStore {
    db: DatabaseConnection,
}

impl GatewayStore {
    pub async fn connect(database_url: &str) -> Result<Self, sea_orm::DbErr> {
        let db = connect_shared(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync; no backend-specific DDL.
    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::Tokens)
            .register(entities::Channels)
            .register(entities::LogRecords)
            .register(entities::LogDetails)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    pub async fn health(&self) -> StorageResult<()> {
        entities::Channels::find().one(&self.db).await?;
        Ok(())
    }

    pub async fn load_channels(&self) -> StorageResult<Vec<ChannelRow>> {
        let rows = entities::Channels::find().all(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|row| ChannelRow {
                id: row.id,
                name: row.name,
                family: row.family,
                base_url: row.base_url,
                credential: row.credential,
                status: row.status,
                priority: row.priority,
                weight: row.weight,
                models: row.models,
                model_rewrite: row.model_rewrite,
                channel_groups: row.channel_groups,
                header_override: row.header_override,
                pass_through_errors: row.pass_through_errors,
            })
            .collect())
    }

    pub async fn load_auth(&self) -> StorageResult<AuthRows> {
        let tokens = entities::Tokens::find().all(&self.db).await?;
        let users = entities::Users::find().all(&self.db).await?;
        Ok(AuthRows {
            tokens: tokens
                .into_iter()
                .map(|row| TokenRow {
                    id: row.id,
                    user_id: row.user_id,
                    secret: row.secret,
                    remaining_quota: row.remaining_quota,
                    shared_quota: row.shared_quota,
                    unlimited_quota: row.unlimited_quota,
                    token_groups: row.token_groups,
                    allowed_models: row.allowed_models,
                    expires_at: row.expires_at,
                    enabled: row.enabled,
                })
                .collect(),
            users: users
                .into_iter()
                .map(|row| UserRow {
                    id: row.id,
                    user_group: row.user_group,
                    remaining_quota: row.remaining_quota,
                    enabled: row.enabled,
                })
                .collect(),
        })
    }

    /// Conditional decrement: subtract `amount` only while the balance
    /// covers it. Returns whether a row changed; callers retry or fail on
    /// false. This is the only quota mutation on the hot path, so there is
    /// no in-process lock held across IO.
    pub async fn try_debit_token(&self, token_id: i64, amount: i64) -> StorageResult<bool> {
        use entities::tokens::Column;
        let result = entities::Tokens::update_many()
            .col_expr(
                Column::RemainingQuota,
                Expr::col(Column::RemainingQuota).sub(amount).into(),
            )
            .filter(Column::Id.eq(token_id))
            .filter(Column::RemainingQuota.gte(amount))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn credit_token(&self, token_id: i64, amount: i64) -> StorageResult<()> {
        use entities::tokens::Column;
        entities::Tokens::update_many()
            .col_expr(
                Column::RemainingQuota,
                Expr::col(Column::RemainingQuota).add(amount).into(),
            )
            .filter(Column::Id.eq(token_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn try_debit_user(&self, user_id: i64, amount: i64) -> StorageResult<bool> {
        use entities::users::Column;
        let result = entities::Users::update_many()
            .col_expr(
                Column::RemainingQuota,
                Expr::col(Column::RemainingQuota).sub(amount).into(),
            )
            .filter(Column::Id.eq(user_id))
            .filter(Column::RemainingQuota.gte(amount))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn credit_user(&self, user_id: i64, amount: i64) -> StorageResult<()> {
        use entities::users::Column;
        entities::Users::update_many()
            .col_expr(
                Column::RemainingQuota,
                Expr::col(Column::RemainingQuota).add(amount).into(),
            )
            .filter(Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_channel_status(&self, channel_id: i64, status: i32) -> StorageResult<()> {
        use entities::channels::Column;
        entities::Channels::update_many()
            .col_expr(Column::Status, Expr::value(status).into())
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()).into())
            .filter(Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn touch_token(&self, token_id: i64) -> StorageResult<()> {
        use entities::tokens::Column;
        entities::Tokens::update_many()
            .col_expr(
                Column::LastUsedAt,
                Expr::value(Some(OffsetDateTime::now_utc())).into(),
            )
            .filter(Column::Id.eq(token_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// One record plus its optional paired detail row.
    pub async fn insert_log(
        &self,
        record: LogRecordInput,
        detail: Option<LogDetailInput>,
    ) -> StorageResult<i64> {
        let now = OffsetDateTime::now_utc();
        let active = entities::log_records::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::Set(now),
            request_id: ActiveValue::Set(record.request_id),
            user_id: ActiveValue::Set(record.user_id),
            token_id: ActiveValue::Set(record.token_id),
            channel_id: ActiveValue::Set(record.channel_id),
            first_channel_id: ActiveValue::Set(record.first_channel_id),
            dialect: ActiveValue::Set(record.dialect),
            model: ActiveValue::Set(record.model),
            is_stream: ActiveValue::Set(record.is_stream),
            status: ActiveValue::Set(record.status),
            error_kind: ActiveValue::Set(record.error_kind),
            prompt_tokens: ActiveValue::Set(record.usage.prompt_tokens),
            completion_tokens: ActiveValue::Set(record.usage.completion_tokens),
            cached_tokens: ActiveValue::Set(record.usage.cached_tokens),
            reasoning_tokens: ActiveValue::Set(record.usage.reasoning_tokens),
            image_tokens: ActiveValue::Set(record.usage.image_tokens),
            total_tokens: ActiveValue::Set(record.usage.total_tokens),
            quota_debited: ActiveValue::Set(record.quota_debited),
            latency_ms: ActiveValue::Set(record.latency_ms),
            frt_ms: ActiveValue::Set(record.frt_ms),
            client_ip: ActiveValue::Set(record.client_ip),
        };
        let inserted = entities::LogRecords::insert(active).exec(&self.db).await?;
        let record_id = inserted.last_insert_id;

        if let Some(detail) = detail {
            let active = entities::log_details::ActiveModel {
                id: ActiveValue::NotSet,
                created_at: ActiveValue::Set(now),
                record_id: ActiveValue::Set(record_id),
                request_preview: ActiveValue::Set(detail.request_preview),
                request_full: ActiveValue::Set(detail.request_full),
                response_preview: ActiveValue::Set(detail.response_preview),
                response_full: ActiveValue::Set(detail.response_full),
            };
            entities::LogDetails::insert(active).exec(&self.db).await?;
        }
        Ok(record_id)
    }
}
