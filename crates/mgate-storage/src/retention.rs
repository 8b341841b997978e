//! Log-detail retention: a background loop that trims `log_details` rows
//! older than the configured window. Records in `log_records` are never
//! touched.
//!
//! The sweep selects candidate ids oldest-first in bounded batches and
//! deletes by id, which keeps one portable query shape across all three
//! backends and leans on the `created_at` index for the range scan.

use std::time::Duration;

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::entities;
use crate::store::{GatewayStore, StorageResult};

const BATCH_LIMIT: u64 = 5000;
const BATCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub batches: u64,
    pub deleted: u64,
}

pub struct RetentionSweeper {
    store: GatewayStore,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: GatewayStore, retention_days: u32, interval: Duration) -> Self {
        Self {
            store,
            retention: Duration::from_secs(u64::from(retention_days) * 86_400),
            interval,
        }
    }

    pub fn cutoff(&self, now: OffsetDateTime) -> OffsetDateTime {
        cutoff_for(now, self.retention)
    }

    /// Delete everything older than the cutoff, in batches with a pause
    /// between them so the store is never saturated.
    pub async fn sweep_once(&self, shutdown: &tokio::sync::watch::Receiver<bool>) -> StorageResult<SweepStats> {
        let cutoff = self.cutoff(OffsetDateTime::now_utc());
        let mut stats = SweepStats::default();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deleted = self.delete_batch(cutoff).await?;
            if deleted == 0 {
                break;
            }
            stats.batches += 1;
            stats.deleted += deleted;
            tokio::time::sleep(BATCH_PAUSE).await;
        }

        if stats.deleted > 0 {
            info!(
                event = "log_detail_sweep",
                deleted = stats.deleted,
                batches = stats.batches,
                cutoff = %cutoff
            );
        }
        Ok(stats)
    }

    async fn delete_batch(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        use entities::log_details::Column;

        let ids: Vec<i64> = entities::LogDetails::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::CreatedAt.lt(cutoff))
            .order_by_asc(Column::CreatedAt)
            .limit(BATCH_LIMIT)
            .into_tuple()
            .all(self.store.connection())
            .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let result = entities::LogDetails::delete_many()
            .filter(Column::Id.is_in(ids))
            .exec(self.store.connection())
            .await?;
        Ok(result.rows_affected)
    }

    /// Long-lived loop: one sweep per interval until shutdown flips.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once(&shutdown).await {
                        warn!(event = "log_detail_sweep_failed", error = %err);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn cutoff_for(now: OffsetDateTime, retention: Duration) -> OffsetDateTime {
    now - retention
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_honors_retention_window() {
        let retention = Duration::from_secs(7 * 86_400);
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let cutoff = cutoff_for(now, retention);
        assert_eq!(now - cutoff, retention);
        // Rows newer than the cutoff survive the sweep by construction.
        let survivor = now - Duration::from_secs(6 * 86_400);
        assert!(survivor > cutoff);
    }
}
