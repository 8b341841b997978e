use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use mgate_storage::{ChannelRow, GatewayStore};
use tracing::{info, warn};

use crate::channel::{Channel, ChannelStatus};
use crate::cooldown::CooldownMap;

#[derive(Debug, Default)]
pub struct ChannelSnapshot {
    pub channels: Vec<Arc<Channel>>,
}

/// Process-wide read-mostly channel view. Readers load the current snapshot
/// pointer; refresh, admin invalidation, and auto-disable publish new ones.
pub struct ChannelRegistry {
    snapshot: ArcSwap<ChannelSnapshot>,
    cooldowns: CooldownMap,
    auto_disable: bool,
    auto_disable_threshold: u32,
    fatal_counter: ArcSwap<std::collections::HashMap<i64, Arc<AtomicU32>>>,
}

impl ChannelRegistry {
    pub fn new(rows: &[ChannelRow], auto_disable: bool, auto_disable_threshold: u32) -> Self {
        let registry = Self {
            snapshot: ArcSwap::from_pointee(ChannelSnapshot::default()),
            cooldowns: CooldownMap::new(),
            auto_disable,
            auto_disable_threshold: auto_disable_threshold.max(1),
            fatal_counter: ArcSwap::from_pointee(std::collections::HashMap::new()),
        };
        registry.replace_from_rows(rows);
        registry
    }

    pub fn replace_from_rows(&self, rows: &[ChannelRow]) {
        let channels = rows
            .iter()
            .map(|row| Arc::new(Channel::from_row(row)))
            .collect();
        let counters = rows
            .iter()
            .map(|row| (row.id, Arc::new(AtomicU32::new(0))))
            .collect();
        self.snapshot.store(Arc::new(ChannelSnapshot { channels }));
        self.fatal_counter.store(Arc::new(counters));
    }

    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.load_full()
    }

    pub fn cooldowns(&self) -> &CooldownMap {
        &self.cooldowns
    }

    pub fn get(&self, channel_id: i64) -> Option<Arc<Channel>> {
        self.snapshot
            .load()
            .channels
            .iter()
            .find(|channel| channel.id == channel_id)
            .cloned()
    }

    /// The candidate set for one request: group-visible, serving the model,
    /// enabled, and not cooling down for this model.
    pub fn candidates(&self, model: &str, groups: &HashSet<String>) -> Vec<Arc<Channel>> {
        self.snapshot
            .load()
            .channels
            .iter()
            .filter(|channel| channel.status == ChannelStatus::Enabled)
            .filter(|channel| channel.in_any_group(groups))
            .filter(|channel| channel.serves_model(model))
            .filter(|channel| !self.cooldowns.is_cooling(channel.id, model))
            .cloned()
            .collect()
    }

    /// Every model the given groups can reach, for `GET /v1/models`.
    pub fn visible_models(&self, groups: &HashSet<String>) -> Vec<String> {
        let mut models: Vec<String> = self
            .snapshot
            .load()
            .channels
            .iter()
            .filter(|channel| channel.status == ChannelStatus::Enabled)
            .filter(|channel| channel.in_any_group(groups))
            .flat_map(|channel| channel.visible_models().map(|m| m.to_string()))
            .collect();
        models.sort();
        models.dedup();
        models
    }

    pub fn set_cooldown(&self, channel_id: i64, model: &str, ttl: Duration) {
        self.cooldowns.set(channel_id, model, ttl);
    }

    pub fn note_success(&self, channel_id: i64) {
        if let Some(counter) = self.fatal_counter.load().get(&channel_id) {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Record one fatal-channel error. When the consecutive count reaches
    /// the threshold and the auto-disable rule is on, the channel is marked
    /// auto-disabled in a fresh snapshot and the change is persisted
    /// best-effort by the caller-provided store.
    pub fn note_fatal(&self, channel_id: i64, store: Option<&GatewayStore>) -> bool {
        if !self.auto_disable {
            return false;
        }
        let Some(counter) = self.fatal_counter.load().get(&channel_id).cloned() else {
            return false;
        };
        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count < self.auto_disable_threshold {
            return false;
        }

        self.publish_status(channel_id, ChannelStatus::AutoDisabled);
        warn!(event = "channel_auto_disabled", channel_id, consecutive_fatal = count);
        if let Some(store) = store {
            let store = store.clone();
            tokio::spawn(async move {
                if let Err(err) = store
                    .set_channel_status(channel_id, ChannelStatus::AutoDisabled.as_i32())
                    .await
                {
                    warn!(event = "channel_status_persist_failed", channel_id, error = %err);
                }
            });
        }
        true
    }

    fn publish_status(&self, channel_id: i64, status: ChannelStatus) {
        self.snapshot.rcu(|current| {
            let channels = current
                .channels
                .iter()
                .map(|channel| {
                    if channel.id == channel_id {
                        let mut updated = (**channel).clone();
                        updated.status = status;
                        Arc::new(updated)
                    } else {
                        channel.clone()
                    }
                })
                .collect();
            Arc::new(ChannelSnapshot { channels })
        });
    }

    /// Periodic refresh loop: reload rows and publish until shutdown.
    pub async fn run_refresh(
        self: Arc<Self>,
        store: GatewayStore,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.load_channels().await {
                        Ok(rows) => {
                            self.replace_from_rows(&rows);
                            info!(event = "channel_refresh", channels = rows.len());
                        }
                        Err(err) => {
                            warn!(event = "channel_refresh_failed", error = %err);
                        }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, models: &str, groups: &str, status: i32) -> ChannelRow {
        ChannelRow {
            id,
            name: format!("ch{id}"),
            family: "openai".to_string(),
            base_url: "https://api.openai.com".to_string(),
            credential: "sk-test".to_string(),
            status,
            priority: 0,
            weight: 1,
            models: models.to_string(),
            model_rewrite: None,
            channel_groups: groups.to_string(),
            header_override: None,
            pass_through_errors: false,
        }
    }

    fn groups(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|tag| tag.to_string()).collect()
    }

    #[test]
    fn filtering_by_group_model_status() {
        let rows = vec![
            row(1, "gpt-4o", "default", 0),
            row(2, "gpt-4o", "vip", 0),
            row(3, "gpt-4o", "default", 1),
            row(4, "other", "default", 0),
        ];
        let registry = ChannelRegistry::new(&rows, true, 1);
        let candidates = registry.candidates("gpt-4o", &groups(&["default"]));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, 1);
    }

    #[test]
    fn cooldown_excludes_candidate() {
        let rows = vec![row(1, "gpt-4o", "default", 0)];
        let registry = ChannelRegistry::new(&rows, true, 1);
        registry.set_cooldown(1, "gpt-4o", Duration::from_secs(60));
        assert!(registry.candidates("gpt-4o", &groups(&["default"])).is_empty());
        // Other models on the same channel stay available.
        let rows = vec![row(1, "gpt-4o,gpt-4o-mini", "default", 0)];
        registry.replace_from_rows(&rows);
        registry.set_cooldown(1, "gpt-4o", Duration::from_secs(60));
        assert_eq!(
            registry.candidates("gpt-4o-mini", &groups(&["default"])).len(),
            1
        );
    }

    #[tokio::test]
    async fn auto_disable_publishes_new_snapshot() {
        let rows = vec![row(1, "gpt-4o", "default", 0)];
        let registry = ChannelRegistry::new(&rows, true, 2);
        assert!(!registry.note_fatal(1, None));
        assert!(!registry.candidates("gpt-4o", &groups(&["default"])).is_empty());
        assert!(registry.note_fatal(1, None));
        assert!(registry.candidates("gpt-4o", &groups(&["default"])).is_empty());
        assert_eq!(registry.get(1).unwrap().status, ChannelStatus::AutoDisabled);
    }

    #[tokio::test]
    async fn success_resets_fatal_count() {
        let rows = vec![row(1, "gpt-4o", "default", 0)];
        let registry = ChannelRegistry::new(&rows, true, 2);
        assert!(!registry.note_fatal(1, None));
        registry.note_success(1);
        assert!(!registry.note_fatal(1, None));
        assert_eq!(registry.get(1).unwrap().status, ChannelStatus::Enabled);
    }
}
