use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mgate_common::ErrorKind;
use mgate_storage::GatewayStore;
use rand::Rng;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::RelayError;
use crate::registry::ChannelRegistry;

pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    max_retries: u32,
    cooldown_ttl: Duration,
}

#[derive(Debug)]
pub struct DispatchOutcome<T> {
    pub value: T,
    pub channel: Arc<Channel>,
    pub first_channel_id: i64,
    pub attempts: u32,
}

impl Dispatcher {
    pub fn new(registry: Arc<ChannelRegistry>, max_retries: u32, cooldown_ttl: Duration) -> Self {
        Self {
            registry,
            max_retries: max_retries.max(1),
            cooldown_ttl,
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Run the attempt loop: pick a channel, try it, classify the failure,
    /// and move on until success, candidate exhaustion, attempt budget, or
    /// the wall-clock deadline.
    pub async fn dispatch<T, F, Fut>(
        &self,
        model: &str,
        groups: &HashSet<String>,
        deadline: Instant,
        store: Option<&GatewayStore>,
        mut attempt: F,
    ) -> Result<DispatchOutcome<T>, RelayError>
    where
        F: FnMut(Arc<Channel>, u32) -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let mut tried: HashSet<i64> = HashSet::new();
        let mut first_channel_id: Option<i64> = None;
        let mut last_error: Option<RelayError> = None;

        for attempt_no in 1..=self.max_retries {
            if Instant::now() >= deadline {
                break;
            }
            let candidates: Vec<Arc<Channel>> = self
                .registry
                .candidates(model, groups)
                .into_iter()
                .filter(|channel| !tried.contains(&channel.id))
                .collect();
            let Some(channel) = select_channel(&candidates) else {
                break;
            };
            first_channel_id.get_or_insert(channel.id);
            debug!(
                event = "dispatch_attempt",
                attempt = attempt_no,
                channel_id = channel.id,
                channel = %channel.name,
                model
            );

            match attempt(channel.clone(), attempt_no).await {
                Ok(value) => {
                    self.registry.note_success(channel.id);
                    return Ok(DispatchOutcome {
                        value,
                        channel,
                        first_channel_id: first_channel_id.unwrap_or_default(),
                        attempts: attempt_no,
                    });
                }
                Err(err) => {
                    tried.insert(channel.id);
                    match err.kind {
                        ErrorKind::ChannelRetryable => {
                            warn!(
                                event = "attempt_failed",
                                channel_id = channel.id,
                                kind = err.kind.as_str(),
                                error = %err.message
                            );
                            self.registry
                                .set_cooldown(channel.id, model, self.cooldown_ttl);
                            last_error = Some(err);
                        }
                        ErrorKind::ChannelFatal => {
                            warn!(
                                event = "attempt_failed",
                                channel_id = channel.id,
                                kind = err.kind.as_str(),
                                error = %err.message
                            );
                            self.registry.note_fatal(channel.id, store);
                            last_error = Some(err);
                        }
                        // Anything else is fatal for the whole request.
                        _ => return Err(err),
                    }
                }
            }
        }

        // Exhaustion surfaces as no_channel regardless of what the attempts
        // died of; the pre-charge is refunded and the client sees a 503.
        // The last upstream body rides along for the log and pass-through.
        Err(match last_error {
            Some(last) => {
                let mut err = RelayError::new(
                    ErrorKind::NoChannel,
                    format!("all channels failed for model {model}: {}", last.message),
                );
                err.upstream_body = last.upstream_body;
                err.upstream_status = last.upstream_status;
                err
            }
            None => RelayError::new(
                ErrorKind::NoChannel,
                format!("no available channel for model {model}"),
            ),
        })
    }
}

/// Highest-priority non-empty bucket, then weighted random within it.
/// All-zero weights fall back to uniform.
pub fn select_channel(candidates: &[Arc<Channel>]) -> Option<Arc<Channel>> {
    let top_priority = candidates.iter().map(|channel| channel.priority).max()?;
    let bucket: Vec<&Arc<Channel>> = candidates
        .iter()
        .filter(|channel| channel.priority == top_priority)
        .collect();
    let weights: Vec<u32> = bucket.iter().map(|channel| channel.weight).collect();
    let index = pick_weighted_index(&weights);
    bucket.get(index).map(|channel| (*channel).clone())
}

fn pick_weighted_index(weights: &[u32]) -> usize {
    if weights.is_empty() {
        return 0;
    }
    let total: u64 = weights.iter().map(|weight| u64::from(*weight)).sum();
    if total == 0 {
        return rand::rng().random_range(0..weights.len());
    }
    let mut roll = rand::rng().random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        let weight = u64::from(*weight);
        if roll < weight {
            return index;
        }
        roll -= weight;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgate_storage::ChannelRow;

    fn row(id: i64, priority: i32, weight: i32) -> ChannelRow {
        ChannelRow {
            id,
            name: format!("ch{id}"),
            family: "openai".to_string(),
            base_url: "https://api.openai.com".to_string(),
            credential: "sk-test".to_string(),
            status: 0,
            priority,
            weight,
            models: "gpt-4o".to_string(),
            model_rewrite: None,
            channel_groups: "default".to_string(),
            header_override: None,
            pass_through_errors: false,
        }
    }

    fn groups() -> HashSet<String> {
        ["default".to_string()].into_iter().collect()
    }

    fn registry(rows: &[ChannelRow]) -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry::new(rows, true, 1))
    }

    #[test]
    fn highest_priority_bucket_wins() {
        let rows = vec![row(1, 0, 100), row(2, 5, 1), row(3, 5, 1)];
        let registry = registry(&rows);
        let candidates = registry.candidates("gpt-4o", &groups());
        for _ in 0..50 {
            let picked = select_channel(&candidates).unwrap();
            assert!(picked.priority == 5, "low-priority channel selected");
        }
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let rows = vec![row(1, 0, 0), row(2, 0, 0)];
        let registry = registry(&rows);
        let candidates = registry.candidates("gpt-4o", &groups());
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(select_channel(&candidates).unwrap().id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn retry_moves_to_next_channel_and_cools_failed_one() {
        // Channel A fails retryably, B succeeds; A is cooled for the
        // model and A is still recorded as the first channel tried.
        let rows = vec![row(1, 5, 1), row(2, 0, 1)];
        let registry = registry(&rows);
        let dispatcher = Dispatcher::new(registry.clone(), 3, Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(5);

        let outcome = dispatcher
            .dispatch("gpt-4o", &groups(), deadline, None, |channel, _| async move {
                if channel.id == 1 {
                    Err(RelayError::new(ErrorKind::ChannelRetryable, "upstream 500"))
                } else {
                    Ok(channel.id)
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, 2);
        assert_eq!(outcome.channel.id, 2);
        assert_eq!(outcome.first_channel_id, 1);
        assert_eq!(outcome.attempts, 2);
        assert!(registry.cooldowns().is_cooling(1, "gpt-4o"));
    }

    #[tokio::test]
    async fn exhaustion_becomes_no_channel() {
        // Every candidate fails retryably and the set runs dry; the
        // client-facing outcome is no_channel, which refunds in full.
        let rows = vec![row(1, 0, 1), row(2, 0, 1)];
        let dispatcher = Dispatcher::new(registry(&rows), 5, Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = dispatcher
            .dispatch("gpt-4o", &groups(), deadline, None, |_, _| async {
                Err::<(), _>(RelayError::new(ErrorKind::ChannelRetryable, "upstream 500"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoChannel);
        assert!(err.kind.refundable());
        assert_eq!(err.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn empty_candidate_set_is_no_channel() {
        let dispatcher = Dispatcher::new(registry(&[]), 3, Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = dispatcher
            .dispatch("gpt-4o", &groups(), deadline, None, |_, _| async {
                Ok::<(), _>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoChannel);
    }

    #[tokio::test]
    async fn fatal_request_error_stops_immediately() {
        let rows = vec![row(1, 0, 1), row(2, 0, 1)];
        let dispatcher = Dispatcher::new(registry(&rows), 5, Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut attempts = 0;
        let err = dispatcher
            .dispatch("gpt-4o", &groups(), deadline, None, |_, _| {
                attempts += 1;
                async { Err::<(), _>(RelayError::invalid_request("bad body")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn fatal_channel_error_auto_disables_and_continues() {
        let rows = vec![row(1, 5, 1), row(2, 0, 1)];
        let registry = registry(&rows);
        let dispatcher = Dispatcher::new(registry.clone(), 3, Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(5);

        let outcome = dispatcher
            .dispatch("gpt-4o", &groups(), deadline, None, |channel, _| async move {
                if channel.id == 1 {
                    Err(RelayError::new(ErrorKind::ChannelFatal, "invalid api key"))
                } else {
                    Ok(channel.id)
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, 2);
        assert_eq!(
            registry.get(1).unwrap().status,
            crate::channel::ChannelStatus::AutoDisabled
        );
    }

    #[tokio::test]
    async fn deadline_stops_new_attempts() {
        let rows = vec![row(1, 0, 1), row(2, 0, 1), row(3, 0, 1)];
        let dispatcher = Dispatcher::new(registry(&rows), 10, Duration::from_secs(60));
        let deadline = Instant::now();
        let err = dispatcher
            .dispatch("gpt-4o", &groups(), deadline, None, |_, _| async {
                Ok::<(), _>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoChannel);
    }
}
