use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;

/// Transient `(channel, model)` blocklist with per-entry TTL. Sharded so the
/// dispatcher's per-candidate checks never contend on one lock; entries
/// expire lazily on read and are reaped when a shard is written.
#[derive(Debug)]
pub struct CooldownMap {
    shards: Vec<Mutex<HashMap<(i64, String), Instant>>>,
}

impl Default for CooldownMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownMap {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, channel_id: i64) -> &Mutex<HashMap<(i64, String), Instant>> {
        let index = (channel_id as u64 as usize) % SHARD_COUNT;
        &self.shards[index]
    }

    pub fn set(&self, channel_id: i64, model: &str, ttl: Duration) {
        let until = Instant::now() + ttl;
        let mut guard = match self.shard(channel_id).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        guard.retain(|_, expiry| *expiry > now);
        guard.insert((channel_id, model.to_string()), until);
    }

    pub fn is_cooling(&self, channel_id: i64, model: &str) -> bool {
        let guard = match self.shard(channel_id).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .get(&(channel_id, model.to_string()))
            .is_some_and(|until| *until > Instant::now())
    }

    pub fn clear(&self, channel_id: i64, model: &str) {
        let mut guard = match self.shard(channel_id).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(&(channel_id, model.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire() {
        let map = CooldownMap::new();
        map.set(1, "gpt-4o", Duration::from_millis(20));
        assert!(map.is_cooling(1, "gpt-4o"));
        assert!(!map.is_cooling(1, "gpt-4o-mini"));
        assert!(!map.is_cooling(2, "gpt-4o"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!map.is_cooling(1, "gpt-4o"));
    }

    #[test]
    fn clear_removes_entry() {
        let map = CooldownMap::new();
        map.set(3, "m", Duration::from_secs(60));
        assert!(map.is_cooling(3, "m"));
        map.clear(3, "m");
        assert!(!map.is_cooling(3, "m"));
    }
}
