//! Consumer management
//!
//! Plex polls `/consumer/:id`, `/livetv/sessions/:id`, `/Live/:id`, and
//! `/Transcode/:id` with opaque ids, sometimes before any tune request has
//! produced a real session. A consumer materializes on first mention,
//! refreshes on every poll, is adopted by a session when one is admitted for
//! the same id, and expires after an idle window otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Known only from polls; no session admitted yet.
    Pending,
    /// Adopted by an admitted session.
    Attached,
}

#[derive(Debug, Clone)]
struct ConsumerRecord {
    id: String,
    channel_id: Option<String>,
    /// Which endpoint first mentioned this id.
    origin: String,
    user_agent: Option<String>,
    created_at: Instant,
    last_activity: Instant,
    state: ConsumerState,
}

/// Public copy of a consumer's state.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub id: String,
    pub channel_id: Option<String>,
    pub origin: String,
    pub user_agent: Option<String>,
    pub state: ConsumerState,
    /// Seconds since the last poll.
    pub idle_secs: u64,
}

pub struct ConsumerManager {
    consumers: RwLock<HashMap<String, ConsumerRecord>>,
    idle_expiry: Duration,
}

impl ConsumerManager {
    pub fn new(idle_expiry: Duration) -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
            idle_expiry,
        }
    }

    /// Materialize-or-refresh: the single entry point every polling endpoint
    /// goes through.
    pub async fn touch(
        &self,
        id: &str,
        origin: &str,
        user_agent: Option<&str>,
    ) -> ConsumerSnapshot {
        let mut consumers = self.consumers.write().await;
        let now = Instant::now();
        let record = consumers.entry(id.to_string()).or_insert_with(|| {
            debug!(consumer_id = id, origin, "consumer materialized");
            ConsumerRecord {
                id: id.to_string(),
                channel_id: None,
                origin: origin.to_string(),
                user_agent: user_agent.map(str::to_string),
                created_at: now,
                last_activity: now,
                state: ConsumerState::Pending,
            }
        });
        record.last_activity = now;
        if record.user_agent.is_none() {
            record.user_agent = user_agent.map(str::to_string);
        }
        snapshot(record, now)
    }

    /// A session was admitted for this id; the consumer adopts its channel.
    pub async fn adopt(&self, id: &str, channel_id: &str) {
        let mut consumers = self.consumers.write().await;
        let now = Instant::now();
        let record = consumers.entry(id.to_string()).or_insert_with(|| ConsumerRecord {
            id: id.to_string(),
            channel_id: None,
            origin: "stream".to_string(),
            user_agent: None,
            created_at: now,
            last_activity: now,
            state: ConsumerState::Pending,
        });
        record.channel_id = Some(channel_id.to_string());
        record.state = ConsumerState::Attached;
        record.last_activity = now;
    }

    /// Detach after the owning session terminated. The consumer survives
    /// until idle expiry so trailing polls still resolve.
    pub async fn release(&self, id: &str) {
        if let Some(record) = self.consumers.write().await.get_mut(id) {
            record.state = ConsumerState::Pending;
        }
    }

    pub async fn get(&self, id: &str) -> Option<ConsumerSnapshot> {
        let consumers = self.consumers.read().await;
        let record = consumers.get(id)?;
        Some(snapshot(record, Instant::now()))
    }

    /// Whether this id is still considered alive.
    pub async fn is_alive(&self, id: &str) -> bool {
        let consumers = self.consumers.read().await;
        consumers
            .get(id)
            .is_some_and(|r| r.last_activity.elapsed() <= self.idle_expiry)
    }

    pub async fn remove(&self, id: &str) {
        self.consumers.write().await.remove(id);
    }

    pub async fn count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Expiry sweep: drop pending consumers idle past the window. Attached
    /// consumers are owned by their session's lifecycle.
    pub async fn expire_idle(&self) -> usize {
        let mut consumers = self.consumers.write().await;
        let before = consumers.len();
        consumers.retain(|_, record| {
            record.state == ConsumerState::Attached
                || record.last_activity.elapsed() <= self.idle_expiry
        });
        let removed = before - consumers.len();
        if removed > 0 {
            debug!(removed, "expired idle consumers");
        }
        removed
    }

    /// Background expiry task, swept at a fraction of the idle window.
    pub fn start_expiry_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let sweep = (manager.idle_expiry / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep);
            loop {
                interval.tick().await;
                manager.expire_idle().await;
            }
        })
    }
}

fn snapshot(record: &ConsumerRecord, now: Instant) -> ConsumerSnapshot {
    ConsumerSnapshot {
        id: record.id.clone(),
        channel_id: record.channel_id.clone(),
        origin: record.origin.clone(),
        user_agent: record.user_agent.clone(),
        state: record.state,
        idle_secs: now.duration_since(record.last_activity).as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consumers_materialize_on_first_poll() {
        let manager = ConsumerManager::new(Duration::from_secs(120));
        assert!(manager.get("abc").await.is_none());

        let snap = manager.touch("abc", "livetv_sessions", Some("Plex/1.0")).await;
        assert_eq!(snap.state, ConsumerState::Pending);
        assert_eq!(snap.origin, "livetv_sessions");
        assert!(manager.is_alive("abc").await);
    }

    #[tokio::test]
    async fn origin_records_first_mention_only() {
        let manager = ConsumerManager::new(Duration::from_secs(120));
        manager.touch("abc", "consumer", None).await;
        let snap = manager.touch("abc", "livetv_sessions", None).await;
        assert_eq!(snap.origin, "consumer");
    }

    #[tokio::test]
    async fn adoption_attaches_channel() {
        let manager = ConsumerManager::new(Duration::from_secs(120));
        manager.touch("abc", "consumer", None).await;
        manager.adopt("abc", "ch-1").await;

        let snap = manager.get("abc").await.unwrap();
        assert_eq!(snap.state, ConsumerState::Attached);
        assert_eq!(snap.channel_id.as_deref(), Some("ch-1"));
    }

    #[tokio::test]
    async fn idle_pending_consumers_expire() {
        let manager = ConsumerManager::new(Duration::from_millis(20));
        manager.touch("gone", "consumer", None).await;
        manager.touch("kept", "consumer", None).await;
        manager.adopt("kept", "ch-1").await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = manager.expire_idle().await;
        assert_eq!(removed, 1);
        assert!(manager.get("gone").await.is_none());
        assert!(manager.get("kept").await.is_some());
        assert!(!manager.is_alive("gone").await);
    }
}
