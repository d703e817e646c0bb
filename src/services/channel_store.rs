//! Channel store collaborator contract
//!
//! Channels and streams are created by the importer/admin surface; the core
//! only reads them. The in-memory implementation is seeded from a TOML file
//! in the data directory and doubles as the test fixture store.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::models::{Channel, ChannelStream};

/// Read-only channel access for the streaming core.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Look up a channel by its stable id, enabled or not.
    async fn get(&self, id: &str) -> Option<Channel>;

    /// Look up an enabled channel by its human number.
    async fn get_by_number(&self, number: u16) -> Option<Channel>;

    /// Enabled channels that have at least one enabled stream, ordered by
    /// channel number.
    async fn list_enabled(&self) -> Vec<Channel>;

    /// The first enabled stream of a channel, if any.
    async fn enabled_stream(&self, channel_id: &str) -> Option<ChannelStream>;
}

#[derive(Debug, Default, Deserialize)]
struct ChannelFile {
    #[serde(default)]
    channels: Vec<Channel>,
    #[serde(default)]
    streams: Vec<ChannelStream>,
}

#[derive(Default)]
struct StoreInner {
    channels: HashMap<String, Channel>,
    streams: HashMap<String, Vec<ChannelStream>>,
}

/// In-memory channel store seeded from `channels.toml`.
pub struct InMemoryChannelStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryChannelStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
        }
    }

    /// Load the channel database from `<data_dir>/channels.toml`, retrying
    /// up to `retries` times. A missing file is not fatal (empty lineup);
    /// a malformed one after the retry budget is.
    pub async fn load_from_dir(data_dir: &Path, retries: u32) -> AppResult<Self> {
        let path = data_dir.join("channels.toml");
        if !path.exists() {
            info!("No channel database at {}, starting with an empty lineup", path.display());
            return Ok(Self::new());
        }

        let mut last_error = None;
        for attempt in 1..=retries.max(1) {
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match toml::from_str::<ChannelFile>(&raw) {
                    Ok(file) => {
                        let store = Self::new();
                        store.replace(file.channels, file.streams).await;
                        return Ok(store);
                    }
                    Err(e) => {
                        return Err(AppError::configuration(format!(
                            "Malformed channel database {}: {e}",
                            path.display()
                        )));
                    }
                },
                Err(e) => {
                    warn!(
                        "Channel database read attempt {}/{} failed: {}",
                        attempt, retries, e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(250 * attempt as u64))
                        .await;
                }
            }
        }

        Err(AppError::configuration(format!(
            "Channel database unreachable after {} attempts: {}",
            retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Replace the entire store contents. Used by the importer collaborator
    /// and by tests.
    pub async fn replace(&self, channels: Vec<Channel>, streams: Vec<ChannelStream>) {
        let mut inner = self.inner.write().await;
        inner.channels = channels.into_iter().map(|c| (c.id.clone(), c)).collect();
        inner.streams.clear();
        for stream in streams {
            inner
                .streams
                .entry(stream.channel_id.clone())
                .or_default()
                .push(stream);
        }
    }

    /// Insert or update a single channel with its streams.
    pub async fn upsert(&self, channel: Channel, streams: Vec<ChannelStream>) {
        let mut inner = self.inner.write().await;
        inner.streams.insert(channel.id.clone(), streams);
        inner.channels.insert(channel.id.clone(), channel);
    }
}

impl Default for InMemoryChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelStore for InMemoryChannelStore {
    async fn get(&self, id: &str) -> Option<Channel> {
        self.inner.read().await.channels.get(id).cloned()
    }

    async fn get_by_number(&self, number: u16) -> Option<Channel> {
        self.inner
            .read()
            .await
            .channels
            .values()
            .find(|c| c.enabled && c.number == number)
            .cloned()
    }

    async fn list_enabled(&self) -> Vec<Channel> {
        let inner = self.inner.read().await;
        let mut channels: Vec<Channel> = inner
            .channels
            .values()
            .filter(|c| c.enabled)
            .filter(|c| {
                inner
                    .streams
                    .get(&c.id)
                    .is_some_and(|streams| streams.iter().any(|s| s.enabled))
            })
            .cloned()
            .collect();
        channels.sort_by_key(|c| c.number);
        channels
    }

    async fn enabled_stream(&self, channel_id: &str) -> Option<ChannelStream> {
        let inner = self.inner.read().await;
        let channel = inner.channels.get(channel_id)?;
        if !channel.enabled {
            return None;
        }
        inner
            .streams
            .get(channel_id)?
            .iter()
            .find(|s| s.enabled)
            .cloned()
    }
}
