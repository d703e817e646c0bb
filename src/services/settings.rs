//! Immutable configuration snapshots
//!
//! Configuration is read-mostly: handlers clone an `Arc<Config>` and read
//! without locking. Updates swap the whole snapshot; in-flight requests keep
//! the snapshot they started with.

use std::sync::{Arc, RwLock};

use crate::config::Config;

pub struct SettingsService {
    current: RwLock<Arc<Config>>,
}

impl SettingsService {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// The current configuration snapshot. Cheap to call on the hot path.
    pub fn snapshot(&self) -> Arc<Config> {
        self.current
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    /// Publish a new snapshot. Readers holding the old Arc are unaffected.
    pub fn publish(&self, config: Config) {
        *self.current.write().expect("settings lock poisoned") = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_swaps_snapshot_without_disturbing_readers() {
        let service = SettingsService::new(Config::default());
        let before = service.snapshot();

        let mut updated = Config::default();
        updated.web.port = 9000;
        service.publish(updated);

        assert_eq!(before.web.port, 3000);
        assert_eq!(service.snapshot().web.port, 9000);
    }
}
