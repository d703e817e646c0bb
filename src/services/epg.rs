//! EPG collaborator contract
//!
//! The XMLTV ingester and scheduler live outside the streaming core; the
//! device surface only needs program counts, current-program lookups, and
//! the guide redirect target.

use async_trait::async_trait;
use serde::Serialize;

/// A currently-airing program, as much of it as the tuner surface reports.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentProgram {
    pub title: String,
    pub start: chrono::DateTime<chrono::Utc>,
    pub stop: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait EpgService: Send + Sync {
    /// Total number of programs currently known to the guide.
    async fn program_count(&self) -> u64;

    /// The program airing now on a channel, if the guide knows it.
    async fn current(&self, channel_epg_id: &str) -> Option<CurrentProgram>;

    /// Absolute URL of the XMLTV document served by the guide collaborator.
    fn xmltv_url(&self) -> String;
}

/// Stand-in used until the guide collaborator is wired up. Reports an empty
/// guide and redirects to a configurable XMLTV location.
pub struct NoopEpgService {
    xmltv_url: String,
}

impl NoopEpgService {
    pub fn new(xmltv_url: impl Into<String>) -> Self {
        Self {
            xmltv_url: xmltv_url.into(),
        }
    }
}

#[async_trait]
impl EpgService for NoopEpgService {
    async fn program_count(&self) -> u64 {
        0
    }

    async fn current(&self, _channel_epg_id: &str) -> Option<CurrentProgram> {
        None
    }

    fn xmltv_url(&self) -> String {
        self.xmltv_url.clone()
    }
}
