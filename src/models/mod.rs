//! Core data model shared across the streaming engine
//!
//! Channels and streams are owned by the importer/admin collaborators; the
//! core reads them through [`crate::services::ChannelStore`] and never
//! mutates them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// Declared upstream protocol of a stream source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamFormat {
    Hls,
    Dash,
    Ts,
    Rtsp,
    Rtmp,
    Udp,
    Mms,
    Srt,
    /// Plain HTTP source with no recognizable container hint.
    #[default]
    Http,
}

impl StreamFormat {
    /// Whether the format is playlist-driven rather than a continuous
    /// byte stream.
    pub fn is_playlist_based(&self) -> bool {
        matches!(self, StreamFormat::Hls | StreamFormat::Dash)
    }
}

/// A logical TV channel as exposed in the lineup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Stable opaque identifier.
    pub id: String,
    /// Human channel number, unique across enabled channels.
    pub number: u16,
    pub name: String,
    #[serde(default)]
    pub logo_url: Option<String>,
    /// Correlation id into the EPG collaborator.
    #[serde(default)]
    pub epg_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// An upstream source belonging to exactly one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStream {
    pub channel_id: String,
    pub url: String,
    #[serde(default)]
    pub format: StreamFormat,
    /// Ordered fallbacks tried when the primary upstream fails analysis.
    #[serde(default)]
    pub backup_urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Extra request headers sent to the upstream.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Protocol-specific option bag, passed through to the encoder builder.
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ChannelStream {
    /// All candidate upstream URLs in priority order.
    pub fn candidate_urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.backup_urls.iter().map(String::as_str))
    }
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_format_parses_from_tag() {
        assert_eq!("hls".parse::<StreamFormat>().unwrap(), StreamFormat::Hls);
        assert_eq!("rtsp".parse::<StreamFormat>().unwrap(), StreamFormat::Rtsp);
        assert!("smooth".parse::<StreamFormat>().is_err());
    }

    #[test]
    fn candidate_urls_keep_declared_order() {
        let stream = ChannelStream {
            channel_id: "ch-1".into(),
            url: "http://one/playlist.m3u8".into(),
            format: StreamFormat::Hls,
            backup_urls: vec!["http://two/playlist.m3u8".into()],
            username: None,
            password: None,
            headers: HashMap::new(),
            options: HashMap::new(),
            enabled: true,
        };
        let urls: Vec<_> = stream.candidate_urls().collect();
        assert_eq!(urls, vec!["http://one/playlist.m3u8", "http://two/playlist.m3u8"]);
    }
}
