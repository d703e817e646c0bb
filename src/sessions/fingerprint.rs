//! Client fingerprinting
//!
//! A fingerprint identifies a playback client deterministically from its IP
//! (preferring the forwarded address when present) and User-Agent. It is the
//! key that prevents the same client from opening two simultaneous sessions
//! on one channel.

use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientFingerprint(String);

impl ClientFingerprint {
    /// Derive a fingerprint from connection facts. `forwarded_for` is the
    /// raw `X-Forwarded-For` value; its first entry wins over the socket
    /// address.
    pub fn derive(
        remote_ip: &str,
        forwarded_for: Option<&str>,
        user_agent: Option<&str>,
    ) -> Self {
        let effective_ip = forwarded_for
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(remote_ip);

        let mut hasher = Sha256::new();
        hasher.update(effective_ip.as_bytes());
        hasher.update(b"|");
        hasher.update(user_agent.unwrap_or("").as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Android TV clients stop polling abruptly when their app dies, so the
/// crash detector treats them on a shorter leash.
pub fn is_android_tv(user_agent: &str) -> bool {
    let lower = user_agent.to_lowercase();
    lower.contains("androidtv")
        || (lower.contains("android") && lower.contains("tv"))
        || lower.contains("shield")
        || lower.contains("bravia")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_fingerprint() {
        let a = ClientFingerprint::derive("10.0.0.5", None, Some("Plex/1.0"));
        let b = ClientFingerprint::derive("10.0.0.5", None, Some("Plex/1.0"));
        assert_eq!(a, b);
    }

    #[test]
    fn forwarded_address_wins() {
        let direct = ClientFingerprint::derive("10.0.0.5", None, Some("Plex/1.0"));
        let proxied =
            ClientFingerprint::derive("172.17.0.1", Some("10.0.0.5, 172.17.0.1"), Some("Plex/1.0"));
        assert_eq!(direct, proxied);
    }

    #[test]
    fn user_agent_distinguishes_clients() {
        let a = ClientFingerprint::derive("10.0.0.5", None, Some("Plex/1.0"));
        let b = ClientFingerprint::derive("10.0.0.5", None, Some("Plex for Android TV/9.0"));
        assert_ne!(a, b);
    }

    #[test]
    fn android_tv_detection() {
        assert!(is_android_tv("Plex for Android TV/9.0"));
        assert!(is_android_tv("Mozilla/5.0 (Linux; AndroidTV 12)"));
        assert!(is_android_tv("Plex/4.2 (NVIDIA Shield)"));
        assert!(!is_android_tv("Plex Web/4.87"));
    }
}
