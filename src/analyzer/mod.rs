//! Stream Format Analyzer
//!
//! Classifies an upstream URL into one of the nine supported source formats
//! and produces a *handling profile*: the per-source decisions (special
//! handling, delivery method list, confidence) the stream proxy and encoder
//! builder act on.
//!
//! Strategy:
//!   1. Scheme/extension classification (cheap, no network).
//!   2. Token-auth and CDN heuristics on the URL itself.
//!   3. A HEAD probe with redirects disabled to detect 301/302 upstreams.
//!   4. For HLS, a bounded playlist fetch whose complexity markers are
//!      counted (`#EXT-X-STREAM-INF`, `#EXT-X-KEY`, `#EXT-X-DISCONTINUITY`,
//!      `#EXT-X-PROGRAM-DATE-TIME`, `#EXT-X-BYTERANGE`, missing
//!      `#EXT-X-ENDLIST`).
//!   5. Method selection, first match wins, always ending in the
//!      minimal-intervention fallback.
//!
//! Results are memoized per URL for a configurable window. Any probe failure
//! softens into a conservative profile instead of failing the request.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::config::AnalyzerConfig;
use crate::errors::{AnalyzerError, AnalyzerResult};
use crate::models::StreamFormat;

/// Maximum bytes read from a playlist body (defensive upper bound).
pub const MAX_PLAYLIST_BYTES: usize = 256 * 1024;

/// Query/path parameter names that indicate tokenized auth.
const TOKEN_PARAMS: &[&str] = &[
    "token", "auth", "key", "signature", "expires", "sessionid", "sid", "jwt", "bearer",
];

/// Host substrings that indicate a CDN-backed source.
const CDN_HOSTS: &[&str] = &[
    "cdn",
    "edge",
    "cache",
    "akamai",
    "cloudfront",
    "fastly",
    "cloudflare",
    "azure",
    "amazonaws",
];

/// Path substrings that indicate a CDN-style delivery layout.
const CDN_PATHS: &[&str] = &["/hls/", "/dash/", "/playlist/", "/manifest/", "/stream/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlaylistComplexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Delivery methods the stream proxy knows how to execute, in preference
/// order within a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingMethod {
    MasterPlaylistDirect,
    TokenPreservation,
    ResolveRedirects,
    SegmentProxy,
    PersistentConnections,
    EnhancedRecovery,
    PlaylistRewrite,
    StandardProxy,
    Direct,
    DirectPassthrough,
    MinimalIntervention,
}

/// The per-source decision record produced by analysis.
#[derive(Debug, Clone)]
pub struct HandlingProfile {
    pub kind: StreamFormat,
    pub requires_special_handling: bool,
    pub has_token_auth: bool,
    pub is_cdn_backed: bool,
    pub has_redirects: bool,
    pub playlist_complexity: PlaylistComplexity,
    pub supported_methods: Vec<HandlingMethod>,
    pub confidence: Confidence,
}

impl HandlingProfile {
    /// Safe profile used whenever probing fails outright.
    pub fn conservative(kind: StreamFormat) -> Self {
        Self {
            kind,
            requires_special_handling: true,
            has_token_auth: false,
            is_cdn_backed: false,
            has_redirects: false,
            playlist_complexity: PlaylistComplexity::Simple,
            supported_methods: vec![HandlingMethod::StandardProxy, HandlingMethod::MinimalIntervention],
            confidence: Confidence::Low,
        }
    }

    pub fn primary_method(&self) -> HandlingMethod {
        self.supported_methods
            .first()
            .copied()
            .unwrap_or(HandlingMethod::MinimalIntervention)
    }
}

struct CachedProfile {
    profile: HandlingProfile,
    stored_at: Instant,
}

/// Analyzer service. Holds two HTTP clients: one with redirects disabled for
/// the HEAD probe, one with a small redirect budget for playlist fetches.
pub struct StreamAnalyzer {
    probe_client: Client,
    fetch_client: Client,
    cache: Mutex<LruCache<String, CachedProfile>>,
    config: AnalyzerConfig,
}

impl StreamAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let probe_client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.head_probe_timeout)
            .build()
            .unwrap_or_default();
        let fetch_client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(3))
            .timeout(config.playlist_fetch_timeout)
            .build()
            .unwrap_or_default();
        let capacity =
            NonZeroUsize::new(config.cache_capacity.max(1)).expect("non-zero cache capacity");
        Self {
            probe_client,
            fetch_client,
            cache: Mutex::new(LruCache::new(capacity)),
            config,
        }
    }

    /// Analyze an upstream URL, consulting the memo cache first. Never fails:
    /// probe errors degrade to [`HandlingProfile::conservative`].
    pub async fn analyze(&self, url: &str, declared: Option<StreamFormat>) -> HandlingProfile {
        if let Some(cached) = self.cache_lookup(url) {
            return cached;
        }

        let profile = match self.analyze_uncached(url, declared).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(url, error = %e, "stream analysis failed, using conservative profile");
                HandlingProfile::conservative(
                    declared.unwrap_or_else(|| classify_format(url)),
                )
            }
        };

        self.cache_store(url, profile.clone());
        profile
    }

    fn cache_lookup(&self, url: &str) -> Option<HandlingProfile> {
        let mut cache = self.cache.lock().expect("analyzer cache lock poisoned");
        let entry = cache.get(url)?;
        if entry.stored_at.elapsed() > self.config.cache_ttl {
            cache.pop(url);
            return None;
        }
        Some(entry.profile.clone())
    }

    fn cache_store(&self, url: &str, profile: HandlingProfile) {
        let mut cache = self.cache.lock().expect("analyzer cache lock poisoned");
        cache.put(
            url.to_string(),
            CachedProfile {
                profile,
                stored_at: Instant::now(),
            },
        );
    }

    async fn analyze_uncached(
        &self,
        url: &str,
        declared: Option<StreamFormat>,
    ) -> AnalyzerResult<HandlingProfile> {
        let kind = declared.unwrap_or_else(|| classify_format(url));
        let has_token_auth = detect_token_auth(url);
        let is_cdn_backed = detect_cdn(url);

        // Non-HTTP transports never get probed; the encoder owns them.
        if !matches!(
            kind,
            StreamFormat::Hls | StreamFormat::Dash | StreamFormat::Ts | StreamFormat::Http
        ) {
            let profile = HandlingProfile {
                kind,
                requires_special_handling: true,
                has_token_auth,
                is_cdn_backed,
                has_redirects: false,
                playlist_complexity: PlaylistComplexity::Simple,
                supported_methods: select_methods(
                    has_token_auth,
                    is_cdn_backed,
                    false,
                    PlaylistComplexity::Simple,
                ),
                confidence: Confidence::High,
            };
            return Ok(profile);
        }

        let has_redirects = self.probe_redirects(url).await?;

        let playlist_complexity = if kind == StreamFormat::Hls {
            let playlist = self.fetch_playlist_bounded(url).await?;
            score_playlist_complexity(&playlist)
        } else {
            PlaylistComplexity::Simple
        };

        let supported_methods =
            select_methods(has_token_auth, is_cdn_backed, has_redirects, playlist_complexity);

        let profile = HandlingProfile {
            kind,
            requires_special_handling: has_token_auth
                || playlist_complexity == PlaylistComplexity::Complex,
            has_token_auth,
            is_cdn_backed,
            has_redirects,
            playlist_complexity,
            supported_methods,
            confidence: Confidence::High,
        };

        debug!(
            url,
            kind = %profile.kind,
            token_auth = profile.has_token_auth,
            cdn = profile.is_cdn_backed,
            redirects = profile.has_redirects,
            complexity = ?profile.playlist_complexity,
            "stream analysis complete"
        );

        Ok(profile)
    }

    /// HEAD with zero redirects allowed; a 301/302 answer marks the source
    /// as redirect-fronted.
    async fn probe_redirects(&self, url: &str) -> AnalyzerResult<bool> {
        let resp = self
            .probe_client
            .head(url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyzerError::Timeout
                } else {
                    AnalyzerError::Http(e.to_string())
                }
            })?;
        let status = resp.status().as_u16();
        Ok(status == 301 || status == 302)
    }

    async fn fetch_playlist_bounded(&self, url: &str) -> AnalyzerResult<String> {
        let resp = self
            .fetch_client
            .get(url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyzerError::Timeout
                } else {
                    AnalyzerError::Http(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(AnalyzerError::Http(format!(
                "Non-success status: {}",
                resp.status()
            )));
        }

        // Stream body in chunks, limit total
        use futures::StreamExt;
        let mut body = resp.bytes_stream();
        let mut collected: Vec<u8> = Vec::with_capacity(8192);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| AnalyzerError::Io(e.to_string()))?;
            if collected.len() + chunk.len() > MAX_PLAYLIST_BYTES {
                collected.extend_from_slice(&chunk[..(MAX_PLAYLIST_BYTES - collected.len())]);
                break;
            }
            collected.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&collected).to_string())
    }
}

/// Classify a URL by scheme first, then by path extension.
pub fn classify_format(url: &str) -> StreamFormat {
    let lower = url.to_lowercase();
    if lower.starts_with("rtsp://") {
        return StreamFormat::Rtsp;
    }
    if lower.starts_with("rtmp://") || lower.starts_with("rtmps://") {
        return StreamFormat::Rtmp;
    }
    if lower.starts_with("udp://") {
        return StreamFormat::Udp;
    }
    if lower.starts_with("mms://") {
        return StreamFormat::Mms;
    }
    if lower.starts_with("srt://") {
        return StreamFormat::Srt;
    }

    let base = strip_query_and_fragment(&lower);
    if base.ends_with(".m3u8") || base.ends_with(".m3u") {
        StreamFormat::Hls
    } else if base.ends_with(".mpd") {
        StreamFormat::Dash
    } else if base.ends_with(".ts") || base.ends_with(".mpegts") || base.ends_with(".mts") {
        StreamFormat::Ts
    } else {
        StreamFormat::Http
    }
}

/// Token-auth heuristic: a fixed parameter-name set matched against the query
/// string and path segments.
pub fn detect_token_auth(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    for (name, _) in parsed.query_pairs() {
        if TOKEN_PARAMS.contains(&name.to_lowercase().as_str()) {
            return true;
        }
    }
    if let Some(segments) = parsed.path_segments() {
        for segment in segments {
            let lower = segment.to_lowercase();
            if TOKEN_PARAMS.iter().any(|p| lower == *p) {
                return true;
            }
        }
    }
    false
}

/// CDN heuristic: well-known CDN host fragments or delivery-style paths.
pub fn detect_cdn(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if let Some(host) = parsed.host_str() {
        let host = host.to_lowercase();
        if CDN_HOSTS.iter().any(|marker| host.contains(marker)) {
            return true;
        }
    }
    let path = parsed.path().to_lowercase();
    CDN_PATHS.iter().any(|marker| path.contains(marker))
}

/// Count complexity markers in an HLS playlist. Score >= 3 is complex,
/// >= 1 moderate.
pub fn score_playlist_complexity(playlist: &str) -> PlaylistComplexity {
    let mut stream_inf = 0usize;
    let mut saw_key = false;
    let mut saw_discontinuity = false;
    let mut saw_program_date_time = false;
    let mut saw_byterange = false;
    let mut saw_endlist = false;

    for raw_line in playlist.lines() {
        let line = raw_line.trim();
        if line.starts_with("#EXT-X-STREAM-INF") {
            stream_inf += 1;
        } else if line.starts_with("#EXT-X-KEY") {
            saw_key = true;
        } else if line.starts_with("#EXT-X-DISCONTINUITY") {
            saw_discontinuity = true;
        } else if line.starts_with("#EXT-X-PROGRAM-DATE-TIME") {
            saw_program_date_time = true;
        } else if line.starts_with("#EXT-X-BYTERANGE") {
            saw_byterange = true;
        } else if line.starts_with("#EXT-X-ENDLIST") {
            saw_endlist = true;
        }
    }

    let mut score = 0usize;
    if stream_inf > 1 {
        score += 1;
    }
    if saw_key {
        score += 1;
    }
    if saw_discontinuity {
        score += 1;
    }
    if saw_program_date_time {
        score += 1;
    }
    if saw_byterange {
        score += 1;
    }
    // A playlist with no ENDLIST is live and needs continuous refresh.
    if !saw_endlist {
        score += 1;
    }

    if score >= 3 {
        PlaylistComplexity::Complex
    } else if score >= 1 {
        PlaylistComplexity::Moderate
    } else {
        PlaylistComplexity::Simple
    }
}

/// Method selection, first match wins. `minimal-intervention` is always the
/// final fallback.
pub fn select_methods(
    has_token_auth: bool,
    is_cdn_backed: bool,
    has_redirects: bool,
    complexity: PlaylistComplexity,
) -> Vec<HandlingMethod> {
    let mut methods = if has_token_auth && complexity == PlaylistComplexity::Complex {
        vec![HandlingMethod::MasterPlaylistDirect, HandlingMethod::MinimalIntervention]
    } else if has_token_auth {
        vec![HandlingMethod::TokenPreservation, HandlingMethod::MinimalIntervention]
    } else if has_redirects {
        vec![HandlingMethod::ResolveRedirects, HandlingMethod::Direct]
    } else if is_cdn_backed && complexity == PlaylistComplexity::Simple {
        vec![HandlingMethod::SegmentProxy, HandlingMethod::PersistentConnections]
    } else if complexity == PlaylistComplexity::Complex {
        vec![HandlingMethod::EnhancedRecovery, HandlingMethod::PlaylistRewrite]
    } else {
        vec![HandlingMethod::StandardProxy, HandlingMethod::DirectPassthrough]
    };

    if !methods.contains(&HandlingMethod::MinimalIntervention) {
        methods.push(HandlingMethod::MinimalIntervention);
    }
    methods
}

fn strip_query_and_fragment(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(pos) => &url[..pos],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_scheme_and_extension() {
        assert_eq!(classify_format("http://host/live/stream.m3u8"), StreamFormat::Hls);
        assert_eq!(classify_format("http://host/manifest.mpd"), StreamFormat::Dash);
        assert_eq!(classify_format("http://host/feed.ts?x=1"), StreamFormat::Ts);
        assert_eq!(classify_format("http://host/feed.mpegts"), StreamFormat::Ts);
        assert_eq!(classify_format("rtsp://cam.local/ch0"), StreamFormat::Rtsp);
        assert_eq!(classify_format("rtmps://host/app/key"), StreamFormat::Rtmp);
        assert_eq!(classify_format("udp://239.0.0.1:1234"), StreamFormat::Udp);
        assert_eq!(classify_format("mms://host/old"), StreamFormat::Mms);
        assert_eq!(classify_format("srt://host:9000"), StreamFormat::Srt);
        assert_eq!(classify_format("http://host/video"), StreamFormat::Http);
    }

    #[test]
    fn token_auth_detected_in_query_and_path() {
        assert!(detect_token_auth("http://host/live.m3u8?token=abc"));
        assert!(detect_token_auth("http://host/live.m3u8?Expires=123&sig=x"));
        assert!(detect_token_auth("http://host/jwt/live.m3u8"));
        assert!(!detect_token_auth("http://host/live.m3u8?quality=hd"));
    }

    #[test]
    fn cdn_detected_by_host_and_path() {
        assert!(detect_cdn("http://edge3.provider.tv/live.m3u8"));
        assert!(detect_cdn("http://d1234.cloudfront.net/live.m3u8"));
        assert!(detect_cdn("http://origin.tv/hls/channel5.m3u8"));
        assert!(!detect_cdn("http://origin.tv/channel5.m3u8"));
    }

    #[test]
    fn complexity_scoring_matches_marker_count() {
        // Live media playlist: only the missing ENDLIST counts.
        let live_simple = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg1.ts\n";
        assert_eq!(score_playlist_complexity(live_simple), PlaylistComplexity::Moderate);

        // VOD playlist with ENDLIST and nothing else is simple.
        let vod = "#EXTM3U\n#EXTINF:6.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        assert_eq!(score_playlist_complexity(vod), PlaylistComplexity::Simple);

        let complex = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000\nlow.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1600000\nmid.m3u8\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"key\"\n\
            #EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00Z\n";
        assert_eq!(score_playlist_complexity(complex), PlaylistComplexity::Complex);
    }

    #[test]
    fn method_selection_first_match_wins() {
        let m = select_methods(true, false, false, PlaylistComplexity::Complex);
        assert_eq!(m[0], HandlingMethod::MasterPlaylistDirect);
        assert_eq!(*m.last().unwrap(), HandlingMethod::MinimalIntervention);

        let m = select_methods(true, true, true, PlaylistComplexity::Simple);
        assert_eq!(m[0], HandlingMethod::TokenPreservation);

        let m = select_methods(false, false, true, PlaylistComplexity::Simple);
        assert_eq!(m[0], HandlingMethod::ResolveRedirects);
        assert_eq!(*m.last().unwrap(), HandlingMethod::MinimalIntervention);

        let m = select_methods(false, true, false, PlaylistComplexity::Simple);
        assert_eq!(m[0], HandlingMethod::SegmentProxy);

        let m = select_methods(false, true, false, PlaylistComplexity::Complex);
        assert_eq!(m[0], HandlingMethod::EnhancedRecovery);

        let m = select_methods(false, false, false, PlaylistComplexity::Simple);
        assert_eq!(m[0], HandlingMethod::StandardProxy);
    }

    #[tokio::test]
    async fn probe_failure_degrades_to_conservative_profile() {
        let analyzer = StreamAnalyzer::new(AnalyzerConfig {
            head_probe_timeout: Duration::from_millis(200),
            playlist_fetch_timeout: Duration::from_millis(200),
            ..AnalyzerConfig::default()
        });
        // Reserved TEST-NET address: the probe cannot succeed.
        let profile = analyzer
            .analyze("http://192.0.2.1/live.m3u8", None)
            .await;
        assert!(profile.requires_special_handling);
        assert_eq!(profile.confidence, Confidence::Low);
        assert_eq!(profile.kind, StreamFormat::Hls);
    }

    #[tokio::test]
    async fn non_http_transports_skip_probing() {
        let analyzer = StreamAnalyzer::new(AnalyzerConfig::default());
        let profile = analyzer
            .analyze("rtsp://cam.local/ch0", Some(StreamFormat::Rtsp))
            .await;
        assert_eq!(profile.kind, StreamFormat::Rtsp);
        assert_eq!(profile.confidence, Confidence::High);
        assert!(profile.requires_special_handling);
    }
}
