use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod defaults;
pub mod duration_serde;

use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub crash: CrashConfig,
    #[serde(default)]
    pub consumers: ConsumerConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub ssdp: SsdpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a TOML file, overlaid with `TUNER_BRIDGE_*`
    /// environment variables (`TUNER_BRIDGE_WEB__PORT=3000` etc).
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TUNER_BRIDGE_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit advertised base URL. Takes precedence over every other
    /// discovery mechanism when set.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Port appended to the advertised host when it carries none.
    /// Defaults to the listen port.
    #[serde(default)]
    pub streaming_port: Option<u16>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            streaming_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Application/device UUID used as the UPnP UDN.
    #[serde(default = "default_device_uuid")]
    pub uuid: String,
    /// 8-character hex device id reported in discover.json.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_device_name")]
    pub friendly_name: String,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_model_number")]
    pub model_number: String,
    #[serde(default = "default_firmware_name")]
    pub firmware_name: String,
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
    #[serde(default = "default_tuner_count")]
    pub tuner_count: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            uuid: default_device_uuid(),
            device_id: default_device_id(),
            friendly_name: default_device_name(),
            manufacturer: default_manufacturer(),
            model_name: default_model_name(),
            model_number: default_model_number(),
            firmware_name: default_firmware_name(),
            firmware_version: default_firmware_version(),
            tuner_count: default_tuner_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    #[serde(default = "default_max_streams_per_channel")]
    pub max_streams_per_channel: u32,
    /// Idle timeout on the stream pipe, reset on each chunk.
    #[serde(with = "duration_serde::duration", default = "default_stream_idle_timeout")]
    pub idle_timeout: Duration,
    /// Hard upper bound on session age, enforced by the sweeper.
    #[serde(with = "duration_serde::duration", default = "default_session_max_age")]
    pub session_max_age: Duration,
    #[serde(with = "duration_serde::duration", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    /// Rolling bandwidth sample window.
    #[serde(with = "duration_serde::duration", default = "default_bandwidth_window")]
    pub bandwidth_window: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            max_streams_per_channel: default_max_streams_per_channel(),
            idle_timeout: default_stream_idle_timeout(),
            session_max_age: default_session_max_age(),
            sweep_interval: default_sweep_interval(),
            bandwidth_window: default_bandwidth_window(),
        }
    }
}

/// Crash-detector thresholds. The defaults come from observing real client
/// behavior rather than any published contract, so every window is tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashConfig {
    #[serde(with = "duration_serde::duration", default = "default_poll_fresh_window")]
    pub poll_fresh_window: Duration,
    #[serde(with = "duration_serde::duration", default = "default_byte_fresh_window")]
    pub byte_fresh_window: Duration,
    #[serde(with = "duration_serde::duration", default = "default_byte_stall_window")]
    pub byte_stall_window: Duration,
    #[serde(with = "duration_serde::duration", default = "default_android_tv_poll_gap")]
    pub android_tv_poll_gap: Duration,
    #[serde(with = "duration_serde::duration", default = "default_client_timeout_window")]
    pub client_timeout_window: Duration,
    #[serde(with = "duration_serde::duration", default = "default_confirmed_crash_window")]
    pub confirmed_crash_window: Duration,
    #[serde(with = "duration_serde::duration", default = "default_no_activity_window")]
    pub no_activity_window: Duration,
    #[serde(default = "default_max_probe_failures")]
    pub max_probe_failures: u32,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            poll_fresh_window: default_poll_fresh_window(),
            byte_fresh_window: default_byte_fresh_window(),
            byte_stall_window: default_byte_stall_window(),
            android_tv_poll_gap: default_android_tv_poll_gap(),
            client_timeout_window: default_client_timeout_window(),
            confirmed_crash_window: default_confirmed_crash_window(),
            no_activity_window: default_no_activity_window(),
            max_probe_failures: default_max_probe_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumers with no polls for this long are expired.
    #[serde(with = "duration_serde::duration", default = "default_consumer_idle_expiry")]
    pub idle_expiry: Duration,
    /// When a playlist request references an unknown session, fabricate a
    /// consumer and redirect instead of returning 404.
    #[serde(default = "default_recovery_fallback")]
    pub recovery_fallback: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            idle_expiry: default_consumer_idle_expiry(),
            recovery_fallback: default_recovery_fallback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(with = "duration_serde::duration", default = "default_analyzer_cache_ttl")]
    pub cache_ttl: Duration,
    #[serde(default = "default_analyzer_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(with = "duration_serde::duration", default = "default_head_probe_timeout")]
    pub head_probe_timeout: Duration,
    #[serde(with = "duration_serde::duration", default = "default_playlist_fetch_timeout")]
    pub playlist_fetch_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_analyzer_cache_ttl(),
            cache_capacity: default_analyzer_cache_capacity(),
            head_probe_timeout: default_head_probe_timeout(),
            playlist_fetch_timeout: default_playlist_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    /// Grace period between the graceful stop request and a forced kill.
    #[serde(with = "duration_serde::duration", default = "default_stop_grace_period")]
    pub stop_grace_period: Duration,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: default_ffmpeg_command(),
            stop_grace_period: default_stop_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsdpConfig {
    #[serde(default = "default_ssdp_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ssdp_multicast_addr")]
    pub multicast_addr: String,
    #[serde(default = "default_ssdp_port")]
    pub port: u16,
    #[serde(with = "duration_serde::duration", default = "default_ssdp_announce_interval")]
    pub announce_interval: Duration,
    /// Additional device/service URNs answered beyond `ssdp:all` and
    /// `upnp:rootdevice`.
    #[serde(default = "default_ssdp_search_targets")]
    pub search_targets: Vec<String>,
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            enabled: default_ssdp_enabled(),
            multicast_addr: default_ssdp_multicast_addr(),
            port: default_ssdp_port(),
            announce_interval: default_ssdp_announce_interval(),
            search_targets: default_ssdp_search_targets(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_channel_load_retries")]
    pub channel_load_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            channel_load_retries: default_channel_load_retries(),
        }
    }
}

// Web defaults
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// Device defaults
fn default_device_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_device_id() -> String {
    DEFAULT_DEVICE_ID.to_string()
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_manufacturer() -> String {
    DEFAULT_MANUFACTURER.to_string()
}

fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_string()
}

fn default_model_number() -> String {
    DEFAULT_MODEL_NUMBER.to_string()
}

fn default_firmware_name() -> String {
    DEFAULT_FIRMWARE_NAME.to_string()
}

fn default_firmware_version() -> String {
    DEFAULT_FIRMWARE_VERSION.to_string()
}

fn default_tuner_count() -> u8 {
    DEFAULT_TUNER_COUNT
}

// Streaming defaults
fn default_max_concurrent_streams() -> u32 {
    DEFAULT_MAX_CONCURRENT_STREAMS
}

fn default_max_streams_per_channel() -> u32 {
    DEFAULT_MAX_STREAMS_PER_CHANNEL
}

fn default_stream_idle_timeout() -> Duration {
    parse_default(DEFAULT_STREAM_IDLE_TIMEOUT)
}

fn default_session_max_age() -> Duration {
    parse_default(DEFAULT_SESSION_MAX_AGE)
}

fn default_sweep_interval() -> Duration {
    parse_default(DEFAULT_SWEEP_INTERVAL)
}

fn default_bandwidth_window() -> Duration {
    parse_default(DEFAULT_BANDWIDTH_WINDOW)
}

// Crash detector defaults
fn default_poll_fresh_window() -> Duration {
    parse_default(DEFAULT_POLL_FRESH_WINDOW)
}

fn default_byte_fresh_window() -> Duration {
    parse_default(DEFAULT_BYTE_FRESH_WINDOW)
}

fn default_byte_stall_window() -> Duration {
    parse_default(DEFAULT_BYTE_STALL_WINDOW)
}

fn default_android_tv_poll_gap() -> Duration {
    parse_default(DEFAULT_ANDROID_TV_POLL_GAP)
}

fn default_client_timeout_window() -> Duration {
    parse_default(DEFAULT_CLIENT_TIMEOUT_WINDOW)
}

fn default_confirmed_crash_window() -> Duration {
    parse_default(DEFAULT_CONFIRMED_CRASH_WINDOW)
}

fn default_no_activity_window() -> Duration {
    parse_default(DEFAULT_NO_ACTIVITY_WINDOW)
}

fn default_max_probe_failures() -> u32 {
    DEFAULT_MAX_PROBE_FAILURES
}

// Consumer defaults
fn default_consumer_idle_expiry() -> Duration {
    parse_default(DEFAULT_CONSUMER_IDLE_EXPIRY)
}

fn default_recovery_fallback() -> bool {
    DEFAULT_RECOVERY_FALLBACK
}

// Analyzer defaults
fn default_analyzer_cache_ttl() -> Duration {
    parse_default(DEFAULT_ANALYZER_CACHE_TTL)
}

fn default_analyzer_cache_capacity() -> usize {
    DEFAULT_ANALYZER_CACHE_CAPACITY
}

fn default_head_probe_timeout() -> Duration {
    parse_default(DEFAULT_HEAD_PROBE_TIMEOUT)
}

fn default_playlist_fetch_timeout() -> Duration {
    parse_default(DEFAULT_PLAYLIST_FETCH_TIMEOUT)
}

// Transcoder defaults
fn default_ffmpeg_command() -> String {
    DEFAULT_FFMPEG_COMMAND.to_string()
}

fn default_stop_grace_period() -> Duration {
    parse_default(DEFAULT_STOP_GRACE_PERIOD)
}

// SSDP defaults
fn default_ssdp_enabled() -> bool {
    DEFAULT_SSDP_ENABLED
}

fn default_ssdp_multicast_addr() -> String {
    DEFAULT_SSDP_MULTICAST_ADDR.to_string()
}

fn default_ssdp_port() -> u16 {
    DEFAULT_SSDP_PORT
}

fn default_ssdp_announce_interval() -> Duration {
    parse_default(DEFAULT_SSDP_ANNOUNCE_INTERVAL)
}

fn default_ssdp_search_targets() -> Vec<String> {
    vec![
        "urn:schemas-upnp-org:device:MediaServer:1".to_string(),
        "urn:schemas-upnp-org:device:Basic:1".to_string(),
    ]
}

// Storage defaults
fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_channel_load_retries() -> u32 {
    DEFAULT_CHANNEL_LOAD_RETRIES
}

fn parse_default(value: &str) -> Duration {
    humantime::parse_duration(value).expect("default duration literals are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let config = Config::default();
        assert_eq!(config.web.port, 3000);
        assert_eq!(config.device.tuner_count, 4);
        assert_eq!(config.streaming.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.crash.confirmed_crash_window, Duration::from_secs(60));
        assert_eq!(config.consumers.idle_expiry, Duration::from_secs(120));
        assert!(config.consumers.recovery_fallback);
        assert_eq!(config.analyzer.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.transcoder.stop_grace_period, Duration::from_secs(5));
        assert!(config.ssdp.enabled);
    }

    #[test]
    fn duration_strings_deserialize() {
        let config: Config = toml::from_str(
            r#"
            [streaming]
            idle_timeout = "45s"
            session_max_age = "2h"

            [crash]
            confirmed_crash_window = "90s"
        "#,
        )
        .unwrap();
        assert_eq!(config.streaming.idle_timeout, Duration::from_secs(45));
        assert_eq!(config.streaming.session_max_age, Duration::from_secs(7200));
        assert_eq!(config.crash.confirmed_crash_window, Duration::from_secs(90));
    }
}
