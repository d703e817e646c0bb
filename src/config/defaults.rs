/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;

// Device emulation defaults
pub const DEFAULT_DEVICE_NAME: &str = "TunerBridge HDHomeRun";
pub const DEFAULT_MANUFACTURER: &str = "Silicondust";
pub const DEFAULT_MODEL_NAME: &str = "HDHomeRun CONNECT";
pub const DEFAULT_MODEL_NUMBER: &str = "HDHR4-2US";
pub const DEFAULT_FIRMWARE_NAME: &str = "hdhomerun4_atsc";
pub const DEFAULT_FIRMWARE_VERSION: &str = "20200907";
pub const DEFAULT_DEVICE_ID: &str = "TUNERBR1";
pub const DEFAULT_TUNER_COUNT: u8 = 4;

// Streaming defaults
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 10;
pub const DEFAULT_MAX_STREAMS_PER_CHANNEL: u32 = 3;
pub const DEFAULT_STREAM_IDLE_TIMEOUT: &str = "30s";
pub const DEFAULT_SESSION_MAX_AGE: &str = "1h";
pub const DEFAULT_SWEEP_INTERVAL: &str = "30s";
pub const DEFAULT_BANDWIDTH_WINDOW: &str = "30s";

// Crash detector thresholds, from observed client behavior.
pub const DEFAULT_POLL_FRESH_WINDOW: &str = "2s";
pub const DEFAULT_BYTE_FRESH_WINDOW: &str = "5s";
pub const DEFAULT_BYTE_STALL_WINDOW: &str = "15s";
pub const DEFAULT_ANDROID_TV_POLL_GAP: &str = "10s";
pub const DEFAULT_CLIENT_TIMEOUT_WINDOW: &str = "30s";
pub const DEFAULT_CONFIRMED_CRASH_WINDOW: &str = "60s";
pub const DEFAULT_NO_ACTIVITY_WINDOW: &str = "15s";
pub const DEFAULT_MAX_PROBE_FAILURES: u32 = 2;

// Consumer defaults
pub const DEFAULT_CONSUMER_IDLE_EXPIRY: &str = "2m";
pub const DEFAULT_RECOVERY_FALLBACK: bool = true;

// Analyzer defaults
pub const DEFAULT_ANALYZER_CACHE_TTL: &str = "5m";
pub const DEFAULT_ANALYZER_CACHE_CAPACITY: usize = 256;
pub const DEFAULT_HEAD_PROBE_TIMEOUT: &str = "5s";
pub const DEFAULT_PLAYLIST_FETCH_TIMEOUT: &str = "8s";

// Transcoder defaults
pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg";
pub const DEFAULT_STOP_GRACE_PERIOD: &str = "5s";

// SSDP defaults
pub const DEFAULT_SSDP_ENABLED: bool = true;
pub const DEFAULT_SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
pub const DEFAULT_SSDP_PORT: u16 = 1900;
pub const DEFAULT_SSDP_ANNOUNCE_INTERVAL: &str = "30m";

// Channel database defaults
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_CHANNEL_LOAD_RETRIES: u32 = 3;
