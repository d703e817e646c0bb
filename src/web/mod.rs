//! Web layer
//!
//! Assembles the three HTTP surfaces of the bridge: the HDHomeRun device
//! emulation, the Plex playback-compat endpoints, and the stream/preview
//! byte paths, plus small operator-monitor endpoints. The device and compat
//! routers are wrapped by the metadata validator middleware, and the whole
//! router sits behind a panic-catcher that degrades to a well-formed empty
//! envelope instead of HTML.

use anyhow::{Result, anyhow};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::oneshot;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::analyzer::StreamAnalyzer;
use crate::config::Config;
use crate::services::{ChannelStore, EpgService, SettingsService};
use crate::sessions::{ConsumerManager, CrashDetector, SessionRegistry};
use crate::transcoder::TranscoderSupervisor;

pub mod base_url;
pub mod hdhr;
pub mod plex;
pub mod responses;
pub mod validator;

pub use validator::MetadataValidator;

/// Shared handler state. Every field is a service handle; handlers own no
/// mutable state of their own.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsService>,
    pub channels: Arc<dyn ChannelStore>,
    pub epg: Arc<dyn EpgService>,
    pub analyzer: Arc<StreamAnalyzer>,
    pub supervisor: Arc<TranscoderSupervisor>,
    pub registry: Arc<SessionRegistry>,
    pub consumers: Arc<ConsumerManager>,
    pub crash: Arc<CrashDetector>,
    pub validator: Arc<MetadataValidator>,
    pub timeline_serial: Arc<AtomicU64>,
}

impl AppState {
    /// Wire up an isolated core from one configuration. Tests use this with
    /// in-memory collaborators.
    pub fn from_parts(
        config: Config,
        channels: Arc<dyn ChannelStore>,
        epg: Arc<dyn EpgService>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.streaming.clone(),
            config.crash.byte_fresh_window,
        ));
        let consumers = Arc::new(ConsumerManager::new(config.consumers.idle_expiry));
        let crash = Arc::new(CrashDetector::new(config.crash.clone()));
        let analyzer = Arc::new(StreamAnalyzer::new(config.analyzer.clone()));
        let supervisor = Arc::new(TranscoderSupervisor::new(&config.transcoder));
        let settings = Arc::new(SettingsService::new(config));

        Self {
            settings,
            channels,
            epg,
            analyzer,
            supervisor,
            registry,
            consumers,
            crash,
            validator: Arc::new(MetadataValidator::new()),
            timeline_serial: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Background maintenance: the session-age sweeper and consumer expiry.
    pub fn start_background_tasks(&self) {
        self.registry.start_sweeper();
        self.consumers.start_expiry_task();
    }
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let validated = Router::new()
        .without_v07_checks()
        .merge(hdhr::router())
        .merge(plex::router())
        // Unknown polls under the device/compat families get an empty
        // well-formed container, HTTP 200, never HTML.
        .fallback(unknown_poll_fallback)
        .layer(axum::middleware::from_fn_with_state(
            state.validator.clone(),
            validator::validate_response,
        ));

    Router::new()
        .without_v07_checks()
        .merge(validated)
        .route("/stream/{channel_id}", get(crate::proxy::stream::stream_channel))
        .route("/preview/{channel_id}", get(crate::proxy::preview::preview_channel))
        .route("/health", get(health))
        .route("/sessions", get(session_metrics))
        .route("/validator/events", get(validator_events))
        .layer(CatchPanicLayer::custom(panic_fallback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A panicking handler must still answer with a valid empty envelope;
/// HTML or a bare 500 makes Plex mark the device broken.
fn panic_fallback(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    error!("handler panicked, answering with empty envelope");
    responses::xml(StatusCode::OK, responses::empty_media_container())
}

async fn unknown_poll_fallback() -> Response {
    responses::xml(StatusCode::OK, responses::empty_media_container())
}

async fn health(State(state): State<AppState>) -> Response {
    let metrics = state.registry.metrics().await;
    responses::json_utf8(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "active_sessions": metrics.total,
            "consumers": state.consumers.count().await,
        }),
    )
}

/// Operator view of the registry: concurrency metrics plus per-session
/// snapshots grouped by channel.
async fn session_metrics(State(state): State<AppState>) -> Response {
    let metrics = state.registry.metrics().await;
    let by_channel = state.registry.sessions_by_channel().await;
    responses::json_utf8(
        StatusCode::OK,
        &json!({
            "metrics": metrics,
            "channels": by_channel
                .into_iter()
                .map(|(channel, sessions)| json!({"channel": channel, "sessions": sessions}))
                .collect::<Vec<_>>(),
        }),
    )
}

async fn validator_events(State(state): State<AppState>) -> Response {
    responses::json_utf8(StatusCode::OK, &state.validator.events())
}

/// Web server wrapper owning the bound address and the router.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let config = state.settings.snapshot();
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self {
            app: build_router(state),
            addr,
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Bind, signal the outcome, then serve until shutdown. The caller waits
    /// on the signal before starting background services so a bind failure
    /// surfaces immediately.
    pub async fn serve_with_signal(self, ready: oneshot::Sender<Result<()>>) -> Result<()> {
        match tokio::net::TcpListener::bind(self.addr).await {
            Ok(listener) => {
                let _ = ready.send(Ok(()));
                info!("listening on {}", self.addr);
                axum::serve(listener, self.app)
                    .with_graceful_shutdown(shutdown_signal())
                    .await?;
                Ok(())
            }
            Err(e) => {
                let message = format!("failed to bind {}: {e}", self.addr);
                let _ = ready.send(Err(anyhow!(message.clone())));
                Err(anyhow!(message))
            }
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
