//! Stream proxy handler
//!
//! `GET /stream/:channelId` is the byte path Plex tunes against. The handler
//! admits the client, analyzes the upstream, spawns an encoder, and pipes
//! its stdout to the response with idle-timeout and disconnect teardown.
//! Teardown is idempotent and runs to completion even when the client is
//! already gone.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::analyzer::{Confidence, HandlingProfile};
use crate::errors::AdmissionError;
use crate::models::ChannelStream;
use crate::sessions::{ClientFingerprint, TeardownReason};
use crate::transcoder::{EncoderCommandBuilder, OutputFormat};
use crate::web::AppState;
use crate::web::responses::stream_error;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Caller-supplied session token (HLS relay embeds it).
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub client: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub recovery: Option<String>,
}

pub async fn stream_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(channel) = state.channels.get(&channel_id).await else {
        return stream_error(
            StatusCode::NOT_FOUND,
            "channel_not_found",
            format!("no channel with id {channel_id}"),
            None,
        );
    };
    let Some(upstream) = state.channels.enabled_stream(&channel_id).await else {
        return stream_error(
            StatusCode::NOT_FOUND,
            "no_enabled_stream",
            format!("channel {channel_id} has no enabled stream"),
            None,
        );
    };

    let (fingerprint, client_ip, user_agent) = client_identity(&headers);

    let session_id = match state
        .registry
        .admit(
            query.session.clone(),
            &channel_id,
            fingerprint,
            &client_ip,
            user_agent.clone(),
        )
        .await
    {
        Ok(id) => id,
        Err(AdmissionError::DuplicateClient {
            channel_id,
            session_id,
        }) => {
            return stream_error(
                StatusCode::CONFLICT,
                "duplicate_client",
                format!("client already streaming channel {channel_id}"),
                Some(session_id),
            );
        }
        Err(e @ AdmissionError::GlobalLimit { .. })
        | Err(e @ AdmissionError::ChannelLimit { .. }) => {
            return stream_error(StatusCode::SERVICE_UNAVAILABLE, "over_limit", e.to_string(), None);
        }
        Err(e) => {
            return stream_error(StatusCode::SERVICE_UNAVAILABLE, "admission_failed", e.to_string(), None);
        }
    };

    // Analyzer failures degrade, they never fail the request.
    let (profile, input_url) = analyze_with_backups(&state, &upstream).await;

    state.consumers.adopt(&session_id, &channel_id).await;

    let args = EncoderCommandBuilder::build_args(&profile, &upstream, &input_url, OutputFormat::MpegTs);
    let mut encoder = match state.supervisor.spawn(&session_id, args).await {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "encoder spawn failed");
            state
                .registry
                .begin_teardown(&session_id, TeardownReason::ProcessExit)
                .await;
            state.registry.finalize(&session_id).await;
            state.consumers.release(&session_id).await;
            return stream_error(StatusCode::BAD_GATEWAY, "encoder_failed", e.to_string(), None);
        }
    };

    info!(
        session_id = %session_id,
        channel_id = %channel.id,
        channel_name = %channel.name,
        method = ?profile.primary_method(),
        "stream session starting"
    );

    // Teardown hook: any begin_teardown caller stops the encoder exactly once.
    {
        let stop_tx = encoder.stop_sender();
        let exit_rx = encoder.exit_receiver();
        let stop = Arc::new(move || {
            if exit_rx.borrow().is_none() {
                let _ = stop_tx.try_send(crate::transcoder::EncoderEvent::Stop);
            }
        }) as Arc<dyn Fn() + Send + Sync>;
        state.registry.attach_encoder(&session_id, stop).await;
    }

    // Exit watcher: the single finalizer. Every teardown path funnels into
    // encoder exit, so counters flush exactly once.
    {
        let registry = state.registry.clone();
        let consumers = state.consumers.clone();
        let exit_rx = encoder.exit_receiver();
        let errors = encoder.error_counter();
        let sid = session_id.clone();
        tokio::spawn(async move {
            let mut exit_rx = exit_rx;
            loop {
                if exit_rx.borrow().is_some() {
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
            registry
                .begin_teardown(&sid, TeardownReason::ProcessExit)
                .await;
            registry
                .set_error_count(&sid, errors.load(std::sync::atomic::Ordering::Relaxed))
                .await;
            registry.finalize(&sid).await;
            consumers.release(&sid).await;
        });
    }

    let chunks = encoder.take_chunks();
    let body = stream_body(state.clone(), session_id.clone(), chunks);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            "Content-Range, Accept-Ranges, Content-Length",
        )
        .body(axum::body::Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn client_identity(headers: &HeaderMap) -> (ClientFingerprint, String, Option<String>) {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let remote_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let fingerprint = ClientFingerprint::derive(&remote_ip, forwarded, user_agent.as_deref());
    let effective_ip = forwarded
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or(remote_ip);
    (fingerprint, effective_ip, user_agent)
}

/// Analyze the primary upstream; when the probe degrades to the conservative
/// fallback and backups exist, try them in declared order before settling.
async fn analyze_with_backups(
    state: &AppState,
    upstream: &ChannelStream,
) -> (HandlingProfile, String) {
    let mut chosen: Option<(HandlingProfile, String)> = None;
    for url in upstream.candidate_urls() {
        let profile = state.analyzer.analyze(url, Some(upstream.format)).await;
        let degraded = profile.confidence == Confidence::Low;
        if !degraded {
            return (profile, url.to_string());
        }
        if chosen.is_none() {
            chosen = Some((profile, url.to_string()));
        }
        debug!(url, "analysis degraded, trying next candidate");
    }
    chosen.unwrap_or_else(|| {
        (
            HandlingProfile::conservative(upstream.format),
            upstream.url.clone(),
        )
    })
}

/// The response body: chunks from the encoder with the idle timer armed and
/// reset on each chunk, byte accounting into the registry, and
/// disconnect-safe teardown through a drop guard.
fn stream_body(
    state: AppState,
    session_id: String,
    mut chunks: tokio::sync::mpsc::Receiver<Bytes>,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    let idle_timeout = state.settings.snapshot().streaming.idle_timeout;
    let guard = DisconnectGuard {
        state: state.clone(),
        session_id: session_id.clone(),
    };

    async_stream::stream! {
        // Moved into the generator so dropping the body fires teardown.
        let _guard = guard;
        loop {
            match tokio::time::timeout(idle_timeout, chunks.recv()).await {
                Ok(Some(chunk)) => {
                    state.registry.record_chunk(&session_id, chunk.len() as u64).await;
                    yield Ok(chunk);
                }
                Ok(None) => {
                    // Encoder stdout closed; the exit watcher finalizes.
                    break;
                }
                Err(_) => {
                    warn!(session_id = %session_id, "stream idle timeout");
                    state
                        .registry
                        .begin_teardown(&session_id, TeardownReason::Timeout)
                        .await;
                    break;
                }
            }
        }
    }
}

/// Fires disconnect teardown when the response body is dropped, whether the
/// stream ended or the client went away mid-chunk.
struct DisconnectGuard {
    state: AppState,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        handle.spawn(async move {
            if state
                .registry
                .begin_teardown(&session_id, TeardownReason::Disconnect)
                .await
            {
                debug!(session_id = %session_id, "client disconnected");
            }
        });
    }
}
