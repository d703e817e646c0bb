//! Plex playback-compat surface
//!
//! The endpoints Plex polls at ~1 Hz during Live TV playback. Every handler
//! consults the crash detector before doing anything stateful, answers with
//! a syntactically valid envelope on every path, and never emits the
//! forbidden type code 5 (the validator middleware is the backstop).
//!
//! Plex treats 5xx from these endpoints as "device broken" and retries
//! aggressively, so failures degrade to empty envelopes instead.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use super::AppState;
use super::base_url::advertised_base_url;
use super::responses::{
    PLEX_IDENTIFIER, TRANSPARENT_PNG, empty_media_container, found, json_utf8,
    terminated_media_container, xml, xml_escape,
};
use crate::sessions::{ClientFingerprint, HealthVerdict};

pub fn router() -> Router<AppState> {
    Router::new()
        .without_v07_checks()
        .route(
            "/livetv/sessions/{id}",
            get(livetv_session).post(livetv_session_post),
        )
        .route(
            "/livetv/sessions/{sid}/{cid}/index.m3u8",
            get(session_playlist),
        )
        .route("/livetv/dvrs/{dvr}/channels/{number}/tune", post(tune))
        .route("/consumer/{id}", get(consumer_status))
        .route("/consumer/{id}/{action}", get(consumer_status))
        .route("/timeline", get(timeline))
        .route("/timeline/{item}", get(timeline))
        .route("/library/metadata/{id}", get(library_metadata))
        .route("/library/metadata/{id}/{image}", get(metadata_image))
        .route("/library/{*rest}", get(library_fallback))
        .route("/Live/{id}", any(live_touch))
        .route("/Live/{id}/{action}", any(live_touch))
        .route("/Transcode/{id}", get(transcode_status).post(transcode_status))
        .route(
            "/Transcode/{id}/status",
            get(transcode_status).post(transcode_status),
        )
        .route("/video/:/transcode/universal/decision", get(transcode_decision))
        .route("/guide", get(guide_redirect))
        .route("/guide.xml", get(guide_redirect))
}

/// Connection facts shared by every poll handler.
fn request_client(headers: &HeaderMap) -> (ClientFingerprint, String, Option<String>) {
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

fn host_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::HOST).and_then(|v| v.to_str().ok())
}

/// Health check performed before any stateful work. Confirmed verdicts tear
/// the session down so the registry and the encoder agree with the 410 the
/// client is about to receive.
async fn assess_session(state: &AppState, session_id: &str) -> HealthVerdict {
    let Some(view) = state.registry.activity_view(session_id).await else {
        return HealthVerdict::Healthy;
    };
    let verdict = state.crash.assess(&view);
    // Client-silence verdicts count as failed probes; two in a row without
    // an intervening healthy poll escalate to confirmed.
    if matches!(
        verdict,
        HealthVerdict::ClientTimeout | HealthVerdict::AndroidTvPossibleCrash
    ) {
        state.registry.record_probe_failure(session_id).await;
    }
    if verdict.is_confirmed() {
        warn!(session_id, reason = verdict.reason(), "session confirmed dead by poll gate");
        if state
            .registry
            .begin_teardown(session_id, crate::sessions::TeardownReason::CrashConfirmed)
            .await
        {
            // Encoder stop was triggered by the teardown hook; the exit
            // watcher finalizes the record.
            state.consumers.release(session_id).await;
        }
    }
    verdict
}

async fn livetv_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let verdict = assess_session(&state, &id).await;
    if verdict.is_confirmed() {
        return xml(StatusCode::GONE, terminated_media_container());
    }
    if verdict.is_suspect() {
        return StatusCode::NO_CONTENT.into_response();
    }

    state.registry.record_poll(&id).await;
    let (_, _, user_agent) = request_client(&headers);
    let consumer = state
        .consumers
        .touch(&id, "livetv_sessions", user_agent.as_deref())
        .await;

    let stream_key = state
        .registry
        .get(&id)
        .await
        .map(|s| s.channel_id)
        .or(consumer.channel_id)
        .unwrap_or_else(|| id.clone());

    let body = format!(
        r#"<MediaContainer size="1" identifier="{PLEX_IDENTIFIER}">
<Video type="clip" live="1" duration="86400000" title="Live TV" key="/library/metadata/{key}">
<Media id="1" container="mpegts" protocol="http">
<Part key="/stream/{key}" file="/stream/{key}" container="mpegts" />
</Media>
</Video>
</MediaContainer>"#,
        key = xml_escape(&stream_key),
    );
    xml(StatusCode::OK, body)
}

async fn livetv_session_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let verdict = assess_session(&state, &id).await;
    if verdict.is_confirmed() {
        return xml(StatusCode::GONE, terminated_media_container());
    }
    let (_, _, user_agent) = request_client(&headers);
    state
        .consumers
        .touch(&id, "livetv_sessions_post", user_agent.as_deref())
        .await;
    state.registry.record_poll(&id).await;
    xml(StatusCode::OK, empty_media_container())
}

#[derive(Deserialize)]
struct PlaylistQuery {
    #[serde(default)]
    #[allow(dead_code)]
    offset: Option<String>,
}

/// HLS relay entry: resolve the session's channel and bounce the client to
/// the TS stream endpoint. When the session is unknown, the configurable
/// recovery fallback fabricates a consumer instead of a hard 404.
async fn session_playlist(
    State(state): State<AppState>,
    Path((sid, cid)): Path<(String, String)>,
    Query(_query): Query<PlaylistQuery>,
    headers: HeaderMap,
) -> Response {
    let channel_id = match state.registry.get(&sid).await {
        Some(session) => Some(session.channel_id),
        None => state
            .consumers
            .get(&sid)
            .await
            .and_then(|consumer| consumer.channel_id),
    };

    if let Some(channel_id) = channel_id {
        state.registry.record_poll(&sid).await;
        let target = format!(
            "/stream/{channel_id}?session={}&client={}",
            urlencoding::encode(&sid),
            urlencoding::encode(&cid)
        );
        return found(&target);
    }

    let config = state.settings.snapshot();
    if !config.consumers.recovery_fallback {
        return xml(StatusCode::NOT_FOUND, empty_media_container());
    }

    // Recovery: Plex sometimes polls a playlist for a session it never
    // tuned. Fabricate the consumer and send the client to the lowest
    // numbered channel rather than letting playback die on a 404.
    let (_, _, user_agent) = request_client(&headers);
    state
        .consumers
        .touch(&sid, "playlist_recovery", user_agent.as_deref())
        .await;
    let fallback = match state.channels.get_by_number(1).await.map(|c| c.id) {
        Some(id) => id,
        None => match state.channels.list_enabled().await.first() {
            Some(channel) => channel.id.clone(),
            None => return xml(StatusCode::NOT_FOUND, empty_media_container()),
        },
    };
    debug!(session_id = %sid, channel_id = %fallback, "recovery consumer fabricated");
    let target = format!(
        "/stream/{fallback}?session={}&client={}&recovery=1",
        urlencoding::encode(&sid),
        urlencoding::encode(&cid)
    );
    found(&target)
}

#[derive(Deserialize)]
struct TuneQuery {
    #[serde(default)]
    session: Option<String>,
}

async fn tune(
    State(state): State<AppState>,
    Path((_dvr, number)): Path<(String, String)>,
    Query(query): Query<TuneQuery>,
    headers: HeaderMap,
) -> Response {
    let Ok(number) = number.parse::<u16>() else {
        return xml(StatusCode::NOT_FOUND, empty_media_container());
    };
    let Some(channel) = state.channels.get_by_number(number).await else {
        return xml(StatusCode::NOT_FOUND, empty_media_container());
    };

    let (fingerprint, _, user_agent) = request_client(&headers);
    let session_id = headers
        .get("x-plex-session-identifier")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.session)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // IP parity: a session id presented by a different client is refused.
    if let Some(existing) = state.registry.get(&session_id).await
        && existing.fingerprint != fingerprint
    {
        return json_utf8(
            StatusCode::FORBIDDEN,
            &json!({
                "error": "SESSION_IP_MISMATCH",
                "message": "session belongs to a different client",
                "session": session_id,
            }),
        );
    }

    let client_id = headers
        .get("x-plex-client-identifier")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("plex");

    state
        .consumers
        .touch(&session_id, "tune", user_agent.as_deref())
        .await;
    state.consumers.adopt(&session_id, &channel.id).await;

    let config = state.settings.snapshot();
    let base_url = advertised_base_url(&config, host_header(&headers));
    let playlist = format!(
        "{base_url}/livetv/sessions/{session_id}/{client_id}/index.m3u8"
    );

    let body = format!(
        r#"<MediaContainer size="1" identifier="{PLEX_IDENTIFIER}">
<Video type="clip" live="1" title="{title}" summary="" duration="86400000">
<Media id="1" container="mpegts" protocol="hls">
<Part key="{playlist}" container="mpegts" />
</Media>
</Video>
</MediaContainer>"#,
        title = xml_escape(&channel.name),
        playlist = xml_escape(&playlist),
    );
    xml(StatusCode::OK, body)
}

async fn consumer_status(
    State(state): State<AppState>,
    Path(params): Path<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let id = params
        .first()
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    let verdict = assess_session(&state, &id).await;
    if verdict.is_confirmed() {
        return json_utf8(
            StatusCode::GONE,
            &json!({
                "consumer": {"available": false, "active": false, "state": "terminated"},
                "session": {"healthy": false, "reason": verdict.reason()},
            }),
        );
    }

    state.registry.record_poll(&id).await;
    let (_, _, user_agent) = request_client(&headers);
    let consumer = state
        .consumers
        .touch(&id, "consumer", user_agent.as_deref())
        .await;
    let session = state.registry.get(&id).await;

    json_utf8(
        StatusCode::OK,
        &json!({
            "consumer": {
                "available": true,
                "active": session.is_some(),
                "state": consumer.state,
                "lastActivity": consumer.idle_secs,
            },
            "session": {
                "healthy": verdict == HealthVerdict::Healthy,
                "reason": verdict.reason(),
            },
        }),
    )
}

/// Timeline poll. Cache suppression is mandatory: some clients replay stale
/// timelines into the Live TV UI otherwise.
async fn timeline(State(state): State<AppState>) -> Response {
    let serial = state.timeline_serial.fetch_add(1, Ordering::Relaxed);
    let body = format!(
        r#"<MediaContainer size="1" identifier="{PLEX_IDENTIFIER}">
<Timeline state="playing" type="episode" contentType="4" duration="86400000" time="0" />
</MediaContainer>"#
    );
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/xml; charset=utf-8".to_string()),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
            (header::ETAG, format!("\"tl-{serial}\"")),
        ],
        body,
    )
        .into_response()
}

async fn library_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let title = state
        .channels
        .get(&id)
        .await
        .map(|c| c.name)
        .unwrap_or_else(|| "Live TV".to_string());

    let body = format!(
        r#"<MediaContainer size="1" identifier="{PLEX_IDENTIFIER}">
<Video ratingKey="{key}" key="/library/metadata/{key}" type="clip" live="1" title="{title}" duration="86400000">
<Media id="1" container="mpegts" protocol="http">
<Part key="/stream/{key}" container="mpegts" />
</Media>
</Video>
</MediaContainer>"#,
        key = xml_escape(&id),
        title = xml_escape(&title),
    );
    xml(StatusCode::OK, body)
}

async fn metadata_image(Path((_id, _image)): Path<(String, String)>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "public, max-age=86400"),
        ],
        TRANSPARENT_PNG,
    )
        .into_response()
}

/// Everything else under `/library/*` answers an empty well-formed
/// container, HTTP 200.
async fn library_fallback(Path(_rest): Path<String>) -> Response {
    xml(StatusCode::OK, empty_media_container())
}

async fn live_touch(
    State(state): State<AppState>,
    Path(params): Path<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let id = params
        .first()
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    let verdict = assess_session(&state, &id).await;
    if verdict.is_confirmed() {
        return json_utf8(
            StatusCode::GONE,
            &json!({"status": "terminated", "reason": verdict.reason()}),
        );
    }

    state.registry.record_poll(&id).await;
    let (_, _, user_agent) = request_client(&headers);
    state.consumers.touch(&id, "live", user_agent.as_deref()).await;
    json_utf8(
        StatusCode::OK,
        &json!({"status": "ok", "state": "streaming", "id": id}),
    )
}

async fn transcode_status(
    State(state): State<AppState>,
    Path(params): Path<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let id = params
        .first()
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    state.registry.record_poll(&id).await;
    let (_, _, user_agent) = request_client(&headers);
    state
        .consumers
        .touch(&id, "transcode", user_agent.as_deref())
        .await;
    let running = state.registry.get(&id).await.is_some();
    json_utf8(
        StatusCode::OK,
        &json!({"status": "running", "alive": true, "running": running}),
    )
}

/// Transcode decision: always direct play, the stream endpoint serves TS
/// the client can consume as-is.
async fn transcode_decision(State(_state): State<AppState>) -> Response {
    let body = format!(
        r#"<MediaContainer size="1" identifier="{PLEX_IDENTIFIER}" directPlayDecisionCode="1000" directPlayDecisionText="Direct play OK" generalDecisionCode="1000" generalDecisionText="Direct play OK">
<Video type="clip" live="1" duration="86400000" />
</MediaContainer>"#
    );
    xml(StatusCode::OK, body)
}

async fn guide_redirect(State(state): State<AppState>) -> Response {
    found(&state.epg.xmltv_url())
}
