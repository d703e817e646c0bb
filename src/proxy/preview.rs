//! Preview relay for the admin surface
//!
//! `GET /preview/:channelId` plays a channel in a browser without touching
//! the tuner path. Playlist formats (HLS/DASH) are relayed directly with
//! their own MIME type; continuous formats are remuxed to a web-playable
//! fragmented MP4. The direct relay falls back to the remux path on any
//! upstream error.

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::models::{ChannelStream, StreamFormat};
use crate::transcoder::{EncoderCommandBuilder, OutputFormat};
use crate::web::AppState;
use crate::web::responses::stream_error;

pub async fn preview_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Response {
    let Some(upstream) = state.channels.enabled_stream(&channel_id).await else {
        return stream_error(
            StatusCode::NOT_FOUND,
            "no_enabled_stream",
            format!("channel {channel_id} has no enabled stream"),
            None,
        );
    };

    if upstream.format.is_playlist_based() {
        match direct_relay(&upstream).await {
            Ok(response) => return response,
            Err(e) => {
                warn!(channel_id, error = %e, "direct relay failed, falling back to remux");
            }
        }
    }

    remux_preview(&state, &channel_id, &upstream).await
}

/// Pass playlist bytes through with the right MIME so the browser's player
/// fetches segments itself.
async fn direct_relay(upstream: &ChannelStream) -> Result<Response, reqwest::Error> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(3))
        .build()?;
    let resp = client.get(&upstream.url).send().await?.error_for_status()?;

    let content_type = match upstream.format {
        StreamFormat::Hls => "application/vnd.apple.mpegurl",
        StreamFormat::Dash => "application/dash+xml",
        _ => "application/octet-stream",
    };

    debug!(url = %upstream.url, content_type, "direct preview relay");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-store"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        axum::body::Body::from_stream(resp.bytes_stream()),
    )
        .into_response())
}

/// Remux through the encoder into fragmented MP4. No session accounting:
/// previews are operator traffic, not tuner traffic.
async fn remux_preview(
    state: &AppState,
    channel_id: &str,
    upstream: &ChannelStream,
) -> Response {
    let profile = state
        .analyzer
        .analyze(&upstream.url, Some(upstream.format))
        .await;
    let args =
        EncoderCommandBuilder::build_args(&profile, upstream, &upstream.url, OutputFormat::WebCompat);

    let preview_id = format!("preview-{channel_id}-{}", uuid::Uuid::new_v4());
    let mut encoder = match state.supervisor.spawn(&preview_id, args).await {
        Ok(encoder) => encoder,
        Err(e) => {
            return stream_error(StatusCode::BAD_GATEWAY, "encoder_failed", e.to_string(), None);
        }
    };

    let mut chunks = encoder.take_chunks();
    let stop_tx = encoder.stop_sender();
    let body = async_stream::stream! {
        let _stop_on_drop = StopOnDrop(stop_tx);
        while let Some(chunk) = chunks.recv().await {
            yield Ok::<_, std::io::Error>(chunk);
        }
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp4"),
            (header::CACHE_CONTROL, "no-store"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        axum::body::Body::from_stream(body),
    )
        .into_response()
}

struct StopOnDrop(tokio::sync::mpsc::Sender<crate::transcoder::EncoderEvent>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let _ = self.0.try_send(crate::transcoder::EncoderEvent::Stop);
    }
}
