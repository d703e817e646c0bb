//! HTTP response types and utilities
//!
//! The polling surfaces must never answer with HTML or a bare 500: every
//! path, including errors, produces a syntactically valid envelope for its
//! endpoint family. The helpers here are the single source of those
//! envelopes.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Plex parses MediaContainer envelopes by this identifier.
pub const PLEX_IDENTIFIER: &str = "com.plexapp.plugins.library";

/// A 1x1 transparent PNG, served for metadata art requests.
pub const TRANSPARENT_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// JSON with the explicit charset the device surface is parsed with.
pub fn json_utf8<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        // Serialization of our own shapes cannot fail; degrade to an empty
        // object rather than HTML.
        Err(_) => (
            status,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            "{}",
        )
            .into_response(),
    }
}

/// An XML response body with the MediaContainer content type.
pub fn xml(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

/// The empty-but-valid MediaContainer every unknown or failed poll receives.
pub fn empty_media_container() -> String {
    format!(r#"<MediaContainer size="0" identifier="{PLEX_IDENTIFIER}" />"#)
}

/// Terminal envelope for sessions with a confirmed-crash verdict.
pub fn terminated_media_container() -> String {
    format!(
        r#"<MediaContainer size="0" identifier="{PLEX_IDENTIFIER}" error="Session terminated" />"#
    )
}

/// JSON error body used by the stream admission path.
#[derive(Debug, Serialize)]
pub struct StreamErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

pub fn stream_error(
    status: StatusCode,
    error: &'static str,
    message: impl Into<String>,
    session: Option<String>,
) -> Response {
    json_utf8(
        status,
        &StreamErrorBody {
            error,
            message: message.into(),
            session,
        },
    )
}

/// XML attribute escaping for values interpolated into envelopes.
pub fn xml_escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// A real 302; Plex's tuner client does not follow 307/308 for playlists.
pub fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_container_is_well_formed() {
        let body = empty_media_container();
        assert!(body.starts_with("<MediaContainer"));
        assert!(body.contains(PLEX_IDENTIFIER));
        assert!(body.ends_with("/>"));
    }

    #[test]
    fn escape_covers_attribute_breakers() {
        assert_eq!(xml_escape(r#"News & "More" <4>"#), "News &amp; &quot;More&quot; &lt;4&gt;");
    }

    #[test]
    fn transparent_png_has_magic() {
        assert_eq!(&TRANSPARENT_PNG[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    }
}
