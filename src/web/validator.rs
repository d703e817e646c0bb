//! Metadata shape enforcement
//!
//! Specific client builds crash when Live TV content arrives tagged with
//! type code 5 ("trailer"). Every handler already emits the correct code 4,
//! but this interceptor is the last line of defense: it rewrites any JSON or
//! XML body leaving the device/compat surfaces, and records what it caught
//! in a bounded ring buffer for operator debugging.

use std::collections::VecDeque;
use std::sync::Mutex;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use tracing::warn;

/// Field names whose numeric value 5 must become 4.
const TYPE_FIELDS: &[&str] = &["type", "contentType", "content_type", "mediaType"];

/// String type tags Plex interprets as type code 5 on Live TV.
const FORBIDDEN_STRINGS: &[&str] = &["trailer", "movie"];

const RING_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct ValidatorEvent {
    pub kind: String,
    pub path: String,
    pub count: u64,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
pub struct MetadataValidator {
    events: Mutex<VecDeque<ValidatorEvent>>,
}

impl MetadataValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite forbidden type codes in a JSON tree. Returns the number of
    /// replacements.
    pub fn sanitize_json(&self, path: &str, value: &mut serde_json::Value) -> u64 {
        let count = rewrite_json(value);
        if count > 0 {
            warn!(path, count, "rewrote forbidden type codes in JSON response");
            self.record("json_type_code", path, count);
        }
        count
    }

    /// Rewrite forbidden type codes in raw XML attribute text.
    pub fn sanitize_xml(&self, path: &str, body: &str) -> (String, u64) {
        let mut out = body.to_string();
        let mut count = 0u64;

        for field in TYPE_FIELDS {
            for quote in ['"', '\''] {
                let needle = format!("{field}={quote}5{quote}");
                let replacement = format!("{field}={quote}4{quote}");
                count += count_occurrences(&out, &needle);
                out = out.replace(&needle, &replacement);

                for forbidden in FORBIDDEN_STRINGS {
                    let needle = format!("{field}={quote}{forbidden}{quote}");
                    let replacement = format!("{field}={quote}clip{quote}");
                    count += count_occurrences(&out, &needle);
                    out = out.replace(&needle, &replacement);
                }
            }
        }

        if count > 0 {
            warn!(path, count, "rewrote forbidden type codes in XML response");
            self.record("xml_type_code", path, count);
        }
        (out, count)
    }

    /// Drain-free view of the ring buffer, oldest first.
    pub fn events(&self) -> Vec<ValidatorEvent> {
        self.events
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, kind: &str, path: &str, count: u64) {
        if let Ok(mut ring) = self.events.lock() {
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(ValidatorEvent {
                kind: kind.to_string(),
                path: path.to_string(),
                count,
                at: chrono::Utc::now(),
            });
        }
    }
}

fn rewrite_json(value: &mut serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Object(map) => {
            let mut count = 0;
            for (key, entry) in map.iter_mut() {
                if TYPE_FIELDS.contains(&key.as_str()) {
                    if entry.as_i64() == Some(5) || entry.as_u64() == Some(5) {
                        *entry = serde_json::Value::from(4);
                        count += 1;
                        continue;
                    }
                    if let Some(s) = entry.as_str()
                        && FORBIDDEN_STRINGS.contains(&s)
                    {
                        *entry = serde_json::Value::from("clip");
                        count += 1;
                        continue;
                    }
                }
                count += rewrite_json(entry);
            }
            count
        }
        serde_json::Value::Array(items) => items.iter_mut().map(rewrite_json).sum(),
        _ => 0,
    }
}

fn count_occurrences(haystack: &str, needle: &str) -> u64 {
    haystack.matches(needle).count() as u64
}

/// Axum middleware applying the rewrite to every JSON/XML response leaving
/// the wrapped routes.
pub async fn validate_response(
    State(validator): State<std::sync::Arc<MetadataValidator>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_json = content_type.contains("json");
    let is_xml = content_type.contains("xml");
    if !is_json && !is_xml {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    let rewritten = if is_json {
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(mut value) => {
                if validator.sanitize_json(&path, &mut value) > 0 {
                    serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec())
                } else {
                    bytes.to_vec()
                }
            }
            Err(_) => bytes.to_vec(),
        }
    } else {
        let text = String::from_utf8_lossy(&bytes);
        let (out, count) = validator.sanitize_xml(&path, &text);
        if count > 0 {
            out.into_bytes()
        } else {
            bytes.to_vec()
        }
    };

    let mut response = Response::from_parts(parts, Body::from(rewritten));
    // Length may have changed after the rewrite.
    response.headers_mut().remove(header::CONTENT_LENGTH);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    #[tracing_test::traced_test]
    fn json_type_five_becomes_four_at_any_depth() {
        let validator = MetadataValidator::new();
        let mut value = json!({
            "type": 5,
            "Media": [{"contentType": 5, "Part": [{"mediaType": 5}]}],
            "Meta": {"content_type": 5},
            "duration": 5
        });
        let count = validator.sanitize_json("/synthetic", &mut value);
        assert_eq!(count, 4);
        assert_eq!(value["type"], 4);
        assert_eq!(value["Media"][0]["contentType"], 4);
        assert_eq!(value["Media"][0]["Part"][0]["mediaType"], 4);
        assert_eq!(value["Meta"]["content_type"], 4);
        // Unmonitored fields are untouched.
        assert_eq!(value["duration"], 5);
        assert!(logs_contain("rewrote forbidden type codes"));
    }

    #[test]
    fn json_forbidden_strings_become_clip() {
        let validator = MetadataValidator::new();
        let mut value = json!({"type": "trailer", "Media": [{"type": "movie"}], "title": "trailer"});
        let count = validator.sanitize_json("/synthetic", &mut value);
        assert_eq!(count, 2);
        assert_eq!(value["type"], "clip");
        assert_eq!(value["Media"][0]["type"], "clip");
        assert_eq!(value["title"], "trailer");
    }

    #[test]
    fn xml_attributes_are_rewritten() {
        let validator = MetadataValidator::new();
        let body = r#"<MediaContainer size="1"><Video type="5" contentType="5" duration="5"><Media type="trailer"/></Video></MediaContainer>"#;
        let (out, count) = validator.sanitize_xml("/synthetic", body);
        assert_eq!(count, 3);
        assert!(out.contains(r#"type="4""#));
        assert!(out.contains(r#"contentType="4""#));
        assert!(out.contains(r#"type="clip""#));
        assert!(out.contains(r#"duration="5""#));
    }

    #[test]
    fn events_land_in_ring_buffer() {
        let validator = MetadataValidator::new();
        let mut value = json!({"type": 5});
        validator.sanitize_json("/timeline/1", &mut value);

        let events = validator.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, "/timeline/1");
        assert_eq!(events[0].count, 1);
    }

    #[test]
    fn clean_payloads_record_nothing() {
        let validator = MetadataValidator::new();
        let mut value = json!({"type": 4, "contentType": 4});
        assert_eq!(validator.sanitize_json("/clean", &mut value), 0);
        assert!(validator.events().is_empty());
    }
}
