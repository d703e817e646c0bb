//! HDHomeRun device emulation surface
//!
//! Serves the endpoints Plex uses to discover and enumerate a network
//! tuner. Field names and JSON casing are compatibility-critical: the media
//! server parses by literal key. Every endpoint degrades gracefully to a
//! well-formed empty structure; none of them ever answers with HTML.

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use serde::Serialize;
use serde_json::json;
use std::future::Future;

use super::AppState;
use super::base_url::advertised_base_url;
use super::responses::{json_utf8, xml, xml_escape};
use crate::models::Channel;

pub fn router() -> Router<AppState> {
    Router::new()
        .without_v07_checks()
        .route("/discover.json", get(discover_json))
        .route("/auto/hdhr", get(discover_json))
        .route("/device.xml", get(device_xml))
        .route("/device.json", get(device_json))
        .route("/lineup_status.json", get(lineup_status))
        .route("/lineup.json", get(lineup_json))
        .route("/lineup.xml", get(lineup_xml))
        .route("/lineup.post", post(lineup_post))
        .route("/tuner.json", get(tuner_json))
}

#[derive(Serialize, Clone)]
struct Device {
    #[serde(rename = "FriendlyName")]
    friendly_name: String,
    #[serde(rename = "Manufacturer")]
    manufacturer: String,
    #[serde(rename = "ModelNumber")]
    model_number: String,
    #[serde(rename = "ModelName")]
    model_name: String,
    #[serde(rename = "FirmwareName")]
    firmware_name: String,
    #[serde(rename = "FirmwareVersion")]
    firmware_version: String,
    #[serde(rename = "TunerCount")]
    tuner_count: u8,
    #[serde(rename = "DeviceID")]
    id: String,
    #[serde(rename = "DeviceAuth")]
    auth: String,
    #[serde(rename = "BaseURL")]
    base_url: String,
    #[serde(rename = "LineupURL")]
    lineup_url: String,
    #[serde(skip)]
    udn: String,
}

impl Device {
    fn as_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
<specVersion>
<major>1</major>
<minor>0</minor>
</specVersion>
<URLBase>{}</URLBase>
<device>
  <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
  <friendlyName>{}</friendlyName>
  <manufacturer>{}</manufacturer>
  <modelName>{}</modelName>
  <modelNumber>{}</modelNumber>
  <serialNumber>{}</serialNumber>
  <UDN>uuid:{}</UDN>
</device>
</root>"#,
            self.base_url,
            xml_escape(&self.friendly_name),
            xml_escape(&self.manufacturer),
            xml_escape(&self.model_name),
            xml_escape(&self.model_number),
            self.id,
            self.udn
        )
    }
}

fn build_device(state: &AppState, headers: &HeaderMap) -> Device {
    let config = state.settings.snapshot();
    let base_url = advertised_base_url(&config, host_header(headers));
    Device {
        friendly_name: config.device.friendly_name.clone(),
        manufacturer: config.device.manufacturer.clone(),
        model_number: config.device.model_number.clone(),
        model_name: config.device.model_name.clone(),
        firmware_name: config.device.firmware_name.clone(),
        firmware_version: config.device.firmware_version.clone(),
        tuner_count: config.device.tuner_count,
        id: config.device.device_id.clone(),
        auth: String::new(),
        lineup_url: format!("{base_url}/lineup.json"),
        base_url,
        udn: config.device.uuid.clone(),
    }
}

fn host_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::HOST).and_then(|v| v.to_str().ok())
}

/// One lineup entry. `ContentType` 4 is the Live TV clip code; 5 would
/// crash certain clients and is additionally rewritten by the validator.
#[derive(Serialize, Clone)]
pub struct LineupEntry {
    #[serde(rename = "GuideNumber")]
    pub guide_number: String,
    #[serde(rename = "GuideName")]
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "VideoCodec")]
    pub video_codec: String,
    #[serde(rename = "AudioCodec")]
    pub audio_codec: String,
    #[serde(rename = "Container")]
    pub container: String,
    #[serde(rename = "MediaType")]
    pub media_type: String,
    #[serde(rename = "ContentType")]
    pub content_type: u8,
    #[serde(rename = "Live")]
    pub live: bool,
    #[serde(rename = "HD")]
    pub hd: u8,
}

impl LineupEntry {
    fn from_channel(channel: &Channel, base_url: &str) -> Self {
        Self {
            guide_number: channel.number.to_string(),
            guide_name: channel.name.clone(),
            url: format!("{base_url}/stream/{}", channel.id),
            video_codec: "H264".to_string(),
            audio_codec: "AAC".to_string(),
            container: "MPEGTS".to_string(),
            media_type: "LiveTV".to_string(),
            content_type: 4,
            live: true,
            hd: 1,
        }
    }
}

async fn lineup_entries(state: &AppState, headers: &HeaderMap) -> Vec<LineupEntry> {
    let config = state.settings.snapshot();
    let base_url = advertised_base_url(&config, host_header(headers));
    state
        .channels
        .list_enabled()
        .await
        .iter()
        .map(|channel| LineupEntry::from_channel(channel, &base_url))
        .collect()
}

/// Soft deadline on discovery answers: a wedged collaborator produces a 503
/// instead of holding the media server's scan.
const DISCOVERY_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

async fn with_discovery_deadline<F>(fut: F) -> Response
where
    F: Future<Output = Response>,
{
    match tokio::time::timeout(DISCOVERY_DEADLINE, fut).await {
        Ok(response) => response,
        Err(_) => json_utf8(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({"error": "discovery deadline exceeded"}),
        ),
    }
}

async fn discover_json(State(state): State<AppState>, headers: HeaderMap) -> Response {
    json_utf8(StatusCode::OK, &build_device(&state, &headers))
}

async fn device_json(State(state): State<AppState>, headers: HeaderMap) -> Response {
    json_utf8(StatusCode::OK, &build_device(&state, &headers))
}

async fn device_xml(State(state): State<AppState>, headers: HeaderMap) -> Response {
    xml(StatusCode::OK, build_device(&state, &headers).as_xml())
}

async fn lineup_json(State(state): State<AppState>, headers: HeaderMap) -> Response {
    with_discovery_deadline(async {
        json_utf8(StatusCode::OK, &lineup_entries(&state, &headers).await)
    })
    .await
}

/// Rescan trigger. Always immediate, never a long poll; answers the same
/// payload as `lineup.json`.
async fn lineup_post(State(state): State<AppState>, headers: HeaderMap) -> Response {
    json_utf8(StatusCode::OK, &lineup_entries(&state, &headers).await)
}

async fn lineup_xml(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let entries = lineup_entries(&state, &headers).await;
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<Lineup>\n");
    for entry in &entries {
        body.push_str(&format!(
            "  <Program><GuideNumber>{}</GuideNumber><GuideName>{}</GuideName><URL>{}</URL></Program>\n",
            xml_escape(&entry.guide_number),
            xml_escape(&entry.guide_name),
            xml_escape(&entry.url),
        ));
    }
    body.push_str("</Lineup>");
    xml(StatusCode::OK, body)
}

async fn lineup_status(State(state): State<AppState>, _headers: HeaderMap) -> Response {
    with_discovery_deadline(async {
        let config = state.settings.snapshot();
        let program_count = state.epg.program_count().await;
        let metrics = state.registry.metrics().await;

        json_utf8(
            StatusCode::OK,
            &json!({
                "ScanInProgress": 0,
                "ScanPossible": 1,
                "Source": "Cable",
                "SourceList": ["Cable"],
                "UpgradeAvailable": 0,
                "EPGAvailable": program_count > 0,
                "ProgramCount": program_count,
                "Tuners": tuner_states(&metrics, config.device.tuner_count),
            }),
        )
    })
    .await
}

async fn tuner_json(State(state): State<AppState>) -> Response {
    let config = state.settings.snapshot();
    let sessions = state.registry.active_sessions().await;
    let tuners: Vec<_> = (0..config.device.tuner_count)
        .map(|index| {
            let session = sessions.get(index as usize);
            json!({
                "Index": index,
                "InUse": if session.is_some() { 1 } else { 0 },
                "VctNumber": session.map(|s| s.channel_id.clone()).unwrap_or_default(),
                "TargetIP": session.map(|s| s.client_ip.clone()).unwrap_or_default(),
                "BytesTransferred": session.map(|s| s.bytes_transferred).unwrap_or(0),
            })
        })
        .collect();
    json_utf8(StatusCode::OK, &tuners)
}

fn tuner_states(
    metrics: &crate::sessions::ConcurrencyMetrics,
    tuner_count: u8,
) -> Vec<serde_json::Value> {
    (0..tuner_count)
        .map(|index| {
            json!({
                "Index": index,
                "InUse": if (index as u32) < metrics.total { 1 } else { 0 },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineup_entry_carries_the_live_tv_shape() {
        let channel = Channel {
            id: "ch-1".into(),
            number: 5,
            name: "News".into(),
            logo_url: None,
            epg_id: None,
            enabled: true,
        };
        let entry = LineupEntry::from_channel(&channel, "http://192.168.1.10:3000");
        assert_eq!(entry.guide_number, "5");
        assert_eq!(entry.url, "http://192.168.1.10:3000/stream/ch-1");
        assert_eq!(entry.container, "MPEGTS");
        assert_eq!(entry.media_type, "LiveTV");
        assert_eq!(entry.content_type, 4);
        assert!(entry.live);
    }

    #[test]
    fn device_xml_names_the_configured_udn() {
        let device = Device {
            friendly_name: "Bridge".into(),
            manufacturer: "Silicondust".into(),
            model_number: "HDHR4-2US".into(),
            model_name: "HDHomeRun CONNECT".into(),
            firmware_name: "hdhomerun4_atsc".into(),
            firmware_version: "20200907".into(),
            tuner_count: 4,
            id: "TUNERBR1".into(),
            auth: String::new(),
            base_url: "http://192.168.1.10:3000".into(),
            lineup_url: "http://192.168.1.10:3000/lineup.json".into(),
            udn: "1f2a9c7e-0000-4000-8000-deadbeef0001".into(),
        };
        let xml = device.as_xml();
        assert!(xml.contains("<UDN>uuid:1f2a9c7e-0000-4000-8000-deadbeef0001</UDN>"));
        assert!(xml.contains("<URLBase>http://192.168.1.10:3000</URLBase>"));
    }
}
