//! Device-surface contract tests: discovery, lineup shape, and the metadata
//! validator fail-safe.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

use tuner_bridge::config::Config;
use tuner_bridge::models::{Channel, ChannelStream, StreamFormat};
use tuner_bridge::services::{InMemoryChannelStore, NoopEpgService};
use tuner_bridge::web::{AppState, MetadataValidator, build_router};

fn test_config() -> Config {
    let mut config = Config::default();
    config.web.base_url = Some("http://192.168.1.10:3000".into());
    config.web.port = 3000;
    config.device.uuid = "1f2a9c7e-0000-4000-8000-deadbeef0001".into();
    config.device.device_id = "TUNERBR1".into();
    config
}

async fn seeded_state(config: Config) -> AppState {
    let store = InMemoryChannelStore::new();
    store
        .replace(
            vec![
                Channel {
                    id: "ch-1".into(),
                    number: 5,
                    name: "News".into(),
                    logo_url: None,
                    epg_id: None,
                    enabled: true,
                },
                Channel {
                    id: "ch-2".into(),
                    number: 6,
                    name: "Sports".into(),
                    logo_url: None,
                    epg_id: None,
                    enabled: false,
                },
                Channel {
                    id: "ch-3".into(),
                    number: 7,
                    name: "Movies (no stream)".into(),
                    logo_url: None,
                    epg_id: None,
                    enabled: true,
                },
            ],
            vec![
                ChannelStream {
                    channel_id: "ch-1".into(),
                    url: "http://upstream.example/news.m3u8".into(),
                    format: StreamFormat::Hls,
                    backup_urls: vec![],
                    username: None,
                    password: None,
                    headers: HashMap::new(),
                    options: HashMap::new(),
                    enabled: true,
                },
                ChannelStream {
                    channel_id: "ch-2".into(),
                    url: "http://upstream.example/sports.m3u8".into(),
                    format: StreamFormat::Hls,
                    backup_urls: vec![],
                    username: None,
                    password: None,
                    headers: HashMap::new(),
                    options: HashMap::new(),
                    enabled: true,
                },
                ChannelStream {
                    channel_id: "ch-3".into(),
                    url: "http://upstream.example/movies.m3u8".into(),
                    format: StreamFormat::Hls,
                    backup_urls: vec![],
                    username: None,
                    password: None,
                    headers: HashMap::new(),
                    options: HashMap::new(),
                    enabled: false,
                },
            ],
        )
        .await;

    AppState::from_parts(
        config,
        Arc::new(store),
        Arc::new(NoopEpgService::new("http://192.168.1.10:3000/xmltv/guide.xml")),
    )
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    let json = serde_json::from_slice(&body).unwrap_or(json!({}));
    (status, json)
}

#[tokio::test]
async fn discovery_advertises_configured_base_url() {
    let app = build_router(seeded_state(test_config()).await);

    let (status, body) = get_json(&app, "/discover.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["BaseURL"], "http://192.168.1.10:3000");
    assert_eq!(body["LineupURL"], "http://192.168.1.10:3000/lineup.json");
    assert_eq!(body["DeviceID"], "TUNERBR1");
    assert_eq!(body["TunerCount"], 4);

    // The alias answers the same payload.
    let (_, alias) = get_json(&app, "/auto/hdhr").await;
    assert_eq!(alias, body);
}

#[tokio::test]
async fn device_xml_carries_the_configured_udn() {
    let app = build_router(seeded_state(test_config()).await);

    let (status, body) = get(&app, "/device.xml").await;
    assert_eq!(status, StatusCode::OK);
    let xml = String::from_utf8(body).unwrap();
    assert!(xml.contains("<UDN>uuid:1f2a9c7e-0000-4000-8000-deadbeef0001</UDN>"));
    assert!(xml.contains("<URLBase>http://192.168.1.10:3000</URLBase>"));
}

#[tokio::test]
async fn lineup_contains_exactly_the_enabled_channels() {
    let app = build_router(seeded_state(test_config()).await);

    let (status, body) = get_json(&app, "/lineup.json").await;
    assert_eq!(status, StatusCode::OK);

    let entries = body.as_array().expect("lineup must be an array");
    // ch-2 is disabled, ch-3 has no enabled stream.
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry["GuideNumber"], "5");
    assert_eq!(entry["GuideName"], "News");
    assert_eq!(entry["URL"], "http://192.168.1.10:3000/stream/ch-1");
    assert_eq!(entry["Container"], "MPEGTS");
    assert_eq!(entry["MediaType"], "LiveTV");
    assert_eq!(entry["ContentType"], 4);
    assert_eq!(entry["Live"], true);
}

#[tokio::test]
async fn lineup_post_matches_lineup_json() {
    let app = build_router(seeded_state(test_config()).await);

    let rescan = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/lineup.post")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rescan.status(), StatusCode::OK);
    let rescan_body = axum::body::to_bytes(rescan.into_body(), usize::MAX)
        .await
        .unwrap();

    let (_, lineup_body) = get(&app, "/lineup.json").await;
    assert_eq!(rescan_body.to_vec(), lineup_body);
}

#[tokio::test]
async fn lineup_status_reports_scan_idle() {
    let app = build_router(seeded_state(test_config()).await);

    let (status, body) = get_json(&app, "/lineup_status.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ScanInProgress"], 0);
    assert_eq!(body["ScanPossible"], 1);
    assert_eq!(body["SourceList"], json!(["Cable"]));
    assert_eq!(body["Tuners"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn tuner_json_is_idle_without_sessions() {
    let app = build_router(seeded_state(test_config()).await);

    let (status, body) = get_json(&app, "/tuner.json").await;
    assert_eq!(status, StatusCode::OK);
    let tuners = body.as_array().unwrap();
    assert_eq!(tuners.len(), 4);
    assert!(tuners.iter().all(|t| t["InUse"] == 0));
}

#[tokio::test]
async fn timeline_suppresses_caching_and_varies_etag() {
    let app = build_router(seeded_state(test_config()).await);

    let first = app
        .clone()
        .oneshot(Request::builder().uri("/timeline/1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first.headers().get("cache-control").unwrap(),
        "no-store, no-cache, must-revalidate"
    );
    let etag1 = first.headers().get("etag").unwrap().clone();

    let second = app
        .clone()
        .oneshot(Request::builder().uri("/timeline/1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let etag2 = second.headers().get("etag").unwrap().clone();
    assert_ne!(etag1, etag2);

    let body = axum::body::to_bytes(first.into_body(), usize::MAX)
        .await
        .unwrap();
    let xml = String::from_utf8(body.to_vec()).unwrap();
    assert!(xml.contains(r#"state="playing""#));
    assert!(xml.contains(r#"contentType="4""#));
    assert!(!xml.contains(r#"contentType="5""#));
}

#[tokio::test]
async fn library_fallback_is_a_well_formed_empty_container() {
    let app = build_router(seeded_state(test_config()).await);

    let (status, body) = get(&app, "/library/sections/unknown/all").await;
    assert_eq!(status, StatusCode::OK);
    let xml = String::from_utf8(body).unwrap();
    assert!(xml.contains(r#"<MediaContainer size="0""#));
}

#[tokio::test]
async fn metadata_image_is_a_cached_png() {
    let app = build_router(seeded_state(test_config()).await);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/library/metadata/ch-1/thumb")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/png");
    assert!(
        response
            .headers()
            .get("cache-control")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("max-age")
    );
}

#[tokio::test]
async fn guide_redirects_to_the_xmltv_collaborator() {
    let app = build_router(seeded_state(test_config()).await);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/guide").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "http://192.168.1.10:3000/xmltv/guide.xml"
    );
}

/// Validator fail-safe: a synthetic handler that intentionally emits the
/// forbidden type code must never reach the client with it.
#[tokio::test]
async fn validator_rewrites_forbidden_type_codes_end_to_end() {
    use axum::routing::get as get_route;

    let validator = Arc::new(MetadataValidator::new());
    let app: Router = Router::new()
        .route(
            "/synthetic",
            get_route(|| async {
                axum::response::Response::builder()
                    .header("content-type", "application/json; charset=utf-8")
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "type": 5,
                            "Media": [{"contentType": 5}],
                            "title": "unchanged"
                        }))
                        .unwrap(),
                    ))
                    .unwrap()
            }),
        )
        .layer(axum::middleware::from_fn_with_state(
            validator.clone(),
            tuner_bridge::web::validator::validate_response,
        ));

    let (status, body) = get_json(&app, "/synthetic").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], 4);
    assert_eq!(body["Media"][0]["contentType"], 4);
    assert_eq!(body["title"], "unchanged");

    let events = validator.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].count, 2);
}
