//! HTTP session service client against a stub server.

#![cfg(feature = "http-api")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use p2ps_core::api::fetch_config_or_fallback;
use p2ps_core::harness::LocalPair;
use p2ps_core::{
    ApiCredentials, ApiError, ConfigSource, EndpointSettings, FlowSettings, HttpSessionApi, RtcConfig, SessionApi,
    TopicAddress,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Seen {
    create: Arc<Mutex<Option<(HeaderMap, Value)>>>,
}

async fn create(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    *seen.create.lock().unwrap() = Some((headers, body));
    Json(json!({ "code": 0, "data": { "sessionId": "s-http" } }))
}

async fn status(Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "sessionId": id, "status": "active" }))
}

async fn config_ok(Path(_id): Path<String>) -> Json<Value> {
    Json(json!({
        "data": {
            "stunServers": ["stun:10.0.0.1:3478"],
            "turnServers": [],
            "rtcConfiguration": { "iceCandidatePoolSize": 4 },
            "extraConfig": "{\"keepAliveInterval\":5000}"
        }
    }))
}

async fn config_broken(Path(_id): Path<String>) -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn router(seen: Seen, healthy_config: bool) -> Router {
    let config = if healthy_config {
        get(config_ok)
    } else {
        get(config_broken)
    };
    Router::new()
        .route("/session", post(create))
        .route("/session/:id/status", get(status))
        .route("/session/:id/config", config)
        .with_state(seen)
}

fn client(base: &str) -> HttpSessionApi {
    HttpSessionApi::new(format!("{base}/"), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_create_session_sends_device_and_headers() {
    let seen = Seen::default();
    let base = serve(router(seen.clone(), true)).await;
    let api = client(&base).with_credentials(ApiCredentials {
        bearer: Some("jwt".into()),
        token: Some("tok".into()),
        source: Some("app".into()),
    });
    assert_eq!(api.base_url(), base);

    let sid = api.create_session("AF070135F064641AG").await.unwrap();
    assert_eq!(sid, "s-http");

    let (headers, body) = seen.create.lock().unwrap().clone().unwrap();
    assert_eq!(body["deviceId"], "AF070135F064641AG");
    assert_eq!(body["deviceSn"], "AF070135F064641AG");
    assert_eq!(headers["authorization"], "Bearer jwt");
    assert_eq!(headers["token"], "tok");
    assert_eq!(headers["source"], "app");
}

#[tokio::test]
async fn test_status_and_wrapped_config() {
    let base = serve(router(Seen::default(), true)).await;
    let api = client(&base);

    let status = api.session_status("s-http").await.unwrap();
    assert_eq!(status["status"], "active");

    let config = api.session_config("s-http").await.unwrap();
    assert_eq!(config.stun_servers, vec!["stun:10.0.0.1:3478"]);
    assert_eq!(config.keepalive_interval(), Duration::from_millis(5000));
    let rtc: Value = serde_json::from_str(config.rtc_configuration.as_deref().unwrap()).unwrap();
    assert_eq!(rtc["iceCandidatePoolSize"], 4);
}

#[tokio::test]
async fn test_config_500_falls_back() {
    let base = serve(router(Seen::default(), false)).await;
    let api = client(&base);

    assert!(matches!(
        api.session_config("s-http").await,
        Err(ApiError::Status { status: 500, .. })
    ));
    let (config, source) = fetch_config_or_fallback(&api, "s-http").await;
    assert_eq!(source, ConfigSource::Fallback);
    assert_eq!(config, RtcConfig::fallback());
    assert_eq!(config.stun_servers.len(), 1);
    assert_eq!(config.turn_servers.len(), 1);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let base = serve(Router::new()).await;
    let api = client(&base);
    assert!(matches!(api.session_status("x").await, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn test_flow_proceeds_on_fallback_config() {
    let base = serve(router(Seen::default(), false)).await;
    let topics = TopicAddress::new("PLAF204", "AF070135F064641AG").unwrap();

    let mut app = EndpointSettings::app(topics.clone(), "188815492");
    app.flow = FlowSettings {
        after_offer: Duration::from_millis(50),
        after_candidate: Duration::from_millis(100),
        ready_timeout: Duration::from_secs(5),
    };
    let api: Arc<dyn SessionApi> = Arc::new(client(&base));
    let pair = LocalPair::start(app, EndpointSettings::device(topics), Some(api))
        .await
        .unwrap();

    let sid = pair.app.run_automated().await.unwrap();
    assert_eq!(sid, "s-http");

    let snapshot = pair.app.snapshot().await;
    assert_eq!(snapshot.config_source, Some(ConfigSource::Fallback));
    assert_eq!(snapshot.config, Some(RtcConfig::fallback()));
    assert!(snapshot.session.unwrap().is_connected());
    assert_eq!(pair.device.snapshot().await.config, Some(RtcConfig::fallback()));
}
