use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use scoreboard_gateway_lib::api::{router, AppState, INIT_DATA_HEADER};
use scoreboard_gateway_lib::auth::{sign_init_data, AdminAllowList, AuthVerifier};
use scoreboard_gateway_lib::config::StoreConfig;
use scoreboard_gateway_lib::db::ScoreStore;
use scoreboard_gateway_lib::gateway::AdminGateway;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const BOT_TOKEN: &str = "424242:HTTP-FIXTURE";
const ADMIN_ID: i64 = 9001;

struct Fixture {
    _dir: tempfile::TempDir,
    store: ScoreStore,
    app: Router,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ScoreStore::open(&StoreConfig::Sqlite {
        path: dir.path().join("nested").join("factory.db"),
    })
    .await
    .expect("open store");
    store.register(42, "Ann", "Ivanova", 15).await.expect("register");
    store.update_score(42, 10).await.expect("score");
    store.register(43, "Bob", "Petrov", 16).await.expect("register");
    store.update_score(43, 4).await.expect("score");

    let gateway = AdminGateway::new(
        store.clone(),
        AuthVerifier::new(BOT_TOKEN),
        AdminAllowList::new([ADMIN_ID]),
    );
    let app = router(Arc::new(AppState::new(gateway)));
    Fixture { _dir: dir, store, app }
}

fn init_data_for(telegram_id: i64, token: &str) -> String {
    let user = format!(r#"{{"id":{},"first_name":"Fixture"}}"#, telegram_id);
    sign_init_data(&[("auth_date", "1700000000"), ("query_id", "AAF"), ("user", &user)], token)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    let json = serde_json::from_slice(&bytes).expect("json body");
    (status, json)
}

fn get(uri: &str, init_data: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(init_data) = init_data {
        builder = builder.header(INIT_DATA_HEADER, init_data);
    }
    builder.body(Body::empty()).expect("request")
}

fn post(uri: &str, init_data: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(init_data) = init_data {
        builder = builder.header(INIT_DATA_HEADER, init_data);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

#[tokio::test]
async fn health_check_answers_ok() {
    let fixture = fixture().await;
    let (status, body) = send(&fixture.app, get("/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn levels_poll_reports_tokens_and_user_presence() {
    let fixture = fixture().await;

    let (status, body) = send(&fixture.app, get("/api/levels", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["levels"]["quiz"], true);
    assert_eq!(body["reset_token"], "0");
    assert!(body["user_exists"].is_null());
    assert_eq!(body["user_deleted_token"], "0");

    let (_, body) = send(&fixture.app, get("/api/levels?uid=42", None)).await;
    assert_eq!(body["user_exists"], true);

    let (_, body) = send(&fixture.app, get("/api/levels?uid=777", None)).await;
    assert_eq!(body["user_exists"], false);

    let (_, body) = send(&fixture.app, get("/api/levels?uid=not-a-number", None)).await;
    assert!(body["user_exists"].is_null());
}

#[tokio::test]
async fn deleted_user_sees_deletion_token_on_levels_poll() {
    let fixture = fixture().await;
    let admin = init_data_for(ADMIN_ID, BOT_TOKEN);

    let (status, receipt) = send(
        &fixture.app,
        post("/api/admin/delete_user", Some(&admin), r#"{"telegram_id":43}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["ok"], true);
    assert_eq!(receipt["telegram_id"], 43);

    let (_, body) = send(&fixture.app, get("/api/levels?uid=43", None)).await;
    assert_eq!(body["user_exists"], false);
    assert_ne!(body["user_deleted_token"], "0");
    assert_eq!(body["reset_token"], receipt["global_token"]);
}

#[tokio::test]
async fn profile_requires_a_valid_signature() {
    let fixture = fixture().await;

    let (status, body) = send(&fixture.app, get("/api/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["ok"], false);

    let forged = init_data_for(42, "some-other-token");
    let (status, _) = send(&fixture.app, get("/api/me", Some(&forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let player = init_data_for(42, BOT_TOKEN);
    let (status, body) = send(&fixture.app, get("/api/me", Some(&player))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exists"], true);
    assert_eq!(body["user"]["telegram_id"], 42);
    assert_eq!(body["user"]["score"], 10);
    assert_eq!(body["reset_token"], "0");
}

#[tokio::test]
async fn non_admin_is_forbidden_and_changes_nothing() {
    let fixture = fixture().await;
    let player = init_data_for(42, BOT_TOKEN);

    let (status, body) = send(&fixture.app, post("/api/admin/reset_scores", Some(&player), "{}")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["ok"], false);

    let (status, _) = send(&fixture.app, post("/api/admin/delete_all_users", None, "{}")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let user = fixture.store.get_user(42).await.expect("get").expect("exists");
    assert_eq!(user.score, 10);
    assert_eq!(fixture.store.count_users().await.expect("count"), 2);
    assert_eq!(fixture.store.ledger().global_token().await, "0");
}

#[tokio::test]
async fn whoami_accepts_init_data_from_query() {
    let fixture = fixture().await;
    let admin = init_data_for(ADMIN_ID, BOT_TOKEN);
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("initData", &admin)
        .finish();

    let (status, body) = send(&fixture.app, get(&format!("/api/admin/whoami?{}", query), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], ADMIN_ID);
    assert_eq!(body["is_admin"], true);
}

#[tokio::test]
async fn missing_target_is_bad_request() {
    let fixture = fixture().await;
    let admin = init_data_for(ADMIN_ID, BOT_TOKEN);

    let (status, body) = send(&fixture.app, post("/api/admin/reset_user_scores", Some(&admin), "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let (status, _) = send(&fixture.app, post("/api/admin/delete_user", Some(&admin), "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &fixture.app,
        post("/api/admin/set_level", Some(&admin), r#"{"level_key":"quiz"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_flow_resets_and_toggles() {
    let fixture = fixture().await;
    let admin = init_data_for(ADMIN_ID, BOT_TOKEN);

    let (status, stats) = send(&fixture.app, get("/api/admin/stats", Some(&admin))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 2);
    assert_eq!(stats["users"].as_array().map(Vec::len), Some(2));
    let global_before = stats["global_token"].clone();

    let (status, receipt) = send(
        &fixture.app,
        post("/api/admin/reset_user_scores", Some(&admin), r#"{"telegram_id":42}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["global_token"], global_before);
    let player = init_data_for(42, BOT_TOKEN);
    let (_, me) = send(&fixture.app, get("/api/me", Some(&player))).await;
    assert_eq!(me["user"]["score"], 0);
    assert_eq!(me["reset_token"], receipt["reset_token"]);

    let (status, receipt) = send(
        &fixture.app,
        post("/api/admin/set_level", Some(&admin), r#"{"level_key":"jumper","is_active":false}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["is_active"], false);
    let (_, levels) = send(&fixture.app, get("/api/levels", None)).await;
    assert_eq!(levels["levels"]["jumper"], false);

    let (status, receipt) = send(&fixture.app, post("/api/admin/reset_scores", Some(&admin), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(receipt["global_token"], global_before);
    assert_eq!(fixture.store.get_user(43).await.expect("get").expect("exists").score, 0);

    let (status, receipt) = send(&fixture.app, post("/api/admin/delete_all_users", Some(&admin), "{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["ok"], true);
    assert_eq!(fixture.store.count_users().await.expect("count"), 0);
}

#[tokio::test]
async fn closed_store_answers_service_unavailable_with_retry_hint() {
    let fixture = fixture().await;
    fixture.store.close().await;
    let admin = init_data_for(ADMIN_ID, BOT_TOKEN);

    for request in [get("/api/admin/stats", Some(&admin)), get("/api/levels?uid=42", None)] {
        let response = fixture.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok()),
            Some("5")
        );
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        let body: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["ok"], false);
        assert_eq!(body["retryable"], true);
        assert_eq!(body["error"], "store temporarily unavailable");
    }

    let (status, _) = send(&fixture.app, get("/api/admin/stats", Some(&init_data_for(7, BOT_TOKEN)))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
