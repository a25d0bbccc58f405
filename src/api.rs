use crate::db::ScoreStore;
use crate::gateway::{AdminGateway, GatewayError};
use crate::models::{
    LevelReceipt, LevelsSnapshot, MutationReceipt, ProfileSnapshot, SetLevelPayload, StatsResponse, TargetUserPayload,
    WhoAmI, EMPTY_TOKEN,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub const INIT_DATA_HEADER: &str = "x-telegram-initdata";

pub struct AppState {
    pub store: ScoreStore,
    pub gateway: AdminGateway,
}

impl AppState {
    pub fn new(gateway: AdminGateway) -> Self {
        Self {
            store: gateway.store().clone(),
            gateway,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/levels", get(get_levels))
        .route("/api/me", get(get_me))
        .route("/api/admin/whoami", get(admin_whoami))
        .route("/api/admin/stats", get(admin_stats))
        .route("/api/admin/set_level", post(admin_set_level))
        .route("/api/admin/reset_scores", post(admin_reset_scores))
        .route("/api/admin/reset_user_scores", post(admin_reset_user_scores))
        .route("/api/admin/delete_user", post(admin_delete_user))
        .route("/api/admin/delete_all_users", post(admin_delete_all_users))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let mut body = serde_json::json!({ "ok": false, "error": self.client_message() });
        let retry_after = self.retry_after_secs();
        if retry_after.is_some() {
            body["retryable"] = serde_json::Value::Bool(true);
        }
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LevelsQuery {
    pub uid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InitDataQuery {
    #[serde(rename = "initData")]
    pub init_data: Option<String>,
}

fn header_init_data(headers: &HeaderMap) -> Option<String> {
    headers
        .get(INIT_DATA_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

// Header first, then the `initData` query parameter.
fn init_data(headers: &HeaderMap, query: &InitDataQuery) -> Option<String> {
    header_init_data(headers).or_else(|| {
        query
            .init_data
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

// Blank bodies read as defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|error| GatewayError::BadRequest(format!("invalid JSON body: {}", error)))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn get_levels(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LevelsQuery>,
) -> Result<Json<LevelsSnapshot>, GatewayError> {
    let levels = state.store.get_levels().await?;
    let ledger = state.store.ledger();
    let uid = query.uid.as_deref().and_then(|raw| raw.trim().parse::<i64>().ok());

    let (user_exists, user_deleted_token) = match uid {
        Some(uid) => {
            let exists = match state.store.get_user(uid).await {
                Ok(user) => Some(user.is_some()),
                Err(error) => {
                    tracing::warn!(uid, error = %error, "user lookup failed for levels poll");
                    None
                }
            };
            (exists, ledger.deletion_token(uid).await)
        }
        None => (None, EMPTY_TOKEN.to_string()),
    };

    Ok(Json(LevelsSnapshot {
        levels,
        reset_token: ledger.global_token().await,
        user_exists,
        user_deleted_token,
    }))
}

async fn get_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<ProfileSnapshot>, GatewayError> {
    let init_data = header_init_data(&headers);
    Ok(Json(state.gateway.profile(init_data.as_deref()).await?))
}

async fn admin_whoami(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InitDataQuery>,
) -> Result<Json<WhoAmI>, GatewayError> {
    let init_data = init_data(&headers, &query);
    Ok(Json(state.gateway.whoami(init_data.as_deref())?))
}

async fn admin_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InitDataQuery>,
) -> Result<Json<StatsResponse>, GatewayError> {
    let session = state.gateway.authorize(init_data(&headers, &query).as_deref())?;
    Ok(Json(state.gateway.stats(&session).await?))
}

async fn admin_set_level(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InitDataQuery>,
    body: Bytes,
) -> Result<Json<LevelReceipt>, GatewayError> {
    let session = state.gateway.authorize(init_data(&headers, &query).as_deref())?;
    let payload: SetLevelPayload = parse_body(&body)?;
    Ok(Json(state.gateway.set_level(&session, payload).await?))
}

async fn admin_reset_scores(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InitDataQuery>,
) -> Result<Json<MutationReceipt>, GatewayError> {
    let session = state.gateway.authorize(init_data(&headers, &query).as_deref())?;
    Ok(Json(state.gateway.reset_scores(&session).await?))
}

async fn admin_reset_user_scores(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InitDataQuery>,
    body: Bytes,
) -> Result<Json<MutationReceipt>, GatewayError> {
    let session = state.gateway.authorize(init_data(&headers, &query).as_deref())?;
    let payload: TargetUserPayload = parse_body(&body)?;
    Ok(Json(state.gateway.reset_user_scores(&session, payload).await?))
}

async fn admin_delete_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InitDataQuery>,
    body: Bytes,
) -> Result<Json<MutationReceipt>, GatewayError> {
    let session = state.gateway.authorize(init_data(&headers, &query).as_deref())?;
    let payload: TargetUserPayload = parse_body(&body)?;
    Ok(Json(state.gateway.delete_user(&session, payload).await?))
}

async fn admin_delete_all_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<InitDataQuery>,
) -> Result<Json<MutationReceipt>, GatewayError> {
    let session = state.gateway.authorize(init_data(&headers, &query).as_deref())?;
    Ok(Json(state.gateway.delete_all_users(&session).await?))
}
