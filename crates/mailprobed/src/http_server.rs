use crate::admission::{AdmissionError, Gates, Identity};
use crate::email;
use crate::orchestrator::{Engine, VerifyResult};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub engine: Engine,
    pub gates: Gates,
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    emails: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    emails_verified: u64,
    requests: u64,
    daily_limit: u64,
    remaining: u64,
}

#[derive(Serialize)]
pub struct AgentInfo {
    uid: String,
    usage: AgentUsage,
}

#[derive(Serialize)]
pub struct VerifyResponse {
    results: Vec<VerifyResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<AgentInfo>,
}

#[derive(Deserialize)]
pub struct BounceRequest {
    email: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.as_secs().to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        let message = err.to_string();
        match err {
            AdmissionError::BatchTooLarge { .. } => ApiError::new(StatusCode::BAD_REQUEST, message),
            AdmissionError::RateLimited { retry_after }
            | AdmissionError::DailyExhausted { retry_after } => ApiError {
                status: StatusCode::TOO_MANY_REQUESTS,
                message,
                retry_after: Some(retry_after),
            },
            AdmissionError::GlobalExhausted => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, message)
            }
            AdmissionError::TooManyConcurrent => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, message)
            }
        }
    }
}

/// The signature middleware runs ahead of us and only forwards the
/// signature headers when they verified; an agent identity is taken
/// from them as a unit.
fn agent_uid(headers: &HeaderMap) -> Option<String> {
    let uid = headers.get("signature-agent")?.to_str().ok()?;
    headers.get("signature")?;
    headers.get("signature-input")?;
    let uid = uid.trim().trim_matches('"');
    if uid.is_empty() {
        return None;
    }
    Some(uid.to_string())
}

fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

fn identify(headers: &HeaderMap) -> Identity {
    match agent_uid(headers) {
        Some(uid) => Identity::Agent(uid),
        None => Identity::Ip(client_ip(headers)),
    }
}

async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(request) = body.map_err(|err| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("invalid request body: {err}"))
    })?;

    if request.emails.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "emails must not be empty",
        ));
    }

    let identity = identify(&headers);
    let admission = state.gates.admit(&identity, request.emails.len())?;

    // Addresses past the grant are shed, per the daily budget
    let batch = &request.emails[..admission.granted.min(request.emails.len())];
    tracing::info!(
        identity = %identity.key(),
        requested = request.emails.len(),
        granted = batch.len(),
        "verify request admitted"
    );

    let results = state.engine.verify_batch(batch).await;

    let agent = match &identity {
        Identity::Agent(uid) => Some(AgentInfo {
            uid: uid.clone(),
            usage: AgentUsage {
                emails_verified: results.len() as u64,
                requests: admission.requests_today,
                daily_limit: state.gates.daily_limit(&identity),
                remaining: admission.remaining,
            },
        }),
        Identity::Ip(_) => None,
    };

    Ok(Json(VerifyResponse { results, agent }))
}

async fn bounce(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<BounceRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = body.map_err(|err| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("invalid request body: {err}"))
    })?;

    let ip = client_ip(&headers);
    state.gates.admit_bounce(&ip)?;

    if email::parse(&request.email).is_none() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "invalid email"));
    }

    state.engine.bounces.record(&request.email, &ip);
    Ok(Json(serde_json::json!({ "recorded": true })))
}

async fn agent_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AgentInfo>, ApiError> {
    let Some(uid) = agent_uid(&headers) else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "agent signature required",
        ));
    };

    let identity = Identity::Agent(uid.clone());
    let used = state.gates.used_today(&identity);
    let limit = state.gates.daily_limit(&identity);

    Ok(Json(AgentInfo {
        uid,
        usage: AgentUsage {
            emails_verified: used,
            requests: 0,
            daily_limit: limit,
            remaining: limit.saturating_sub(used),
        },
    }))
}

pub fn make_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/verify", post(verify))
        .route("/api/bounce", post(bounce))
        .route("/api/agent/usage", get(agent_usage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
