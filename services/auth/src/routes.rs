//! OTP service routes

use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::error::{OtpError, OtpResult};
use crate::jwt::SessionClaims;
use crate::middleware::{ClientIp, extract_client_ip, require_auth};
use crate::models::{Purpose, User};
use crate::service::OtpRequest;
use crate::state::AppState;

/// Request for a login code
#[derive(Deserialize)]
pub struct SendOtpRequest {
    pub phone_number: String,
    #[serde(default)]
    pub purpose: Option<Purpose>,
}

/// Request to exchange a code for a session
#[derive(Deserialize)]
pub struct VerifyOtpRequest {
    pub phone_number: String,
    pub code: String,
    #[serde(default)]
    pub purpose: Option<Purpose>,
}

/// Request for a phone change code
#[derive(Deserialize)]
pub struct PhoneChangeOtpRequest {
    pub new_phone_number: String,
}

/// Request to move the caller to a new phone number
#[derive(Deserialize)]
pub struct ChangePhoneRequest {
    pub new_phone_number: String,
    pub otp_code: String,
}

#[derive(Serialize)]
pub struct OtpSentData {
    pub phone_number: String,
    pub expires_in: u64,
    pub delivered: bool,
}

/// Response for a successful login
#[derive(Serialize)]
pub struct LoginData {
    pub user: User,
    pub token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

fn success<T: Serialize>(message: &str, data: T) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": message,
            "data": data,
        })),
    )
}

/// Create the router for the OTP service
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/user/send-phone-change-otp", post(send_phone_change_otp))
        .route("/user/phone", put(change_phone))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health_check))
        .route("/auth/send-otp", post(send_otp))
        .route("/auth/verify-otp", post(verify_otp))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), extract_client_ip))
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.db_pool {
        Some(pool) => Some(common::database::health_check(pool).await.unwrap_or(false)),
        None => None,
    };
    let cache = match &state.redis_pool {
        Some(pool) => Some(pool.health_check().await.unwrap_or_else(|e| {
            error!("Redis health check failed: {}", e);
            false
        })),
        None => None,
    };

    let healthy = database.unwrap_or(true) && cache.unwrap_or(true);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "otp-auth",
            "database": database,
            "cache": cache,
        })),
    )
}

/// Send a login code
pub async fn send_otp(
    State(state): State<AppState>,
    Extension(ClientIp(origin)): Extension<ClientIp>,
    payload: Result<Json<SendOtpRequest>, JsonRejection>,
) -> OtpResult<impl IntoResponse> {
    let Json(payload) = payload?;
    let purpose = payload.purpose.unwrap_or(Purpose::Login);
    if purpose != Purpose::Login {
        return Err(OtpError::PurposeNotAllowed(purpose));
    }

    let receipt = state
        .service
        .request_otp(OtpRequest {
            raw_phone: payload.phone_number,
            purpose,
            origin,
            requested_by: None,
        })
        .await?;

    Ok(success(
        "OTP sent successfully",
        OtpSentData {
            phone_number: receipt.phone_number.to_string(),
            expires_in: receipt.expires_in_secs,
            delivered: receipt.delivered,
        },
    ))
}

/// Exchange a login code for a session
pub async fn verify_otp(
    State(state): State<AppState>,
    payload: Result<Json<VerifyOtpRequest>, JsonRejection>,
) -> OtpResult<impl IntoResponse> {
    let Json(payload) = payload?;
    let purpose = payload.purpose.unwrap_or(Purpose::Login);
    let outcome = state
        .service
        .verify_otp(&payload.phone_number, purpose, &payload.code)
        .await?;

    info!("User {} logged in", outcome.user.id);
    Ok(success(
        "Login successful",
        LoginData {
            token: outcome.credential.token,
            token_type: "Bearer".to_string(),
            expires_at: outcome.credential.expires_at,
            user: outcome.user,
        },
    ))
}

/// Send a code to the number the caller wants to move to
pub async fn send_phone_change_otp(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    Extension(ClientIp(origin)): Extension<ClientIp>,
    payload: Result<Json<PhoneChangeOtpRequest>, JsonRejection>,
) -> OtpResult<impl IntoResponse> {
    let Json(payload) = payload?;
    let receipt = state
        .service
        .request_otp(OtpRequest {
            raw_phone: payload.new_phone_number,
            purpose: Purpose::PhoneChange,
            origin,
            requested_by: Some(claims.sub),
        })
        .await?;

    Ok(success(
        "OTP sent successfully",
        OtpSentData {
            phone_number: receipt.phone_number.to_string(),
            expires_in: receipt.expires_in_secs,
            delivered: receipt.delivered,
        },
    ))
}

/// Move the caller to a new phone number
pub async fn change_phone(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
    payload: Result<Json<ChangePhoneRequest>, JsonRejection>,
) -> OtpResult<impl IntoResponse> {
    let Json(payload) = payload?;
    let user = state
        .service
        .change_phone(claims.sub, &payload.new_phone_number, &payload.otp_code)
        .await?;

    Ok(success(
        "Phone number updated successfully",
        json!({ "phone_number": user.phone_number, "user": user }),
    ))
}
