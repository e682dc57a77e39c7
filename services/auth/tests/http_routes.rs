//! HTTP surface tests driven through the router with `oneshot`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Request, StatusCode, header},
};
use chrono::{Duration, Utc};
use otp_auth::clock::ManualClock;
use otp_auth::hashing::CodeHasher;
use otp_auth::issuer::{DeliveryFailurePolicy, OtpIssuer};
use otp_auth::jwt::{JwtConfig, JwtKeys, JwtService};
use otp_auth::memory::{
    MemoryCodeStore, MemoryIdentityStore, MemoryWindowCounter, RecordingSender,
};
use otp_auth::phone::normalize;
use otp_auth::rate_limiter::{RateLimiter, RateLimiterConfig};
use otp_auth::routes::create_router;
use otp_auth::session::SessionIssuer;
use otp_auth::verifier::OtpVerifier;
use otp_auth::{AppState, OtpService};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> (Router, Arc<RecordingSender>) {
    app_with_proxy_headers(false)
}

fn app_with_proxy_headers(trusted: bool) -> (Router, Arc<RecordingSender>) {
    let store = Arc::new(MemoryCodeStore::new());
    let identities = Arc::new(MemoryIdentityStore::new());
    let sender = Arc::new(RecordingSender::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let hasher = CodeHasher::new(b"routes-hash-key").unwrap();
    let jwt = JwtService::new(JwtConfig {
        keys: JwtKeys::Secret("routes-jwt-secret".to_string()),
    })
    .unwrap();

    let service = OtpService::new(
        RateLimiter::new(
            RateLimiterConfig::default(),
            Arc::new(MemoryWindowCounter::new(clock.clone())),
        ),
        OtpIssuer::new(
            store.clone(),
            sender.clone(),
            hasher.clone(),
            clock.clone(),
            Duration::minutes(5),
            DeliveryFailurePolicy::Reject,
        ),
        OtpVerifier::new(store.clone(), hasher, clock.clone(), 3),
        SessionIssuer::new(identities.clone(), Arc::new(jwt), clock.clone(), Duration::hours(24)),
        identities,
        store,
        clock,
    );

    let state = AppState::new(service).with_forwarded_headers(trusted);
    (create_router(state), sender)
}

fn raw_request(method: &str, uri: &str, body: String, bearer: Option<&str>) -> Request<Body> {
    let peer = SocketAddr::from(([198, 51, 100, 1], 40_000));
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .extension(ConnectInfo(peer));
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body)).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value, bearer: Option<&str>) -> Request<Body> {
    raw_request(method, uri, body.to_string(), bearer)
}

/// Eleven login requests for distinct phones, each claiming its own forwarded address
async fn count_admitted_with_rotating_forwarded_for(app: &Router) -> usize {
    let mut admitted = 0;
    for i in 0..11u8 {
        let mut request = json_request(
            "POST",
            "/auth/send-otp",
            json!({"phone_number": format!("+965512345{:02}", i)}),
            None,
        );
        request.headers_mut().insert(
            "x-forwarded-for",
            format!("203.0.113.{}", i + 1).parse().unwrap(),
        );
        let (status, _, _) = send(app, request).await;
        if status == StatusCode::OK {
            admitted += 1;
        }
    }
    admitted
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, Option<String>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap(), retry_after)
}

async fn login(app: &Router, sender: &RecordingSender, phone: &str) -> String {
    let (status, _, _) = send(
        app,
        json_request("POST", "/auth/send-otp", json!({"phone_number": phone}), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let code = sender.last_code(&normalize(phone, None).unwrap()).unwrap();
    let (status, body, _) = send(
        app,
        json_request(
            "POST",
            "/auth/verify-otp",
            json!({"phone_number": phone, "code": code}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_reports_ok_without_infrastructure() {
    let (app, _) = app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_send_and_verify_login_code() {
    let (app, sender) = app();

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/send-otp",
            json!({"phone_number": "+96551234567", "purpose": "login"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["expires_in"], 300);
    assert_eq!(body["data"]["phone_number"], "+96551234567");
    assert!(body.to_string().find("code").is_none());

    let code = sender
        .last_code(&normalize("+96551234567", None).unwrap())
        .unwrap();
    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/verify-otp",
            json!({"phone_number": "51234567", "code": code}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user"]["phone_number"], "+96551234567");
    assert_eq!(body["data"]["token_type"], "Bearer");
    assert!(body["data"]["token"].as_str().is_some());
}

#[tokio::test]
async fn test_errors_use_the_envelope() {
    let (app, _) = app();

    let (status, body, _) = send(
        &app,
        json_request("POST", "/auth/send-otp", json!({"phone_number": "12345"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_PHONE_FORMAT");

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/send-otp",
            json!({"phone_number": "+96551234567", "purpose": "phone_change"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "PURPOSE_NOT_ALLOWED");

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/verify-otp",
            json!({"phone_number": "+96551234567", "code": "12345"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "NO_ACTIVE_CODE");
}

#[tokio::test]
async fn test_rate_limit_sets_retry_after() {
    let (app, _) = app();

    for _ in 0..3 {
        let (status, _, _) = send(
            &app,
            json_request("POST", "/auth/send-otp", json!({"phone_number": "+96551234567"}), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body, retry_after) = send(
        &app,
        json_request("POST", "/auth/send-otp", json!({"phone_number": "+96551234567"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert_eq!(retry_after.as_deref(), Some("900"));
    assert_eq!(body["error"]["details"]["retry_after_secs"], 900);
}

#[tokio::test]
async fn test_forwarded_headers_are_ignored_by_default() {
    let (app, _) = app();
    assert_eq!(count_admitted_with_rotating_forwarded_for(&app).await, 10);
}

#[tokio::test]
async fn test_forwarded_headers_name_the_origin_when_trusted() {
    let (app, _) = app_with_proxy_headers(true);
    assert_eq!(count_admitted_with_rotating_forwarded_for(&app).await, 11);
}

#[tokio::test]
async fn test_unreadable_bodies_use_the_envelope() {
    let (app, _) = app();

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/send-otp",
            json!({"phone_number": "+96551234567", "purpose": "reset"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let (status, body, _) = send(
        &app,
        raw_request("POST", "/auth/verify-otp", "{not json".to_string(), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_wrong_code_reports_remaining_attempts() {
    let (app, sender) = app();

    send(
        &app,
        json_request("POST", "/auth/send-otp", json!({"phone_number": "+96551234567"}), None),
    )
    .await;
    let code = sender
        .last_code(&normalize("+96551234567", None).unwrap())
        .unwrap();
    let wrong = if code == "00000" { "11111" } else { "00000" };

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/verify-otp",
            json!({"phone_number": "+96551234567", "code": wrong}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_OTP");
    assert_eq!(body["error"]["details"]["remaining_attempts"], 2);
    assert_eq!(body["error"]["details"]["exhausted"], false);
}

#[tokio::test]
async fn test_phone_change_requires_bearer_token() {
    let (app, _) = app();

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/user/send-phone-change-otp",
            json!({"new_phone_number": "+96551234568"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _, _) = send(
        &app,
        json_request(
            "PUT",
            "/user/phone",
            json!({"new_phone_number": "+96551234568", "otp_code": "12345"}),
            Some("not-a-token"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_phone_change_flow() {
    let (app, sender) = app();
    let token = login(&app, &sender, "+96551234567").await;

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/user/send-phone-change-otp",
            json!({"new_phone_number": "+96561234567"}),
            Some(&token),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["phone_number"], "+96561234567");

    let code = sender
        .last_code(&normalize("+96561234567", None).unwrap())
        .unwrap();
    let (status, body, _) = send(
        &app,
        json_request(
            "PUT",
            "/user/phone",
            json!({"new_phone_number": "+96561234567", "otp_code": code}),
            Some(&token),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["phone_number"], "+96561234567");
}

#[tokio::test]
async fn test_phone_change_to_registered_number_conflicts() {
    let (app, sender) = app();
    login(&app, &sender, "+96551234568").await;
    let token = login(&app, &sender, "+96551234567").await;

    let (status, body, _) = send(
        &app,
        json_request(
            "POST",
            "/user/send-phone-change-otp",
            json!({"new_phone_number": "+96551234568"}),
            Some(&token),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "PHONE_EXISTS");
}
