//! Request middleware: client address extraction and bearer authentication

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use tracing::warn;

use crate::error::OtpError;
use crate::state::AppState;

/// Address the request is attributed to for rate limiting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // Comma separated list, the first hop is the client
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Store the client address in the request extensions.
///
/// Priority when proxy headers are trusted:
/// 1. X-Forwarded-For header (for requests through proxies)
/// 2. X-Real-IP header (for Nginx)
/// 3. ConnectInfo socket address (direct connection)
///
/// Otherwise only the socket address counts. Requests with no usable
/// address share the unspecified address.
pub async fn extract_client_ip(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let forwarded = if state.trust_forwarded_headers {
        forwarded_ip(request.headers()).or_else(|| real_ip(request.headers()))
    } else {
        None
    };

    let ip = forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .unwrap_or_else(|| {
            warn!("No client address available for {}", request.uri().path());
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });

    request.extensions_mut().insert(ClientIp(ip));
    next.run(request).await
}

/// Validate the bearer credential and expose its claims to handlers
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return OtpError::Unauthorized.into_response();
    };

    match state.service.authenticate(bearer.token()) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
