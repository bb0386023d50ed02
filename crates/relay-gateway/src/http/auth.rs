// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! API-key authentication middleware and per-IP rate limiting.
//!
//! # Key verification
//!
//! Requests present a key either as `Authorization: Bearer <key>` or
//! `X-API-Key: <key>`. Keys are loaded from a flat text file (§6
//! Authentication): one key per line, `#`-prefixed and blank lines ignored,
//! each at least 8 bytes long. An absent or empty key file means open
//! access — this is a local developer-tool default, not a production
//! recommendation (§6, §9). `GET /v1/models` is always exempt so clients can
//! discover what's available before authenticating.
//!
//! Comparison uses [`subtle::ConstantTimeEq`] against every configured key so
//! a failed match doesn't leak timing information about which prefix matched.
//!
//! # Rate limiting
//!
//! Uses the `governor` crate (GCRA algorithm) for per-IP rate limiting.
//! Failed authentication attempts are counted; exceeding the configured
//! quota triggers a lockout. Successful auth never consumes a token.
//!
//! Loopback addresses (127.0.0.1, ::1) are exempt from rate limiting because
//! a local process that has access to the loopback already has local access
//! to the machine anyway.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    path::Path,
    sync::Arc,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tracing::warn;

/// Flat set of accepted API keys, loaded from a text file.
#[derive(Debug, Default)]
pub struct ApiKeySet {
    keys: Vec<String>,
}

impl ApiKeySet {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> anyhow::Result<Self> {
        let keys: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        for key in &keys {
            if key.len() < 8 {
                anyhow::bail!("api key {key:?} is shorter than the required 8 characters");
            }
        }
        Ok(Self { keys })
    }

    pub fn empty() -> Self {
        Self { keys: Vec::new() }
    }

    /// No keys configured: every request is accepted (§6, §9).
    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn verify(&self, candidate: &str) -> bool {
        self.keys.iter().any(|k| {
            if k.len() != candidate.len() {
                return false;
            }
            k.as_bytes().ct_eq(candidate.as_bytes()).into()
        })
    }
}

/// Shared auth state threaded through axum middleware.
#[derive(Clone)]
pub struct AuthState {
    keys: Arc<ApiKeySet>,
    limiter: Arc<IpLimiter>,
}

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

impl AuthState {
    /// `max_per_minute`: maximum failed auth attempts before lockout.
    /// `burst`: how many attempts are allowed in a burst before the rate
    /// limit kicks in.
    pub fn new(keys: ApiKeySet, max_per_minute: u32, burst: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(max_per_minute.max(1)).unwrap()).allow_burst(NonZeroU32::new(burst.max(1)).unwrap());
        Self { keys: Arc::new(keys), limiter: Arc::new(RateLimiter::keyed(quota)) }
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

pub trait AsAuthState {
    fn auth_state(&self) -> &AuthState;
}

impl AsAuthState for AuthState {
    fn auth_state(&self) -> &AuthState {
        self
    }
}

/// Axum middleware verifying the API key. `GET /v1/models` always passes
/// through regardless of configured keys (§6).
pub async fn api_key_auth_mw<S>(State(state): State<S>, ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request, next: Next) -> Response
where
    S: AsAuthState + Clone + Send + Sync + 'static,
{
    if req.method() == axum::http::Method::GET && req.uri().path() == "/v1/models" {
        return next.run(req).await;
    }
    verify_api_key(state.auth_state(), addr.ip(), req, next).await
}

pub async fn verify_api_key(auth: &AuthState, ip: IpAddr, req: Request, next: Next) -> Response {
    if auth.keys.is_open() {
        return next.run(req).await;
    }

    let provided = extract_key(req.headers());
    match provided {
        Some(key) if auth.keys.verify(key) => next.run(req).await,
        _ => {
            if !is_loopback(ip) && auth.limiter.check_key(&ip).is_err() {
                warn!(%ip, "rate limit exceeded after repeated auth failures");
                return (StatusCode::TOO_MANY_REQUESTS, [(axum::http::header::RETRY_AFTER, "60")], "Too Many Requests").into_response();
            }
            warn!(%ip, "authentication failed");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

fn extract_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(v);
    }
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_ignoring_comments_and_blanks() {
        let set = ApiKeySet::parse("# a comment\n\nabcd1234\n  efgh5678  \n").unwrap();
        assert!(!set.is_open());
        assert!(set.verify("abcd1234"));
        assert!(set.verify("efgh5678"));
    }

    #[test]
    fn rejects_keys_shorter_than_eight_chars() {
        assert!(ApiKeySet::parse("short\n").is_err());
    }

    #[test]
    fn empty_file_is_open_access() {
        let set = ApiKeySet::parse("").unwrap();
        assert!(set.is_open());
    }

    #[test]
    fn verify_rejects_unknown_key() {
        let set = ApiKeySet::parse("abcd1234\n").unwrap();
        assert!(!set.verify("wrongkeyy"));
    }

    #[test]
    fn extract_key_prefers_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "direct-key".parse().unwrap());
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer other-key".parse().unwrap());
        assert_eq!(extract_key(&headers), Some("direct-key"));
    }

    #[test]
    fn extract_key_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer a-token".parse().unwrap());
        assert_eq!(extract_key(&headers), Some("a-token"));
    }

    #[test]
    fn loopback_v4_is_loopback() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn non_loopback_is_not_loopback() {
        assert!(!is_loopback("192.168.1.1".parse().unwrap()));
    }
}
