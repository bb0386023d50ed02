// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error taxonomy (§7). A closed enum rather than exceptions-for-control-flow
//! (§9): every fallible engine operation returns `Result<_, EngineError>`,
//! and the worker's state machine consults [`EngineError::retryable`] and
//! [`EngineError::code`] explicitly instead of branching on error strings.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid tool: {0}")]
    InvalidTool(String),

    #[error("malformed request: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("model not available: {0}")]
    ModelNotAvailable(String),

    /// Selector timeout / stale element. Recovered locally with one page
    /// quick-refresh before becoming fatal-for-request (§4.1).
    #[error("transient DOM error: {0}")]
    TransientDom(String),

    /// Upstream reports quota-exhausted for `model`. Drives a per-model
    /// cooldown and rotation (§4.9).
    #[error("quota exceeded for model {model}")]
    Quota { model: String },

    /// Upstream reports rate-limiting. Drives a global cooldown and
    /// rotation (§4.9).
    #[error("rate limited")]
    RateLimit,

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),

    /// Cancellation fired, whether from a real client disconnect or a
    /// timeout reclassified as one (§5).
    #[error("client closed request")]
    ClientClosed,

    /// No eligible profile survived the canary test (§4.9).
    #[error("rotation exhausted")]
    RotationExhausted,

    /// Browser/page gone; the worker parks until externally rehydrated.
    #[error("fatal session error: {0}")]
    FatalSession(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Machine-readable `code` field of the user-visible `{code, message,
    /// type}` error shape (§7).
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTool(_) => "invalid_tool",
            Self::Validation(_) => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::ModelNotAvailable(_) => "model_not_available",
            Self::TransientDom(_) => "transient_dom_error",
            Self::Quota { .. } => "quota_exceeded",
            Self::RateLimit => "rate_limited",
            Self::BadGateway(_) => "bad_gateway",
            Self::GatewayTimeout(_) => "gateway_timeout",
            Self::ClientClosed => "client_closed_request",
            Self::RotationExhausted => "rotation_exhausted",
            Self::FatalSession(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the worker should attempt local recovery (page refresh or
    /// rotation) before surfacing this error to the request's sink.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientDom(_) | Self::Quota { .. } | Self::RateLimit
        )
    }
}
