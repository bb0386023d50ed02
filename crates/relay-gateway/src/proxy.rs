// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Layer 1 of the response-acquisition pipeline (§4.5, §4.8): the wire
//! interceptor.
//!
//! The TLS/MITM certificate manager that actually terminates the browser's
//! upstream HTTPS traffic is an external collaborator out of scope here —
//! only its contract appears (§1 Non-goals). That collaborator identifies
//! streaming responses by URL pattern and forwards the decrypted body bytes
//! to this process's internal ingest endpoint, tagged with the correlation
//! token the worker set in a request header before submitting the prompt.
//! This module owns everything on this side of that contract: holding one
//! open channel per in-flight correlation token, feeding each chunk through
//! the shared wire-frame parser, and publishing `StreamEvent`s to whichever
//! request is waiting on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::worker::ResponseSource;
use relay_model::{openai_compat::drain_wire_lines, StreamEvent};

struct Tap {
    buf: String,
    sink: mpsc::UnboundedSender<StreamEvent>,
}

/// Correlation-keyed registry of open wire taps. One entry exists per
/// request between `acquire` and the tap closing (either via an explicit
/// `close` call or the sender being dropped).
#[derive(Clone, Default)]
pub struct WireInterceptor {
    taps: Arc<Mutex<HashMap<String, Tap>>>,
    /// Whether the external proxy/certificate manager reported itself
    /// healthy at startup (§4.5 eligibility check). A wire interceptor with
    /// `stream_port == 0` is disabled outright.
    enabled: bool,
}

impl WireInterceptor {
    pub fn new(enabled: bool) -> Self {
        Self { taps: Arc::new(Mutex::new(HashMap::new())), enabled }
    }

    /// Startup eligibility check (§4.5): wire interception is only a
    /// candidate layer when explicitly enabled by configuration.
    pub fn is_healthy(&self) -> bool {
        self.enabled
    }

    /// Feed one chunk of decrypted upstream body bytes for `correlation`,
    /// parsing whatever complete wire-frame lines it completes and
    /// forwarding them to the registered receiver. Chunks for a correlation
    /// token with no registered tap are dropped silently — the external
    /// proxy has no way to know whether the worker is still listening.
    fn ingest(&self, correlation: &str, chunk: &[u8]) {
        let mut taps = self.taps.lock().unwrap();
        let Some(tap) = taps.get_mut(correlation) else {
            debug!(correlation, "wire chunk for unknown/closed correlation token");
            return;
        };
        tap.buf.push_str(&String::from_utf8_lossy(chunk));
        for event in drain_wire_lines(&mut tap.buf) {
            if tap.sink.send(event).is_err() {
                taps.remove(correlation);
                return;
            }
        }
    }

    /// Explicitly close a tap, e.g. when the external proxy signals the
    /// upstream response finished or the connection reset.
    fn close(&self, correlation: &str) {
        self.taps.lock().unwrap().remove(correlation);
    }
}

#[async_trait::async_trait]
impl ResponseSource for WireInterceptor {
    async fn acquire(&self, req_id: &str) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.taps.lock().unwrap().insert(req_id.to_string(), Tap { buf: String::new(), sink: tx });
        rx
    }
}

/// `POST /_internal/wire/:correlation` — the external collaborator's side
/// of the contract. Loopback-only in practice since it's never exposed
/// past the reverse proxy in front of the public HTTP surface.
pub async fn ingest_chunk(State(interceptor): State<WireInterceptor>, AxumPath(correlation): AxumPath<String>, body: axum::body::Bytes) -> StatusCode {
    interceptor.ingest(&correlation, &body);
    StatusCode::NO_CONTENT
}

/// `POST /_internal/wire/:correlation/close`
pub async fn ingest_close(State(interceptor): State<WireInterceptor>, AxumPath(correlation): AxumPath<String>) -> StatusCode {
    interceptor.close(&correlation);
    StatusCode::NO_CONTENT
}
