// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cancellation primitive carried on every [`crate::queue::RequestContext`]
//! (`client_cancel`, §3). A client disconnect, a timeout, or an explicit
//! `POST /v1/cancel/:req_id` all reduce to firing the same token; every
//! suspension point in the worker and streaming controller selects on
//! `{work, cancel}` against it (§5).

pub use tokio_util::sync::CancellationToken;

/// Child token tied to `parent`'s lifetime plus its own: firing either one
/// fires this one. Used to derive the per-attempt cancellation inside a
/// retry without letting that attempt's cleanup cancel sibling attempts.
pub fn child_of(parent: &CancellationToken) -> CancellationToken {
    parent.child_token()
}
