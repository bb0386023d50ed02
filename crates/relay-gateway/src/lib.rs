// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP surface, bearer/API-key auth, the MITM wire interceptor, and the
//! out-of-process browser-driver bridge that together expose
//! [`relay_core::Engine`] as an OpenAI-compatible HTTP relay.

pub mod browser_bridge;
pub mod gateway;
pub mod http;
pub mod proxy;
