// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Gateway startup — assembles all subsystems and starts them.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order, then blocks on the HTTP server:
//!
//! 1. Load the profile pool from `ProfilesConfig`, if its directory exists
//!    (§3) -- otherwise run against a single unrotated session.
//! 2. Construct the response-acquisition pipeline: the MITM wire
//!    interceptor (Layer 1, §4.5, §4.8) and the out-of-process
//!    browser-driver bridge (§1 Non-goals).
//! 3. Start [`relay_core::Engine`] -- spawns the worker and watchdog tasks.
//! 4. Build [`AppState`] and the axum router.
//! 5. Serve HTTP(S) until Ctrl+C, then drain the engine and return.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use relay_config::Config;
use relay_core::clock::SystemClock;
use relay_core::profiles::ProfilePool;
use relay_core::Engine;

use crate::browser_bridge::HttpBridgeBrowserSession;
use crate::http::{self, AppState};
use crate::proxy::WireInterceptor;

/// Start the gateway. Runs until Ctrl+C, then drains the queue and shuts
/// the engine down before returning.
///
/// `config_path` is the same explicit path (if any) the caller loaded
/// `config` from, kept around so a SIGHUP re-reads and validates the same
/// source (§9's "explicit reload signal" primitive). Hot-swapping the
/// already-running engine's snapshot is out of scope -- every subsystem here
/// is handed one `Arc<Config>` at startup, a "load once, share the snapshot"
/// design -- so a SIGHUP only confirms the file is still valid and logs the
/// outcome; applying it requires a restart.
pub async fn run(config: Config, config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let profiles = if config.profiles.dir.is_dir() {
        let clock: relay_core::clock::SharedClock = Arc::new(SystemClock);
        let pool = ProfilePool::load(&config.profiles.dir, &config.profiles.cooldown_ledger_path, &config.profiles.usage_ledger_path, clock)?;
        info!(count = pool.profiles().len(), "loaded auth profile pool");
        Some(pool)
    } else {
        info!(dir = %config.profiles.dir.display(), "no profile pool directory found, running without rotation");
        None
    };

    let interceptor = WireInterceptor::new(config.stream_proxy.stream_port != 0);
    let browser_bridge_configured = config.browser_bridge.endpoint.is_some();
    let browser = Arc::new(HttpBridgeBrowserSession::new(
        config.browser_bridge.endpoint.clone(),
        Duration::from_millis(config.browser_bridge.request_timeout_ms),
    ));

    let engine = Arc::new(Engine::start(config.clone(), browser, Arc::new(interceptor.clone()), profiles));

    let auth = http::build_auth_state(&config.http)?;
    let state = AppState {
        engine: engine.clone(),
        auth,
        cancel_registry: Arc::new(Mutex::new(HashMap::new())),
        browser_bridge_configured,
        wire_interceptor_healthy: interceptor.is_healthy(),
    };

    let router = http::router(state, interceptor);

    info!(bind = %config.http.bind, tls = !config.http.insecure_dev_mode, "starting HTTP gateway");

    let http_config = config.http.clone();
    let serve_task = tokio::spawn(async move { http::serve(&http_config, router).await });

    #[cfg(unix)]
    let reload_task = tokio::spawn(reload_on_sighup(config_path));

    tokio::select! {
        res = serve_task => {
            if let Ok(Err(e)) = res {
                tracing::error!(error = %e, "HTTP server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }

    #[cfg(unix)]
    reload_task.abort();

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown().await,
        Err(_) => tracing::warn!("engine still has outstanding references at shutdown, skipping graceful drain"),
    }

    Ok(())
}

/// Re-read and validate the config file on every SIGHUP (§9). Only confirms
/// the file still parses and passes [`Config::validate`] and logs the
/// outcome -- the already-running engine, worker, and HTTP listener keep the
/// snapshot they started with; signal handling only ever triggers a clean
/// shutdown rather than live reconfiguration.
#[cfg(unix)]
async fn reload_on_sighup(config_path: Option<std::path::PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};
    let Ok(mut sighup) = signal(SignalKind::hangup()) else {
        tracing::warn!("could not install SIGHUP handler, config reload-on-signal disabled");
        return;
    };
    loop {
        if sighup.recv().await.is_none() {
            return;
        }
        match relay_config::load(config_path.as_deref()) {
            Ok(_) => info!("SIGHUP: config file re-read and validated (restart to apply changes)"),
            Err(e) => tracing::error!(error = %e, "SIGHUP: config reload failed validation, keeping current snapshot"),
        }
    }
}

/// Print the effective (non-secret) configuration, for `show-config`.
pub fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// List discovered auth profiles and their tier, for `list-profiles`.
pub fn list_profiles(config: &Config) -> anyhow::Result<()> {
    if !config.profiles.dir.is_dir() {
        println!("no profile directory at {}", config.profiles.dir.display());
        return Ok(());
    }
    let clock: relay_core::clock::SharedClock = Arc::new(SystemClock);
    let pool = ProfilePool::load(&config.profiles.dir, &config.profiles.cooldown_ledger_path, &config.profiles.usage_ledger_path, clock)?;
    for profile in pool.profiles() {
        println!("{:<10} {:?}  {}", profile.id, profile.tier, profile.path.display());
    }
    Ok(())
}
