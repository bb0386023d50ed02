// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Top-level engine: one explicit struct constructed at startup, holding
//! the shared config snapshot, profile pool, queue, and deployment-mode
//! handle (§9's "explicit state over module globals" design note). The
//! gateway crate owns HTTP/TLS/proxy concerns; this crate owns everything
//! downstream of "a request has been accepted."

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use relay_config::Config;

use crate::browser::BrowserSession;
use crate::cancel::CancellationToken;
use crate::profiles::ProfilePool;
use crate::queue::{self, QueueHandle};
use crate::watchdog::DeploymentModeHandle;
use crate::worker::{BrowserReadinessHandle, ResponseSource, Worker};

pub struct Engine {
    pub config: Arc<Config>,
    pub queue: QueueHandle,
    pub deployment_mode: DeploymentModeHandle,
    pub browser_readiness: BrowserReadinessHandle,
    pub profiles: Option<Arc<Mutex<ProfilePool>>>,
    worker_task: JoinHandle<()>,
    watchdog_task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Wire up the queue, worker, and watchdog against a concrete browser
    /// session and response source, and spawn both background tasks.
    pub fn start<B, R>(config: Arc<Config>, browser: Arc<B>, response_source: Arc<R>, profiles: Option<ProfilePool>) -> Self
    where
        B: BrowserSession + 'static,
        R: ResponseSource + 'static,
    {
        let (queue_handle, queue_worker_end) = queue::channel();
        let profiles = profiles.map(|p| Arc::new(Mutex::new(p)));
        let deployment_mode = DeploymentModeHandle::new();
        let shutdown = CancellationToken::new();

        let readiness = BrowserReadinessHandle::new();
        let mut worker = Worker::with_readiness(queue_worker_end, browser, response_source, config.clone(), profiles.clone(), readiness.clone())
            .with_deployment_mode(deployment_mode.clone());
        let worker_task = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::error!(error = %e, "worker task exited on fatal session error");
            }
        });

        let watchdog_task = if let Some(pool) = profiles.clone() {
            let handle = deployment_mode.clone();
            let interval = Duration::from_secs(config.watchdog.poll_interval_s);
            let watchdog_shutdown = shutdown.clone();
            tokio::spawn(async move { crate::watchdog::run(pool, handle, interval, watchdog_shutdown).await })
        } else {
            tokio::spawn(async {})
        };

        info!("engine started");

        Self { config, queue: queue_handle, deployment_mode, browser_readiness: readiness, profiles, worker_task, watchdog_task, shutdown }
    }

    /// Whether the worker task is still alive, surfaced on `GET /health`
    /// (§6). `false` means a fatal session error parked it for good -- the
    /// gateway process needs restarting to rebuild a fresh browser session.
    pub fn worker_running(&self) -> bool {
        !self.worker_task.is_finished()
    }

    /// Graceful shutdown (§9): stop the watchdog and let the worker finish
    /// draining whatever is already queued, then join both tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.watchdog_task.await;
        self.worker_task.abort();
        let _ = self.worker_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::NullBrowserSession;
    use relay_model::StreamEvent;
    use tokio::sync::mpsc;

    struct EmptySource;

    #[async_trait::async_trait]
    impl ResponseSource for EmptySource {
        async fn acquire(&self, _req_id: &str) -> mpsc::UnboundedReceiver<StreamEvent> {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        }
    }

    #[tokio::test]
    async fn engine_starts_and_shuts_down_cleanly() {
        let config = Arc::new(Config::default());
        let browser = Arc::new(NullBrowserSession::default());
        let source = Arc::new(EmptySource);
        let engine = Engine::start(config, browser, source, None);
        assert_eq!(engine.deployment_mode.get(), crate::worker::DeploymentMode::Normal);
        engine.shutdown().await;
    }
}
