// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Quota watchdog (§4.10): a background task that periodically scans the
//! cooldown ledger and derives the deployment mode surfaced on `GET
//! /api/info`, independent of whether any request is currently in flight.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::profiles::{ProfilePool, Tier};
use crate::worker::DeploymentMode;

impl DeploymentMode {
    fn to_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::QuotaExceeded => 1,
            Self::NeedsRotation => 2,
            Self::Emergency => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::QuotaExceeded,
            2 => Self::NeedsRotation,
            _ => Self::Emergency,
        }
    }
}

/// Shared, lock-free handle the HTTP layer reads from `GET /api/info` and
/// the watchdog writes to every poll cycle.
#[derive(Clone)]
pub struct DeploymentModeHandle(Arc<AtomicU8>);

impl DeploymentModeHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(DeploymentMode::Normal.to_u8())))
    }

    pub fn get(&self) -> DeploymentMode {
        DeploymentMode::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, mode: DeploymentMode) {
        self.0.store(mode.to_u8(), Ordering::Relaxed);
    }
}

impl Default for DeploymentModeHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify the pool's overall health from eligible-candidate counts per
/// tier (§4.10): any eligible primary/active profile is `Normal`; none
/// eligible outside emergency is `NeedsRotation`; an eligible emergency
/// profile only is `Emergency`; nothing eligible anywhere is
/// `QuotaExceeded`.
fn classify(pool: &ProfilePool) -> DeploymentMode {
    let mut eligible_by_tier = [0usize; 3];
    for profile in pool.profiles() {
        if pool.is_eligible(&profile.id, None) {
            let idx = match profile.tier {
                Tier::Primary => 0,
                Tier::Active => 1,
                Tier::Emergency => 2,
            };
            eligible_by_tier[idx] += 1;
        }
    }
    if eligible_by_tier[0] > 0 || eligible_by_tier[1] > 0 {
        DeploymentMode::Normal
    } else if eligible_by_tier[2] > 0 {
        DeploymentMode::Emergency
    } else if pool.profiles().is_empty() {
        DeploymentMode::Normal
    } else {
        DeploymentMode::QuotaExceeded
    }
}

/// Run the watchdog loop until `shutdown` fires. Intended to be spawned as
/// its own task alongside the worker (§4.10).
pub async fn run(pool: Arc<Mutex<ProfilePool>>, handle: DeploymentModeHandle, poll_interval: Duration, shutdown: crate::cancel::CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {
                let mode = classify(&*pool.lock().await);
                if mode != handle.get() {
                    info!(?mode, "deployment mode transition");
                }
                handle.set(mode);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::Arc as StdArc;

    fn pool_with(tmp: &std::path::Path) -> ProfilePool {
        ProfilePool::load(tmp, &tmp.join("c.json"), &tmp.join("u.json"), StdArc::new(FakeClock::new(0))).unwrap()
    }

    fn write_profile(dir: &std::path::Path, tier: &str, id: &str) {
        let tier_dir = dir.join(tier);
        std::fs::create_dir_all(&tier_dir).unwrap();
        std::fs::write(tier_dir.join(format!("{id}.json")), "{}").unwrap();
    }

    #[test]
    fn classify_normal_when_primary_eligible() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let pool = pool_with(tmp.path());
        assert_eq!(classify(&pool), DeploymentMode::Normal);
    }

    #[test]
    fn classify_emergency_when_only_emergency_eligible() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "emergency", "e1");
        let pool = pool_with(tmp.path());
        assert_eq!(classify(&pool), DeploymentMode::Emergency);
    }

    #[test]
    fn classify_quota_exceeded_when_nothing_eligible() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let mut pool = pool_with(tmp.path());
        pool.apply_cooldown("p1", crate::profiles::CooldownReason::RateLimit, None, 3600).unwrap();
        assert_eq!(classify(&pool), DeploymentMode::QuotaExceeded);
    }

    #[test]
    fn deployment_mode_handle_round_trips() {
        let handle = DeploymentModeHandle::new();
        assert_eq!(handle.get(), DeploymentMode::Normal);
        handle.set(DeploymentMode::Emergency);
        assert_eq!(handle.get(), DeploymentMode::Emergency);
    }
}
