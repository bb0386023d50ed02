// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Profile pool and cooldown ledger (§3, §4.9): the set of credential files
//! partitioned across `primary | active | emergency` tiers, their persisted
//! per-model/global cooldowns and usage totals, and the rotation algorithm
//! that picks a replacement when the active profile is exhausted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::error::EngineError;

pub const GLOBAL_SCOPE: &str = "global";

/// Eligibility-pool membership (§3, GLOSSARY). Candidates are drawn from
/// the lowest (cheapest) tier that still has an eligible member; `emergency`
/// is only consulted once `primary` and `active` are both exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Primary,
    Active,
    Emergency,
}

impl Tier {
    fn dirname(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Active => "active",
            Self::Emergency => "emergency",
        }
    }

    const ALL: [Tier; 3] = [Tier::Primary, Tier::Active, Tier::Emergency];
}

/// Why a cooldown was set (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    /// Sets the `"global"` cooldown.
    RateLimit,
    /// Sets the per-model cooldown.
    QuotaExceeded,
    /// Sets the `"global"` cooldown, for a shorter duration than rate-limit.
    CanaryFailed,
}

/// One set of credentials plus its pool membership (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProfile {
    pub id: String,
    pub tier: Tier,
    pub path: PathBuf,
}

/// `{profile_id -> {"global"|model_id -> unix_deadline_ms}}`, persisted to
/// `config/cooldown_status.json` (§3, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownLedger(HashMap<String, HashMap<String, u64>>);

/// `{profile_id -> token_total}`, persisted to `config/profile_usage.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLedger(HashMap<String, u64>);

impl CooldownLedger {
    fn deadline(&self, profile_id: &str, scope: &str) -> u64 {
        self.0
            .get(profile_id)
            .and_then(|m| m.get(scope))
            .copied()
            .unwrap_or(0)
    }

    fn set(&mut self, profile_id: &str, scope: &str, deadline_ms: u64) {
        self.0
            .entry(profile_id.to_string())
            .or_default()
            .insert(scope.to_string(), deadline_ms);
    }

    /// Count of models (excluding `"global"`) currently on cooldown for
    /// `profile_id`, used as the negative-efficiency-score input (§4.9 #1).
    fn other_models_on_cooldown(&self, profile_id: &str, now_ms: u64, exclude_model: Option<&str>) -> usize {
        self.0
            .get(profile_id)
            .map(|m| {
                m.iter()
                    .filter(|(scope, deadline)| {
                        scope.as_str() != GLOBAL_SCOPE
                            && Some(scope.as_str()) != exclude_model
                            && **deadline > now_ms
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Persisted, cooldown-aware pool of authentication profiles (§3, §4.9).
pub struct ProfilePool {
    profiles: Vec<AuthProfile>,
    cooldowns: CooldownLedger,
    usage: UsageLedger,
    cooldown_path: PathBuf,
    usage_path: PathBuf,
    clock: SharedClock,
}

impl ProfilePool {
    /// Discover profile blobs under `dir/{primary,active,emergency}/*.json`
    /// and load the persisted ledgers from `cooldown_path` / `usage_path`.
    /// Missing ledger files are treated as empty (first run).
    pub fn load(
        dir: &Path,
        cooldown_path: &Path,
        usage_path: &Path,
        clock: SharedClock,
    ) -> anyhow::Result<Self> {
        let mut profiles = Vec::new();
        for tier in Tier::ALL {
            let tier_dir = dir.join(tier.dirname());
            if !tier_dir.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&tier_dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                profiles.push(AuthProfile { id, tier, path: path.to_path_buf() });
            }
        }
        profiles.sort_by(|a, b| a.id.cmp(&b.id));

        let cooldowns = read_json_or_default(cooldown_path)?;
        let usage = read_json_or_default(usage_path)?;

        Ok(Self {
            profiles,
            cooldowns,
            usage,
            cooldown_path: cooldown_path.to_path_buf(),
            usage_path: usage_path.to_path_buf(),
            clock,
        })
    }

    pub fn profiles(&self) -> &[AuthProfile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&AuthProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Eligibility filter (§3, §4.9): neither the `"global"` cooldown nor
    /// the target model's cooldown may be in the future.
    pub fn is_eligible(&self, profile_id: &str, target_model: Option<&str>) -> bool {
        let now = self.clock.unix_ms();
        if self.cooldowns.deadline(profile_id, GLOBAL_SCOPE) > now {
            return false;
        }
        if let Some(model) = target_model {
            if self.cooldowns.deadline(profile_id, model) > now {
                return false;
            }
        }
        true
    }

    pub fn usage_total(&self, profile_id: &str) -> u64 {
        self.usage.0.get(profile_id).copied().unwrap_or(0)
    }

    pub fn record_usage(&mut self, profile_id: &str, tokens: u64) -> anyhow::Result<()> {
        *self.usage.0.entry(profile_id.to_string()).or_insert(0) += tokens;
        self.persist_usage()
    }

    /// Apply a cooldown from §3's reason vocabulary and persist immediately.
    pub fn apply_cooldown(
        &mut self,
        profile_id: &str,
        reason: CooldownReason,
        model: Option<&str>,
        duration_s: u64,
    ) -> anyhow::Result<()> {
        let deadline = self.clock.unix_ms() + duration_s * 1_000;
        let scope = match reason {
            CooldownReason::RateLimit | CooldownReason::CanaryFailed => GLOBAL_SCOPE,
            CooldownReason::QuotaExceeded => model.expect("quota cooldown requires a target model"),
        };
        self.cooldowns.set(profile_id, scope, deadline);
        warn!(profile_id, ?reason, scope, deadline, "profile cooldown applied");
        self.persist_cooldowns()
    }

    /// Smart-efficiency candidate order (§4.9) within the cheapest tier that
    /// has at least one eligible member: negative efficiency score (more
    /// partially-spent profiles first), then lower usage total, then a
    /// random tie-break to avoid deterministic hotspots.
    pub fn candidates(&self, target_model: Option<&str>) -> Vec<&AuthProfile> {
        let now = self.clock.unix_ms();
        for tier in Tier::ALL {
            let mut pool: Vec<&AuthProfile> = self
                .profiles
                .iter()
                .filter(|p| p.tier == tier && self.is_eligible(&p.id, target_model))
                .collect();
            if pool.is_empty() {
                continue;
            }
            pool.shuffle(&mut rand::thread_rng());
            pool.sort_by_key(|p| {
                let efficiency = self.cooldowns.other_models_on_cooldown(&p.id, now, target_model);
                (std::cmp::Reverse(efficiency), self.usage_total(&p.id))
            });
            return pool;
        }
        Vec::new()
    }

    fn persist_cooldowns(&self) -> anyhow::Result<()> {
        write_json_atomic(&self.cooldown_path, &self.cooldowns)
    }

    fn persist_usage(&self) -> anyhow::Result<()> {
        write_json_atomic(&self.usage_path, &self.usage)
    }
}

/// Rotation outcome: the committed profile plus whether any prior candidate
/// failed its canary (informational, for logging/metrics).
pub struct RotationResult {
    pub profile_id: String,
    pub canary_failures: usize,
}

/// Drive profile rotation (§4.9): walk [`ProfilePool::candidates`] in order,
/// canary-probing each with `probe` until one passes. `probe` returns `Ok`
/// on a successful canary request, `Err` on any auth-related failure.
pub async fn rotate<F, Fut>(
    pool: &mut ProfilePool,
    target_model: Option<&str>,
    canary_cooldown_s: u64,
    mut probe: F,
) -> Result<RotationResult, EngineError>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<(), EngineError>>,
{
    let candidates: Vec<String> = pool.candidates(target_model).into_iter().map(|p| p.id.clone()).collect();
    let mut canary_failures = 0;
    for candidate in candidates {
        match probe(candidate.clone()).await {
            Ok(()) => {
                info!(profile_id = %candidate, canary_failures, "profile rotation committed");
                return Ok(RotationResult { profile_id: candidate, canary_failures });
            }
            Err(_) => {
                canary_failures += 1;
                let _ = pool.apply_cooldown(&candidate, CooldownReason::CanaryFailed, None, canary_cooldown_s);
            }
        }
    }
    Err(EngineError::RotationExhausted)
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    if !path.is_file() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Write-to-temp, fsync, rename: the ledger is never observed in a
/// partially-written state, even across a crash (§3).
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    use std::io::Write;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::Arc;

    fn write_profile(dir: &Path, tier: &str, id: &str) {
        let tier_dir = dir.join(tier);
        std::fs::create_dir_all(&tier_dir).unwrap();
        std::fs::write(tier_dir.join(format!("{id}.json")), "{}").unwrap();
    }

    fn pool(dir: &Path, clock: SharedClock) -> ProfilePool {
        ProfilePool::load(dir, &dir.join("cooldowns.json"), &dir.join("usage.json"), clock).unwrap()
    }

    #[test]
    fn discovers_profiles_across_tiers() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        write_profile(tmp.path(), "active", "a1");
        write_profile(tmp.path(), "emergency", "e1");
        let pool = pool(tmp.path(), Arc::new(FakeClock::new(0)));
        assert_eq!(pool.profiles().len(), 3);
        assert_eq!(pool.get("p1").unwrap().tier, Tier::Primary);
    }

    #[test]
    fn eligibility_respects_global_cooldown() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let clock = Arc::new(FakeClock::new(1_000));
        let mut pool = pool(tmp.path(), clock.clone());
        assert!(pool.is_eligible("p1", None));
        pool.apply_cooldown("p1", CooldownReason::RateLimit, None, 60).unwrap();
        assert!(!pool.is_eligible("p1", None));
    }

    #[test]
    fn eligibility_respects_per_model_cooldown_only_for_that_model() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let clock = Arc::new(FakeClock::new(1_000));
        let mut pool = pool(tmp.path(), clock.clone());
        pool.apply_cooldown("p1", CooldownReason::QuotaExceeded, Some("gemini-pro"), 60).unwrap();
        assert!(!pool.is_eligible("p1", Some("gemini-pro")));
        assert!(pool.is_eligible("p1", Some("gemini-flash")));
        assert!(pool.is_eligible("p1", None));
    }

    #[test]
    fn cooldown_expires_after_clock_advances() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let clock = Arc::new(FakeClock::new(0));
        let mut pool = pool(tmp.path(), clock.clone());
        pool.apply_cooldown("p1", CooldownReason::RateLimit, None, 10).unwrap();
        assert!(!pool.is_eligible("p1", None));
        clock.advance(std::time::Duration::from_secs(11));
        assert!(pool.is_eligible("p1", None));
    }

    #[test]
    fn candidates_never_include_globally_cooled_down_profile() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        write_profile(tmp.path(), "primary", "p2");
        let clock = Arc::new(FakeClock::new(0));
        let mut pool = pool(tmp.path(), clock);
        pool.apply_cooldown("p1", CooldownReason::RateLimit, None, 3600).unwrap();
        let ids: Vec<_> = pool.candidates(None).into_iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["p2".to_string()]);
    }

    #[test]
    fn candidates_prefer_lower_tier_first() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "emergency", "e1");
        write_profile(tmp.path(), "primary", "p1");
        let clock = Arc::new(FakeClock::new(0));
        let pool = pool(tmp.path(), clock);
        let ids: Vec<_> = pool.candidates(None).into_iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["p1".to_string()]);
    }

    #[test]
    fn candidates_wear_leveling_prefers_lower_usage() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        write_profile(tmp.path(), "primary", "p2");
        let clock = Arc::new(FakeClock::new(0));
        let mut pool = pool(tmp.path(), clock);
        pool.record_usage("p1", 1_000).unwrap();
        let ids: Vec<_> = pool.candidates(None).into_iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids[0], "p2");
    }

    #[test]
    fn no_eligible_profile_yields_empty_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let clock = Arc::new(FakeClock::new(0));
        let mut pool = pool(tmp.path(), clock);
        pool.apply_cooldown("p1", CooldownReason::RateLimit, None, 3600).unwrap();
        assert!(pool.candidates(None).is_empty());
    }

    #[test]
    fn ledger_persists_atomically_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let clock = Arc::new(FakeClock::new(0));
        {
            let mut pool = pool(tmp.path(), clock.clone());
            pool.apply_cooldown("p1", CooldownReason::RateLimit, None, 60).unwrap();
            pool.record_usage("p1", 42).unwrap();
        }
        let reloaded = pool(tmp.path(), clock);
        assert!(!reloaded.is_eligible("p1", None));
        assert_eq!(reloaded.usage_total("p1"), 42);
    }

    #[tokio::test]
    async fn rotate_skips_profiles_that_fail_canary() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        write_profile(tmp.path(), "primary", "p2");
        let clock = Arc::new(FakeClock::new(0));
        let mut pool = pool(tmp.path(), clock);
        let result = rotate(&mut pool, None, 300, |candidate| async move {
            if candidate == "p1" {
                Err(EngineError::Unauthorized)
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(result.profile_id, "p2");
        assert_eq!(result.canary_failures, 1);
        assert!(!pool.is_eligible("p1", None));
    }

    #[tokio::test]
    async fn rotate_exhausted_when_every_candidate_fails_canary() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "p1");
        let clock = Arc::new(FakeClock::new(0));
        let mut pool = pool(tmp.path(), clock);
        let result = rotate(&mut pool, None, 300, |_| async { Err(EngineError::Unauthorized) }).await;
        assert!(matches!(result, Err(EngineError::RotationExhausted)));
    }

    #[test]
    fn single_profile_pool_trivially_selects_itself_when_eligible() {
        let tmp = tempfile::tempdir().unwrap();
        write_profile(tmp.path(), "primary", "only");
        let clock = Arc::new(FakeClock::new(0));
        let pool = pool(tmp.path(), clock);
        let ids: Vec<_> = pool.candidates(None).into_iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["only".to_string()]);
    }
}
