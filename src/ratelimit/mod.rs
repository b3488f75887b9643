//! Per-identity sliding-window rate limiting.
//!
//! Each identity key owns a deque of request instants covering the trailing
//! hour. The check and the record happen while holding that key's map entry,
//! so concurrent requests for one identity cannot both slip under a cap.

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::classify::{Category, Complexity};
use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
/// Idle identities are dropped once every this many checks.
const SWEEP_EVERY: u64 = 256;

/// Rate-limiting subject: `address` or `address:user`.
pub fn identity_key(address: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user) => format!("{address}:{user}"),
        None => address.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Limits {
    pub const fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            per_minute,
            per_hour,
        }
    }
}

/// Quota bucket. Heavier work gets lower caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTier {
    SimpleQuery,
    FileAnalysis,
    ComplexAnalysis,
    Default,
}

impl RateTier {
    pub fn for_query(category: Category, complexity: Complexity) -> Self {
        match (category, complexity) {
            (_, Complexity::Complex) => RateTier::ComplexAnalysis,
            (Category::InvoiceAnalysis, _) => RateTier::FileAnalysis,
            (Category::GeneralConsultation, _) => RateTier::SimpleQuery,
            _ => RateTier::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blacklisted,
    MinuteLimit,
    HourLimit,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Blacklisted => "Blacklisted",
            DenyReason::MinuteLimit => "Minute limit exceeded",
            DenyReason::HourLimit => "Hour limit exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_secs: None,
        }
    }

    fn deny(reason: DenyReason, retry_after_secs: Option<u64>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    pub tracked_identities: usize,
    pub blacklisted: usize,
}

pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    blacklist: ArcSwap<HashSet<String>>,
    config: RateLimitConfig,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let blacklist: HashSet<String> = config.blacklist.iter().cloned().collect();
        Self {
            windows: DashMap::new(),
            blacklist: ArcSwap::from_pointee(blacklist),
            config,
            checks: AtomicU64::new(0),
        }
    }

    pub fn limits(&self, tier: RateTier) -> Limits {
        self.config.limits(tier)
    }

    pub fn check(&self, identity: &str, tier: RateTier) -> Decision {
        if self.blacklist.load().contains(identity) {
            return Decision::deny(DenyReason::Blacklisted, None);
        }

        let decision = self.record(identity, tier);

        // Runs after the entry guard is released; retain locks every shard.
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep();
        }
        decision
    }

    /// Check and record under the identity's entry lock.
    fn record(&self, identity: &str, tier: RateTier) -> Decision {
        let now = Instant::now();
        let limits = self.limits(tier);

        match self.windows.entry(identity.to_string()) {
            Entry::Occupied(mut entry) => {
                let window = entry.get_mut();
                prune(window, now);

                let last_hour = window.len();
                let last_minute = window
                    .iter()
                    .rev()
                    .take_while(|t| now.duration_since(**t) < MINUTE)
                    .count();

                if last_minute >= limits.per_minute as usize {
                    debug!(identity, last_minute, ?tier, "minute cap reached");
                    return Decision::deny(DenyReason::MinuteLimit, Some(MINUTE.as_secs()));
                }
                if last_hour >= limits.per_hour as usize {
                    debug!(identity, last_hour, ?tier, "hour cap reached");
                    return Decision::deny(DenyReason::HourLimit, Some(HOUR.as_secs()));
                }

                window.push_back(now);
                Decision::allow()
            }
            Entry::Vacant(entry) => {
                if limits.per_minute == 0 {
                    return Decision::deny(DenyReason::MinuteLimit, Some(MINUTE.as_secs()));
                }
                if limits.per_hour == 0 {
                    return Decision::deny(DenyReason::HourLimit, Some(HOUR.as_secs()));
                }
                entry.insert(VecDeque::from([now]));
                Decision::allow()
            }
        }
    }

    /// Drop identities whose windows have fully expired.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.windows.retain(|_, window| {
            prune(window, now);
            !window.is_empty()
        });
    }

    pub fn block(&self, identity: &str) {
        self.blacklist.rcu(|current| {
            let mut next = HashSet::clone(current);
            next.insert(identity.to_string());
            next
        });
    }

    pub fn unblock(&self, identity: &str) {
        self.blacklist.rcu(|current| {
            let mut next = HashSet::clone(current);
            next.remove(identity);
            next
        });
    }

    pub fn replace_blacklist(&self, identities: impl IntoIterator<Item = String>) {
        self.blacklist
            .store(Arc::new(identities.into_iter().collect()));
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            tracked_identities: self.windows.len(),
            blacklisted: self.blacklist.load().len(),
        }
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = window.front() {
        if now.duration_since(*oldest) >= HOUR {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, per_hour: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            simple_query: Limits::new(per_minute, per_hour),
            ..RateLimitConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn minute_cap_denies_then_rolls_over() {
        let limiter = limiter(30, 500);

        for _ in 0..30 {
            assert!(limiter.check("10.0.0.1", RateTier::SimpleQuery).allowed);
        }
        let denied = limiter.check("10.0.0.1", RateTier::SimpleQuery);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::MinuteLimit));
        assert_eq!(denied.retry_after_secs, Some(60));

        // Other identities are unaffected.
        assert!(limiter.check("10.0.0.2", RateTier::SimpleQuery).allowed);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("10.0.0.1", RateTier::SimpleQuery).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn hour_cap_applies_after_minutes_pass() {
        let limiter = limiter(5, 8);

        for _ in 0..5 {
            assert!(limiter.check("k", RateTier::SimpleQuery).allowed);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..3 {
            assert!(limiter.check("k", RateTier::SimpleQuery).allowed);
        }
        let denied = limiter.check("k", RateTier::SimpleQuery);
        assert_eq!(denied.reason, Some(DenyReason::HourLimit));
        assert_eq!(denied.retry_after_secs, Some(3600));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(limiter.check("k", RateTier::SimpleQuery).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_requests_are_not_counted() {
        let limiter = limiter(1, 500);
        assert!(limiter.check("k", RateTier::SimpleQuery).allowed);
        for _ in 0..10 {
            assert!(!limiter.check("k", RateTier::SimpleQuery).allowed);
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check("k", RateTier::SimpleQuery).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_identities_are_dropped_by_checks_alone() {
        let limiter = limiter(1000, 1000);
        for i in 0..1000 {
            let identity = format!("10.1.{}.{}", i / 256, i % 256);
            assert!(limiter.check(&identity, RateTier::SimpleQuery).allowed);
        }
        assert_eq!(limiter.stats().tracked_identities, 1000);

        tokio::time::advance(Duration::from_secs(7200)).await;
        for _ in 0..SWEEP_EVERY {
            limiter.check("fresh", RateTier::SimpleQuery);
        }
        assert_eq!(limiter.stats().tracked_identities, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_checks_never_exceed_the_cap() {
        let limiter = Arc::new(limiter(30, 500));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("k", RateTier::SimpleQuery).allowed })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 30);
    }

    #[test]
    fn blacklist_rejects_before_counting() {
        let limiter = limiter(30, 500);
        limiter.block("1.2.3.4:mallory");

        let decision = limiter.check("1.2.3.4:mallory", RateTier::SimpleQuery);
        assert_eq!(decision.reason, Some(DenyReason::Blacklisted));
        assert_eq!(limiter.stats().tracked_identities, 0);
        assert_eq!(limiter.stats().blacklisted, 1);

        limiter.unblock("1.2.3.4:mallory");
        assert!(limiter.check("1.2.3.4:mallory", RateTier::SimpleQuery).allowed);

        limiter.replace_blacklist(vec!["a".to_string(), "b".to_string()]);
        assert!(!limiter.check("a", RateTier::Default).allowed);
        assert_eq!(limiter.stats().blacklisted, 2);
    }

    #[test]
    fn tiers_follow_category_and_complexity() {
        assert_eq!(
            RateTier::for_query(Category::GeneralConsultation, Complexity::Fast),
            RateTier::SimpleQuery
        );
        assert_eq!(
            RateTier::for_query(Category::InvoiceAnalysis, Complexity::Normal),
            RateTier::FileAnalysis
        );
        assert_eq!(
            RateTier::for_query(Category::GeneralConsultation, Complexity::Complex),
            RateTier::ComplexAnalysis
        );
        assert_eq!(
            RateTier::for_query(Category::MarginOptimization, Complexity::Fast),
            RateTier::Default
        );
    }

    #[test]
    fn identity_includes_user_when_present() {
        assert_eq!(identity_key("1.2.3.4", None), "1.2.3.4");
        assert_eq!(identity_key("1.2.3.4", Some("u1")), "1.2.3.4:u1");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_identities() {
        let limiter = limiter(30, 500);
        limiter.check("idle", RateTier::SimpleQuery);
        assert_eq!(limiter.stats().tracked_identities, 1);

        tokio::time::advance(HOUR).await;
        limiter.sweep();
        assert_eq!(limiter.stats().tracked_identities, 0);
    }
}
