use chrono::{Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use baton_core::{
    BatonError, LimitExceeded, LimitKind, LimitPeriod, Principal, RateLimit, Result,
};
use baton_store::{ConfiguredLimit, Tables};

/// Admin limit config is refetched after this long.
const ADMIN_CACHE_TTL: Duration = Duration::from_secs(600);
/// User group membership is refetched after this long.
const GROUP_CACHE_TTL: Duration = Duration::from_secs(300);
/// Lifetime cost is refetched after this long.
const LIFETIME_CACHE_TTL: Duration = Duration::from_secs(30);
/// Violation records idle longer than this are eligible for trimming.
const VIOLATION_IDLE: Duration = Duration::from_secs(3600);

/// Progressive-punishment tunables. Tests shrink the windows.
#[derive(Debug, Clone)]
pub struct ProgressiveConfig {
    /// Violations must land within this window to count as consecutive.
    pub window: Duration,
    /// Consecutive violations that trigger a timeout.
    pub threshold: u32,
    pub base_timeout: Duration,
    pub escalated_timeout: Duration,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 5,
            base_timeout: Duration::from_secs(60),
            escalated_timeout: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
struct ViolationRecord {
    count: u32,
    last_violation_at: Instant,
    timeout_until: Option<Instant>,
    /// The user has already served a timeout — the next one escalates.
    served_timeout: bool,
}

struct CachedValue<T> {
    fetched_at: Instant,
    value: T,
}

/// Per-user cost admission control.
///
/// Limits are evaluated admin → group(s) → user; the first exceeded wins.
/// Lookups are layered behind TTL caches, and a stale value is served when
/// the store is unreachable.
pub struct RateLimiter {
    tables: Tables,
    progressive: ProgressiveConfig,
    admin_cache: Mutex<Option<CachedValue<Vec<ConfiguredLimit>>>>,
    group_cache: DashMap<String, CachedValue<Vec<String>>>,
    lifetime_cache: DashMap<String, CachedValue<f64>>,
    violations: DashMap<String, ViolationRecord>,
}

impl RateLimiter {
    pub fn new(tables: Tables) -> Self {
        Self::with_progressive(tables, ProgressiveConfig::default())
    }

    pub fn with_progressive(tables: Tables, progressive: ProgressiveConfig) -> Self {
        Self {
            tables,
            progressive,
            admin_cache: Mutex::new(None),
            group_cache: DashMap::new(),
            lifetime_cache: DashMap::new(),
            violations: DashMap::new(),
        }
    }

    /// Admit or reject a request before any LLM cost is incurred.
    ///
    /// `user_limit` is the per-request limit from the caller's options.
    pub async fn check(&self, principal: &Principal, user_limit: Option<&RateLimit>) -> Result<()> {
        self.maybe_trim();

        // Progressive timeout fails fast without consulting upstream.
        if let Some(record) = self.violations.get(&principal.user_id)
            && let Some(until) = record.timeout_until
            && until > Instant::now()
        {
            return Err(BatonError::RateLimited(LimitExceeded {
                kind: LimitKind::ProgressiveTimeout,
                period: None,
                spent: 0.0,
                cap: 0.0,
            }));
        }

        let record = self.tables.cost_record(&principal.user_id).await?;
        let groups = self.user_groups(&principal.user_id).await;

        // Lifetime cost is computed at most once per request and reused for
        // every "total" limit below.
        let mut lifetime: Option<f64> = None;

        let admin_limits = self.admin_limits().await;
        let mut ordered: Vec<ConfiguredLimit> = Vec::new();
        ordered.extend(
            admin_limits
                .iter()
                .filter(|l| l.kind == LimitKind::Admin)
                .cloned(),
        );
        ordered.extend(
            admin_limits
                .iter()
                .filter(|l| {
                    l.kind == LimitKind::Group
                        && l.group_name
                            .as_ref()
                            .is_some_and(|g| groups.iter().any(|ug| ug == g))
                })
                .cloned(),
        );
        if let Some(user_limit) = user_limit {
            ordered.push(ConfiguredLimit {
                kind: LimitKind::User,
                period: user_limit.period,
                rate: user_limit.rate,
                group_name: None,
            });
        }

        for limit in ordered {
            if limit.period == LimitPeriod::Unlimited {
                continue;
            }
            let spent = match limit.period {
                LimitPeriod::Hourly => {
                    let hour = Utc::now().hour() as usize;
                    record.hourly.get(hour).copied().unwrap_or(0.0)
                }
                LimitPeriod::Daily => record.daily,
                LimitPeriod::Monthly => record.monthly,
                LimitPeriod::Total => match lifetime {
                    Some(v) => v,
                    None => {
                        let v = self.lifetime_cost(&principal.user_id).await;
                        lifetime = Some(v);
                        v
                    }
                },
                LimitPeriod::Unlimited => unreachable!(),
            };
            if spent >= limit.rate {
                self.record_violation(&principal.user_id);
                info!(
                    user = %principal.user_id,
                    kind = %limit.kind,
                    period = limit.period.label(),
                    spent,
                    cap = limit.rate,
                    "request rejected by rate limit"
                );
                return Err(BatonError::RateLimited(LimitExceeded {
                    kind: limit.kind,
                    period: Some(limit.period.label().to_string()),
                    spent,
                    cap: limit.rate,
                }));
            }
        }

        // A clean pass breaks the consecutive-violation streak.
        if let Some(mut record) = self.violations.get_mut(&principal.user_id) {
            record.count = 0;
        }
        Ok(())
    }

    fn record_violation(&self, user_id: &str) {
        let now = Instant::now();
        let mut record = self
            .violations
            .entry(user_id.to_string())
            .or_insert_with(|| ViolationRecord {
                count: 0,
                last_violation_at: now,
                timeout_until: None,
                served_timeout: false,
            });

        if record.served_timeout
            && record.timeout_until.is_some_and(|until| until <= now)
        {
            // Re-offense from a previous timeout holder.
            record.timeout_until = Some(now + self.progressive.escalated_timeout);
            record.count = 0;
            warn!(user = %user_id, "escalated progressive timeout");
            return;
        }

        if now.duration_since(record.last_violation_at) <= self.progressive.window {
            record.count += 1;
        } else {
            record.count = 1;
        }
        record.last_violation_at = now;

        if record.count >= self.progressive.threshold {
            record.timeout_until = Some(now + self.progressive.base_timeout);
            record.served_timeout = true;
            record.count = 0;
            warn!(user = %user_id, "progressive timeout imposed");
        }
    }

    /// Probabilistic trim of idle violation records (~1 % of checks).
    fn maybe_trim(&self) {
        if rand::random::<f64>() >= 0.01 {
            return;
        }
        let now = Instant::now();
        self.violations.retain(|_, r| {
            now.duration_since(r.last_violation_at) < VIOLATION_IDLE
                || r.timeout_until.is_some_and(|until| until > now)
        });
    }

    async fn admin_limits(&self) -> Vec<ConfiguredLimit> {
        {
            let cache = self.admin_cache.lock();
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < ADMIN_CACHE_TTL
            {
                return cached.value.clone();
            }
        }
        match self.tables.admin_limits().await {
            Ok(limits) => {
                *self.admin_cache.lock() = Some(CachedValue {
                    fetched_at: Instant::now(),
                    value: limits.clone(),
                });
                limits
            }
            Err(e) => {
                warn!(error = %e, "admin limit lookup failed, serving stale value");
                self.admin_cache
                    .lock()
                    .as_ref()
                    .map(|c| c.value.clone())
                    .unwrap_or_default()
            }
        }
    }

    async fn user_groups(&self, user_id: &str) -> Vec<String> {
        if let Some(cached) = self.group_cache.get(user_id)
            && cached.fetched_at.elapsed() < GROUP_CACHE_TTL
        {
            return cached.value.clone();
        }
        match self.tables.user_groups(user_id).await {
            Ok(groups) => {
                self.group_cache.insert(
                    user_id.to_string(),
                    CachedValue {
                        fetched_at: Instant::now(),
                        value: groups.clone(),
                    },
                );
                groups
            }
            Err(e) => {
                warn!(error = %e, "group lookup failed, serving stale value");
                self.group_cache
                    .get(user_id)
                    .map(|c| c.value.clone())
                    .unwrap_or_default()
            }
        }
    }

    async fn lifetime_cost(&self, user_id: &str) -> f64 {
        if let Some(cached) = self.lifetime_cache.get(user_id)
            && cached.fetched_at.elapsed() < LIFETIME_CACHE_TTL
        {
            return cached.value;
        }
        match self.tables.lifetime_cost(user_id).await {
            Ok(cost) => {
                self.lifetime_cache.insert(
                    user_id.to_string(),
                    CachedValue {
                        fetched_at: Instant::now(),
                        value: cost,
                    },
                );
                cost
            }
            Err(e) => {
                warn!(error = %e, "lifetime cost lookup failed, serving stale value");
                self.lifetime_cache.get(user_id).map(|c| c.value).unwrap_or(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_store::{Item, MemoryStore, TABLE_ADMIN, TABLE_GROUPS};
    use serde_json::json;
    use std::sync::Arc;

    fn principal() -> Principal {
        Principal::new("u@x.com", "tok")
    }

    async fn limiter_with(admin: Vec<(&str, serde_json::Value)>) -> RateLimiter {
        let tables = Tables::new(Arc::new(MemoryStore::new()));
        for (sk, attrs) in admin {
            tables
                .store()
                .put(TABLE_ADMIN, Item::new("limits", sk, attrs))
                .await
                .unwrap();
        }
        RateLimiter::new(tables)
    }

    #[tokio::test]
    async fn test_clean_user_passes() {
        let limiter = limiter_with(vec![(
            "admin",
            json!({"kind": "admin", "period": "daily", "rate": 10.0}),
        )])
        .await;
        assert!(limiter.check(&principal(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_daily_admin_limit_rejects() {
        let limiter = limiter_with(vec![(
            "admin",
            json!({"kind": "admin", "period": "daily", "rate": 10.0}),
        )])
        .await;
        limiter.tables.add_charge("u@x.com", 12.5).await.unwrap();
        let err = limiter.check(&principal(), None).await.unwrap_err();
        match err {
            BatonError::RateLimited(limit) => {
                assert_eq!(limit.kind, LimitKind::Admin);
                assert_eq!(limit.period.as_deref(), Some("Daily"));
                let msg = limit.message();
                assert!(msg.contains("$12.50 spent today (Admin limit)"), "{msg}");
                assert!(msg.contains("$10.00 / Daily"), "{msg}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_admin_wins_over_group_and_user() {
        let limiter = limiter_with(vec![
            ("admin", json!({"kind": "admin", "period": "daily", "rate": 1.0})),
            (
                "group:research",
                json!({"kind": "group", "period": "daily", "rate": 0.5}),
            ),
        ])
        .await;
        limiter
            .tables
            .store()
            .put(TABLE_GROUPS, Item::new("u@x.com", "research", json!({})))
            .await
            .unwrap();
        limiter.tables.add_charge("u@x.com", 5.0).await.unwrap();
        let user_limit = RateLimit {
            period: LimitPeriod::Daily,
            rate: 0.1,
        };
        // All three limits exceed; admin must be reported.
        let err = limiter
            .check(&principal(), Some(&user_limit))
            .await
            .unwrap_err();
        match err {
            BatonError::RateLimited(limit) => assert_eq!(limit.kind, LimitKind::Admin),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_group_limit_applies_only_to_members() {
        let limiter = limiter_with(vec![(
            "group:research",
            json!({"kind": "group", "period": "daily", "rate": 1.0}),
        )])
        .await;
        limiter.tables.add_charge("u@x.com", 5.0).await.unwrap();
        // Not a member — passes.
        assert!(limiter.check(&principal(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_total_limit_uses_lifetime_cost() {
        let limiter = limiter_with(vec![(
            "admin",
            json!({"kind": "admin", "period": "total", "rate": 3.0}),
        )])
        .await;
        limiter
            .tables
            .store()
            .put(
                baton_store::TABLE_COST,
                Item::new("u@x.com", "2025-01", json!({"monthly": 4.0})),
            )
            .await
            .unwrap();
        let err = limiter.check(&principal(), None).await.unwrap_err();
        match err {
            BatonError::RateLimited(limit) => {
                assert_eq!(limit.period.as_deref(), Some("Total"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_progressive_timeout_after_five_violations() {
        let tables = Tables::new(Arc::new(MemoryStore::new()));
        tables
            .store()
            .put(
                TABLE_ADMIN,
                Item::new("limits", "admin", json!({"kind": "admin", "period": "daily", "rate": 0.5})),
            )
            .await
            .unwrap();
        tables.add_charge("u@x.com", 1.0).await.unwrap();
        let limiter = RateLimiter::with_progressive(
            tables,
            ProgressiveConfig {
                window: Duration::from_secs(60),
                threshold: 5,
                base_timeout: Duration::from_secs(60),
                escalated_timeout: Duration::from_secs(900),
            },
        );

        for _ in 0..5 {
            let err = limiter.check(&principal(), None).await.unwrap_err();
            assert!(matches!(err, BatonError::RateLimited(_)));
        }
        // Sixth request fails fast with the progressive-timeout kind.
        let err = limiter.check(&principal(), None).await.unwrap_err();
        match err {
            BatonError::RateLimited(limit) => {
                assert_eq!(limit.kind, LimitKind::ProgressiveTimeout);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlimited_period_never_rejects() {
        let limiter = limiter_with(vec![(
            "admin",
            json!({"kind": "admin", "period": "unlimited", "rate": 0.0}),
        )])
        .await;
        limiter.tables.add_charge("u@x.com", 1000.0).await.unwrap();
        assert!(limiter.check(&principal(), None).await.is_ok());
    }
}
