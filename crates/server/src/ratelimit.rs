//! Per-identity token bucket rate limiting.
//!
//! Each (route class, identity) pair owns a bucket that refills
//! continuously in proportion to elapsed time. Identities are the API key
//! fingerprint for authenticated requests and the client address otherwise.
//!
//! # Memory Safety
//!
//! The bucket map is bounded by `max_entries`. New identities beyond it are
//! refused with 429 until the background cleanup evicts buckets idle for
//! longer than `entry_ttl_secs`.
//!
//! # Security Note
//!
//! X-Forwarded-For and X-Real-IP are only trusted when the connecting peer
//! is listed in `trusted_proxies`:
//!
//! - Empty list (default): only the direct connection address is used
//! - List of IPs/CIDRs: headers trusted only when the peer is in the list
//! - ["*"]: headers trusted from all peers (NOT recommended for production)

use axum::http::HeaderMap;
use dashmap::{DashMap, mapref::entry::Entry};
use exgate_core::RouteClass;
use exgate_core::config::{BucketConfig, RateLimitConfig};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of time for bucket refills.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Monotonic wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A token bucket. `0 <= tokens <= capacity` holds after every operation.
#[derive(Clone, Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: config.refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).clamp(0.0, self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Whole seconds until `cost` tokens are available (at least 1).
    fn retry_after_secs(&self, cost: f64) -> u64 {
        let deficit = cost - self.tokens;
        if deficit <= 0.0 {
            return 0;
        }
        ((deficit / self.refill_per_sec).ceil() as u64).max(1)
    }
}

/// Reason for rate limit rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// The identity's bucket is empty.
    RateLimited,
    /// The limiter is tracking `max_entries` identities and cannot add another.
    AtCapacity,
}

/// Returned when a request is not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitError {
    /// Number of seconds to wait before retrying.
    pub retry_after_secs: u64,
    pub reason: RateLimitReason,
}

type BucketKey = (RouteClass, String);

/// Rate limiter shared across requests. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<RateLimiterInner>>,
}

struct RateLimiterInner {
    buckets: DashMap<BucketKey, Mutex<TokenBucket>>,
    config: RateLimitConfig,
    max_entries: usize,
    entry_ttl: Duration,
    clock: Arc<dyn Clock>,
    /// Whether the at-capacity warning has been logged (prevents log spam during floods).
    at_capacity_warned: AtomicBool,
}

impl RateLimiter {
    /// Create a rate limiter from configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter driven by `clock`.
    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }
        Self {
            inner: Some(Arc::new(RateLimiterInner {
                buckets: DashMap::new(),
                config: config.clone(),
                max_entries: config.max_entries as usize,
                entry_ttl: Duration::from_secs(config.entry_ttl_secs),
                clock,
                at_capacity_warned: AtomicBool::new(false),
            })),
        }
    }

    /// Check if rate limiting is enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Take `cost` tokens for `identity`, returning whether the request may proceed.
    pub fn allow(&self, class: RouteClass, identity: &str, cost: u32) -> bool {
        self.check(class, identity, cost).is_ok()
    }

    /// Like [`RateLimiter::allow`], with the retry hint on denial.
    pub fn check(
        &self,
        class: RouteClass,
        identity: &str,
        cost: u32,
    ) -> Result<(), RateLimitError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let now = inner.clock.now();
        let cost = f64::from(cost);
        let key = (class, identity.to_string());

        if let Some(bucket) = inner.buckets.get(&key) {
            return take(&bucket, cost, now);
        }

        // DashMap's len() can deadlock if called while holding an entry lock,
        // so the capacity check happens first. The race may overshoot
        // max_entries by at most the number of concurrent first requests.
        let current_len = inner.buckets.len();

        match inner.buckets.entry(key) {
            Entry::Occupied(entry) => take(entry.get(), cost, now),
            Entry::Vacant(entry) => {
                if current_len >= inner.max_entries {
                    inner.warn_at_capacity(current_len);
                    return Err(RateLimitError {
                        retry_after_secs: inner.config.cleanup_interval_secs.max(1),
                        reason: RateLimitReason::AtCapacity,
                    });
                }
                let bucket = entry.insert(Mutex::new(TokenBucket::new(
                    inner.config.bucket(class),
                    now,
                )));
                take(&bucket, cost, now)
            }
        }
    }

    /// Seconds until `identity` could spend `cost` tokens (0 if it can now).
    pub fn retry_after(&self, class: RouteClass, identity: &str, cost: u32) -> u64 {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let key = (class, identity.to_string());
        let Some(bucket) = inner.buckets.get(&key) else {
            return 0;
        };
        let mut bucket = lock(&bucket);
        bucket.refill(inner.clock.now());
        bucket.retry_after_secs(f64::from(cost))
    }

    /// Evict buckets idle longer than the configured TTL.
    /// Returns the number of buckets evicted.
    ///
    /// Uses `remove_if` so a bucket touched between the scan and the
    /// removal survives.
    pub fn cleanup(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let now = inner.clock.now();
        let ttl = inner.entry_ttl;
        let idle = |bucket: &Mutex<TokenBucket>| {
            now.saturating_duration_since(lock(bucket).last_refill) > ttl
        };

        let candidates: Vec<BucketKey> = inner
            .buckets
            .iter()
            .filter(|entry| idle(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            if inner.buckets.remove_if(&key, |_, bucket| idle(bucket)).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            // Allow the capacity warning to fire again if we fill up.
            inner.at_capacity_warned.store(false, Ordering::Relaxed);
            tracing::debug!(
                evicted,
                remaining = inner.buckets.len(),
                "Rate limiter cleanup completed"
            );
        }
        evicted
    }

    /// Get the current number of tracked buckets.
    pub fn entry_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.buckets.len())
    }
}

impl RateLimiterInner {
    /// Log once per capacity event.
    fn warn_at_capacity(&self, current_entries: usize) {
        if !self.at_capacity_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                current_entries,
                max_entries = self.max_entries,
                "Rate limiter at capacity, rejecting new identities. \
                 This warning is logged once per capacity event to prevent log spam."
            );
        }
    }
}

fn lock(bucket: &Mutex<TokenBucket>) -> std::sync::MutexGuard<'_, TokenBucket> {
    bucket.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("rate limit bucket mutex was poisoned, recovering with into_inner()");
        poisoned.into_inner()
    })
}

fn take(bucket: &Mutex<TokenBucket>, cost: f64, now: Instant) -> Result<(), RateLimitError> {
    let mut bucket = lock(bucket);
    if bucket.try_take(cost, now) {
        Ok(())
    } else {
        Err(RateLimitError {
            retry_after_secs: bucket.retry_after_secs(cost),
            reason: RateLimitReason::RateLimited,
        })
    }
}

/// A parsed trusted proxy entry (either an IP or CIDR range).
#[derive(Clone, Debug)]
enum TrustedEntry {
    Ip(IpAddr),
    Cidr(IpNet),
}

/// Trusted proxy configuration for client address extraction.
#[derive(Clone, Debug)]
pub(crate) enum TrustedProxies {
    /// Never trust forwarded headers (default, most secure).
    None,
    /// Trust headers from all sources (dangerous, for development only).
    All,
    /// Trust headers only from specific IPs/CIDRs.
    List(Vec<TrustedEntry>),
}

impl TrustedProxies {
    pub fn from_config(proxies: &[String]) -> Self {
        if proxies.is_empty() {
            Self::None
        } else if proxies.len() == 1 && proxies[0] == "*" {
            Self::All
        } else {
            let entries: Vec<TrustedEntry> = proxies
                .iter()
                .filter_map(|p| {
                    if p.contains('/') {
                        match p.parse::<IpNet>() {
                            Ok(net) => Some(TrustedEntry::Cidr(net)),
                            Err(e) => {
                                tracing::warn!("Invalid CIDR in trusted_proxies: '{}': {}", p, e);
                                None
                            }
                        }
                    } else {
                        match p.parse::<IpAddr>() {
                            Ok(ip) => Some(TrustedEntry::Ip(ip)),
                            Err(e) => {
                                tracing::warn!("Invalid IP in trusted_proxies: '{}': {}", p, e);
                                None
                            }
                        }
                    }
                })
                .collect();
            Self::List(entries)
        }
    }

    /// Check if the given connection address is a trusted proxy.
    pub fn is_trusted(&self, connection_ip: IpAddr) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(entries) => entries.iter().any(|entry| match entry {
                TrustedEntry::Ip(trusted) => *trusted == connection_ip,
                TrustedEntry::Cidr(network) => network.contains(&connection_ip),
            }),
        }
    }

    /// Client address for a request, honoring forwarded headers only from
    /// trusted peers. Formatted as `ip:<address>`.
    pub fn client_identity(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        let trust_headers = match peer {
            Some(ip) => self.is_trusted(ip),
            None => matches!(self, Self::All),
        };

        let ip = trust_headers
            .then(|| extract_forwarded_ip(headers))
            .flatten()
            .or(peer);

        match ip {
            Some(ip) => format!("ip:{ip}"),
            None => "ip:unknown".to_string(),
        }
    }
}

/// Extract the client address from forwarding headers.
fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // Take the first address in the chain (the original client).
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(s) = forwarded.to_str()
        && let Some(Ok(ip)) = s.split(',').next().map(|ip| ip.trim().parse())
    {
        return Some(ip);
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Spawn a background task that periodically evicts idle buckets.
/// Returns a handle that can be used to stop the cleanup task.
pub fn spawn_cleanup_task(limiter: RateLimiter, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let evicted = limiter.cleanup();
            if evicted > 0 {
                tracing::info!(evicted, "Rate limiter cleanup task evicted idle buckets");
            }
        }
    })
}
