//! Per-IP rate limiting with a sliding window.
//!
//! Each (client IP, tier) pair holds a token bucket that refills gradually
//! over the window. Login/logout use the stricter `Auth` tier.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::AppState;

use super::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    /// General API endpoints
    Api,
    /// Login and logout
    Auth,
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    tokens: u32,
    window_start: Instant,
    /// Point up to which elapsed time has been converted into tokens
    refilled_at: Instant,
    last_request: Instant,
}

impl RateLimitEntry {
    fn new(max_tokens: u32, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            window_start: now,
            refilled_at: now,
            last_request: now,
        }
    }
}

/// Thread-safe rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<(IpAddr, RateLimitTier), RateLimitEntry>,
    config: RateLimitConfig,
    window_duration: Duration,
}

/// Rate limit status after an allowed request
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub remaining: u32,
    pub limit: u32,
    /// Seconds until the window resets
    pub reset_after: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            window_duration: Duration::from_secs(config.window_seconds.max(1)),
            config,
        }
    }

    /// Consume a token for `ip` in `tier`.
    ///
    /// Returns the remaining budget, or the number of seconds to wait.
    pub fn check(&self, ip: IpAddr, tier: RateLimitTier) -> Result<RateLimitInfo, u64> {
        self.check_at(ip, tier, Instant::now())
    }

    fn check_at(
        &self,
        ip: IpAddr,
        tier: RateLimitTier,
        now: Instant,
    ) -> Result<RateLimitInfo, u64> {
        if !self.config.enabled {
            return Ok(RateLimitInfo {
                remaining: u32::MAX,
                limit: u32::MAX,
                reset_after: 0,
            });
        }

        let max_tokens = self.limit_for(tier);
        let mut entry = self
            .entries
            .entry((ip, tier))
            .or_insert_with(|| RateLimitEntry::new(max_tokens, now));

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= self.window_duration {
            entry.tokens = max_tokens;
            entry.window_start = now;
            entry.refilled_at = now;
        } else if max_tokens > 0 {
            let since_refill = now.duration_since(entry.refilled_at);
            let per_second = max_tokens as f64 / self.window_duration.as_secs_f64();
            let replenished = (since_refill.as_secs_f64() * per_second) as u32;
            if replenished > 0 {
                // Carry the unconverted remainder into the next request
                entry.refilled_at += Duration::from_secs_f64(replenished as f64 / per_second);
                entry.tokens = entry.tokens.saturating_add(replenished).min(max_tokens);
            }
        }
        entry.last_request = now;

        let reset_after = self
            .window_duration
            .saturating_sub(now.duration_since(entry.window_start))
            .as_secs();

        if entry.tokens > 0 {
            entry.tokens -= 1;
            Ok(RateLimitInfo {
                remaining: entry.tokens,
                limit: max_tokens,
                reset_after,
            })
        } else {
            Err(reset_after.max(1))
        }
    }

    pub fn limit_for(&self, tier: RateLimitTier) -> u32 {
        match tier {
            RateLimitTier::Api => self.config.api_requests_per_window,
            RateLimitTier::Auth => self.config.auth_requests_per_window,
        }
    }

    /// Drop entries idle for more than two windows
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let expiry = self.window_duration * 2;
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_request) < expiry);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Client IP from proxy headers, then the socket address
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
    if let Some(ip) = forwarded {
        return ip;
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
    if let Some(ip) = real_ip {
        return ip;
    }

    peer.map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub async fn rate_limit_api(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    rate_limit_with_tier(state, request, next, RateLimitTier::Api).await
}

pub async fn rate_limit_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    rate_limit_with_tier(state, request, next, RateLimitTier::Auth).await
}

async fn rate_limit_with_tier(
    state: Arc<AppState>,
    request: Request<Body>,
    next: Next,
    tier: RateLimitTier,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = client_ip(request.headers(), peer);

    match state.rate_limiter.check(ip, tier) {
        Ok(info) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(info.limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(info.remaining));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(info.reset_after));
            response
        }
        Err(retry_after) => {
            tracing::debug!(ip = %ip, tier = ?tier, "Rate limit exceeded");
            let mut response = ApiError::rate_limited(format!(
                "Rate limit exceeded. Try again in {} seconds.",
                retry_after
            ))
            .with_retry_after(retry_after)
            .into_response();
            let headers = response.headers_mut();
            headers.insert(
                "X-RateLimit-Limit",
                HeaderValue::from(state.rate_limiter.limit_for(tier)),
            );
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            response
        }
    }
}

/// Periodically drop stale limiter entries
pub fn spawn_cleanup_task(rate_limiter: Arc<RateLimiter>, cleanup_interval_secs: u64) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(cleanup_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            rate_limiter.cleanup_expired();
            tracing::debug!(
                entries = rate_limiter.entry_count(),
                "Rate limiter cleanup complete"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            api_requests_per_window: 10,
            auth_requests_per_window: 3,
            window_seconds: 60,
            cleanup_interval: 300,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_blocks_after_limit() {
        let limiter = RateLimiter::new(test_config());
        for i in 0..10 {
            assert!(
                limiter.check(ip("10.0.0.1"), RateLimitTier::Api).is_ok(),
                "request {} should pass",
                i
            );
        }
        let retry = limiter.check(ip("10.0.0.1"), RateLimitTier::Api).unwrap_err();
        assert!(retry >= 1 && retry <= 60);
    }

    #[test]
    fn test_ips_and_tiers_are_independent() {
        let limiter = RateLimiter::new(test_config());
        for _ in 0..3 {
            limiter.check(ip("10.0.0.1"), RateLimitTier::Auth).unwrap();
        }
        assert!(limiter.check(ip("10.0.0.1"), RateLimitTier::Auth).is_err());
        assert!(limiter.check(ip("10.0.0.1"), RateLimitTier::Api).is_ok());
        assert!(limiter.check(ip("10.0.0.2"), RateLimitTier::Auth).is_ok());
    }

    #[test]
    fn test_disabled_limiter_allows_everything() {
        let mut config = test_config();
        config.enabled = false;
        let limiter = RateLimiter::new(config);
        for _ in 0..100 {
            assert!(limiter.check(ip("10.0.0.1"), RateLimitTier::Auth).is_ok());
        }
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_client_ip_resolution() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.9:5000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), ip("192.168.1.9"));
        assert_eq!(client_ip(&headers, None), ip("127.0.0.1"));

        headers.insert("x-real-ip", HeaderValue::from_static("172.16.0.4"));
        assert_eq!(client_ip(&headers, Some(peer)), ip("172.16.0.4"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), ip("203.0.113.7"));
    }

    #[test]
    fn test_frequent_requests_still_refill() {
        let mut config = test_config();
        config.api_requests_per_window = 60;
        let limiter = RateLimiter::new(config);
        let client = ip("10.0.0.3");
        let start = Instant::now();

        for _ in 0..60 {
            limiter.check_at(client, RateLimitTier::Api, start).unwrap();
        }
        let at = |ms: u64| start + Duration::from_millis(ms);

        // One token per second, polled every 600ms
        assert!(limiter.check_at(client, RateLimitTier::Api, at(600)).is_err());
        assert!(limiter.check_at(client, RateLimitTier::Api, at(1200)).is_ok());
        assert!(limiter.check_at(client, RateLimitTier::Api, at(1800)).is_err());
        assert!(limiter.check_at(client, RateLimitTier::Api, at(2400)).is_ok());
        assert!(limiter.check_at(client, RateLimitTier::Api, at(3000)).is_ok());
        assert!(limiter.check_at(client, RateLimitTier::Api, at(3600)).is_err());
    }

    #[test]
    fn test_cleanup_keeps_recent_entries() {
        let limiter = RateLimiter::new(test_config());
        limiter.check(ip("10.0.0.1"), RateLimitTier::Api).unwrap();
        limiter.cleanup_expired();
        assert_eq!(limiter.entry_count(), 1);
    }
}
