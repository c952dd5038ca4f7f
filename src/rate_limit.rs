//! Per-client sliding-window admission control.
//!
//! Each IP owns a queue of admission instants. A request is admitted when
//! fewer than `requests_per_minute` admissions survive in the trailing window.
//! The `DashMap` entry guard is held across prune, count and push, so two
//! requests from the same IP cannot both observe the last free slot.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: usize,
    window: Duration,
    entries: DashMap<IpAddr, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize) -> Self {
        Self::with_window(requests_per_minute, WINDOW)
    }

    pub fn with_window(requests_per_minute: usize, window: Duration) -> Self {
        Self {
            requests_per_minute,
            window,
            entries: DashMap::new(),
        }
    }

    pub fn requests_per_minute(&self) -> usize {
        self.requests_per_minute
    }

    pub fn check(&self, ip: IpAddr) -> RateDecision {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> RateDecision {
        let mut entry = self.entries.entry(ip).or_default();
        let timestamps = entry.value_mut();
        prune(timestamps, now, self.window);

        if timestamps.len() >= self.requests_per_minute {
            let retry_after = timestamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return RateDecision::Limited { retry_after };
        }

        timestamps.push_back(now);
        RateDecision::Allowed
    }

    /// Drops IPs whose windows have emptied. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, timestamps| {
            prune(timestamps, now, self.window);
            !timestamps.is_empty()
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn only_the_request_over_the_limit_is_rejected() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();

        let decisions: Vec<_> = (0..6)
            .map(|i| limiter.check_at(ip(1), start + Duration::from_secs(i)))
            .collect();

        assert!(decisions[..5].iter().all(|d| *d == RateDecision::Allowed));
        assert_eq!(
            decisions[5],
            RateDecision::Limited {
                retry_after: Duration::from_secs(55)
            }
        );
    }

    #[test]
    fn window_expiry_readmits() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert_eq!(limiter.check_at(ip(1), start), RateDecision::Allowed);
        assert_eq!(limiter.check_at(ip(1), start), RateDecision::Allowed);
        assert!(matches!(
            limiter.check_at(ip(1), start + Duration::from_secs(30)),
            RateDecision::Limited { .. }
        ));
        assert_eq!(
            limiter.check_at(ip(1), start + WINDOW),
            RateDecision::Allowed
        );
    }

    #[test]
    fn rejected_requests_do_not_extend_the_window() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        assert_eq!(limiter.check_at(ip(1), start), RateDecision::Allowed);
        for second in 1..60 {
            assert!(matches!(
                limiter.check_at(ip(1), start + Duration::from_secs(second)),
                RateDecision::Limited { .. }
            ));
        }
        assert_eq!(
            limiter.check_at(ip(1), start + Duration::from_secs(60)),
            RateDecision::Allowed
        );
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert_eq!(limiter.check_at(ip(1), now), RateDecision::Allowed);
        assert_eq!(limiter.check_at(ip(2), now), RateDecision::Allowed);
        assert!(matches!(
            limiter.check_at(ip(1), now),
            RateDecision::Limited { .. }
        ));
    }

    #[test]
    fn cleanup_drops_idle_clients() {
        let limiter = RateLimiter::new(3);
        let start = Instant::now();
        limiter.check_at(ip(1), start);
        limiter.check_at(ip(2), start + Duration::from_secs(45));

        assert_eq!(limiter.cleanup_at(start + Duration::from_secs(61)), 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.cleanup_at(start + Duration::from_secs(120)), 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn concurrent_checks_never_overadmit() {
        let limiter = Arc::new(RateLimiter::new(50));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_at(ip(9), now) == RateDecision::Allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
