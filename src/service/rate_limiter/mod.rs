use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{Error, Result};

/// Idle buckets are garbage-collected on this cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// A bucket untouched for this long is forgotten; it would be full again
/// anyway.
const IDLE_AFTER: Duration = Duration::from_secs(600);

/// Every rate-limited entry point into the server.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Restriction {
    SocketUpgrade,
    EventStreamPost,
    RoomIdMint,
    CredentialMint,
    DiagnosticToken,
}

#[derive(Clone, Copy, Debug)]
struct Quota {
    per_minute: u32,
    burst: u32,
}

impl Restriction {
    fn quota(self) -> Quota {
        match self {
            Restriction::SocketUpgrade => Quota {
                per_minute: 10,
                burst: 5,
            },
            Restriction::EventStreamPost => Quota {
                per_minute: 1200,
                burst: 200,
            },
            Restriction::RoomIdMint => Quota {
                per_minute: 30,
                burst: 10,
            },
            Restriction::CredentialMint => Quota {
                per_minute: 5,
                burst: 5,
            },
            Restriction::DiagnosticToken => Quota {
                per_minute: 5,
                burst: 5,
            },
        }
    }
}

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Per-IP token buckets, one per (entry point, address) pair.
pub struct Service {
    buckets: Mutex<HashMap<(Restriction, IpAddr), Bucket>>,
}

impl Service {
    pub fn build() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token from the caller's bucket, or rejects the request.
    pub fn check(&self, restriction: Restriction, ip: IpAddr) -> Result<()> {
        self.check_at(restriction, ip, Instant::now())
    }

    fn check_at(&self, restriction: Restriction, ip: IpAddr, now: Instant) -> Result<()> {
        let quota = restriction.quota();
        let rate = f64::from(quota.per_minute) / 60.0;

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry((restriction, ip)).or_insert(Bucket {
            tokens: f64::from(quota.burst),
            refreshed: now,
        });

        let elapsed = now.saturating_duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(f64::from(quota.burst));
        bucket.refreshed = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            debug!(?restriction, %ip, "rate limit exceeded");
            Err(Error::LimitExceeded)
        }
    }

    pub fn sweep(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.refreshed.elapsed() < IDLE_AFTER);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, remaining = buckets.len(), "swept idle rate-limit buckets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "203.0.113.7";

    #[test]
    fn burst_is_honored_then_exhausted() {
        let limiter = Service::build();
        let ip: IpAddr = IP.parse().unwrap();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter
                .check_at(Restriction::CredentialMint, ip, now)
                .is_ok());
        }
        assert!(limiter
            .check_at(Restriction::CredentialMint, ip, now)
            .is_err());
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = Service::build();
        let ip: IpAddr = IP.parse().unwrap();
        let start = Instant::now();

        for _ in 0..5 {
            limiter
                .check_at(Restriction::CredentialMint, ip, start)
                .unwrap();
        }
        assert!(limiter
            .check_at(Restriction::CredentialMint, ip, start)
            .is_err());

        // 5/min refills one token every 12 seconds.
        let later = start + Duration::from_secs(13);
        assert!(limiter
            .check_at(Restriction::CredentialMint, ip, later)
            .is_ok());
        assert!(limiter
            .check_at(Restriction::CredentialMint, ip, later)
            .is_err());
    }

    #[test]
    fn buckets_are_keyed_per_ip_and_entry_point() {
        let limiter = Service::build();
        let now = Instant::now();
        let first: IpAddr = IP.parse().unwrap();
        let second: IpAddr = "203.0.113.8".parse().unwrap();

        for _ in 0..5 {
            limiter
                .check_at(Restriction::CredentialMint, first, now)
                .unwrap();
        }
        assert!(limiter
            .check_at(Restriction::CredentialMint, first, now)
            .is_err());

        // A different address and a different entry point are unaffected.
        assert!(limiter
            .check_at(Restriction::CredentialMint, second, now)
            .is_ok());
        assert!(limiter.check_at(Restriction::RoomIdMint, first, now).is_ok());
    }
}
