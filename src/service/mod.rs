use tokio::time::interval;
use tracing::debug;

use crate::{Config, Result};

pub mod globals;
pub mod hub;
pub mod ids;
pub mod origin;
pub mod rate_limiter;
pub mod tokens;

pub struct Services {
    pub ids: ids::Service,
    pub origin: origin::Service,
    pub rate_limiter: rate_limiter::Service,
    pub tokens: tokens::Service,
    pub hub: hub::Service,
    pub globals: globals::Service,
}

impl Services {
    pub fn build(config: Config) -> Result<Self> {
        Ok(Self {
            ids: ids::Service::load(&config),
            origin: origin::Service::load(&config),
            rate_limiter: rate_limiter::Service::build(),
            tokens: tokens::Service::build(),
            hub: hub::Service::build(),

            globals: globals::Service::load(config)?,
        })
    }

    /// Background maintenance: expired relay tokens, stale event-stream
    /// sessions, and idle rate-limit buckets all age out on fixed cadences.
    pub fn start_sweepers(&'static self) {
        tokio::spawn(async move {
            let mut ticker = interval(tokens::SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                self.tokens.sweep();
            }
        });

        tokio::spawn(async move {
            let mut ticker = interval(hub::REAP_INTERVAL);
            loop {
                ticker.tick().await;
                self.hub.reap_stale_sessions();
            }
        });

        tokio::spawn(async move {
            let mut ticker = interval(rate_limiter::SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                self.rate_limiter.sweep();
            }
        });

        debug!("Background sweepers running");
    }
}
