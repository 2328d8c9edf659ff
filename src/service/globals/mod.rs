use std::sync::atomic::{self, AtomicBool};

use tracing::info;

use crate::{
    config::TurnConfig,
    Config, Result,
};

pub struct Service {
    pub config: Config,

    pub shutdown: AtomicBool,
}

impl Service {
    pub fn load(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn turn(&self) -> Option<TurnConfig> {
        self.config.turn()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, atomic::Ordering::Relaxed);
        info!(target: "shutdown", "Received shutdown notification");
    }
}
