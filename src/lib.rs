pub mod api;
pub mod clap;
mod config;
mod service;
mod utils;

// Not async due to services() being used in many closures, and async closures are not stable as
// of writing. This is the case for every other occurence of sync Mutex/RwLock in the hub as well.
use std::sync::RwLock;

pub use config::Config;
pub use service::Services;
pub use utils::error::{Error, Result};

pub static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}
