//! # Application State
//!
//! State shared by every HTTP handler and device actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: many handlers share one configuration without copying it
//! - **Thread safety**: actix runs one worker per core, all reading the same `Arc`
//!
//! ### No Lock
//! The configuration is loaded once at startup and never changes afterwards, so
//! it is shared read-only. Each session keeps its own state inside its actor;
//! there is no cross-session registry to protect.

use crate::config::AppConfig;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    config: Arc<AppConfig>,

    /// When the server started
    start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
