//! # Relay Module
//!
//! Pairs one device connection with one upstream connection and routes
//! traffic between them. The actix actor in `websocket.rs` owns a
//! `SessionRelay` and applies the `DeviceAction`s it returns.

pub mod session;

pub use session::{CloseCause, DeviceAction, RelaySettings, SessionRelay};
