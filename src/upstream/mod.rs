//! # Upstream Module
//!
//! The relay's outbound leg: one WebSocket per device session to the realtime
//! speech service, driven by a small state machine in its own task.

pub mod connector;

pub use connector::{
    ConnectorState, Delivery, HandshakePolicy, InboundEvent, UpstreamConnector, UpstreamHandle, UpstreamSettings,
};
