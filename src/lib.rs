//! Previewgate - ephemeral preview apps behind a path-prefixed reverse proxy
//!
//! This library provides the orchestration layer for short-lived preview apps:
//! - Leases each app a backend port from a bounded pool
//! - Serves the submitted markup, styling, script and declarative routes from
//!   an embedded HTTP server on that port
//! - Routes `/<prefix>/<app id>/...` on the public port to the right backend
//! - Tracks every app's lifecycle and lease in a single registry
//! - Reclaims apps once their lease expires
//! - Takes creation requests from a message bus and publishes readiness notices

pub mod admin;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod site;
pub mod supervisor;
pub mod sweeper;
