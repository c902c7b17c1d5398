//! taskhub: project and task management backend with a real-time
//! activity stream, plus the dashboard client that consumes it.
//!
//! - [`hub`]: REST API, SQLite store, STOMP-over-WebSocket endpoint
//! - [`realtime`]: connection manager, activity feed, cache invalidation
//! - [`config`]: `taskhub.toml` plus environment overrides
//! - [`errors`]: typed error enums

pub mod config;
pub mod errors;
pub mod hub;
pub mod logging;
pub mod realtime;
