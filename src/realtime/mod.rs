//! Real-time dashboard client.
//!
//! - [`connection`]: STOMP-over-WebSocket connection manager (actor task)
//! - [`feed`]: activity feed store with the new-activity flag
//! - [`invalidator`]: debounced invalidation of the dashboard queries
//! - [`session`]: wires the three together for one dashboard
//! - [`cache`]: query-cache seam plus the HTTP-backed implementation
//! - [`transport`]: socket seam plus the tungstenite implementation

pub mod cache;
pub mod connection;
pub mod feed;
pub mod invalidator;
pub mod session;
pub mod state;
pub mod transport;

pub use cache::{HttpQueryCache, QueryCache, QueryKey};
pub use connection::{ConnectionManager, RealtimeConfig};
pub use feed::{ActivityEvent, ActivityFeed, ReadPolicy};
pub use invalidator::{DashboardInvalidator, DebounceMode, InvalidatorSignal};
pub use session::{DashboardSession, FeedSnapshot, SessionOptions};
pub use state::{ConnectionState, StatusIndicator, Transition};
pub use transport::{Socket, Transport, TungsteniteTransport};
