//! Wire-level types shared by the taskhub server and its real-time clients.
//!
//! - [`frame`]: STOMP 1.2 text frame codec used on the `/ws` endpoint
//! - [`topic`]: typed topic destinations (`/topic/activities/global`, ...)
//! - [`message`]: JSON envelope carried in `MESSAGE` frame bodies

pub mod frame;
pub mod message;
pub mod topic;

pub use frame::{Frame, FrameError, Inbound, StompCommand};
pub use message::{MessageType, WireMessage};
pub use topic::Topic;
