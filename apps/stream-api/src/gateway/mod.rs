//! Real-time room/session/chat coordination layer.
//!
//! Clients hold one WebSocket each. After a first-frame IDENTIFY the
//! connection owns a [`session::Session`]; client requests flow through
//! [`handler`], which consults and mutates the [`directory::RoomDirectory`]
//! and [`presence::PresenceTracker`], then fans results out via
//! [`fanout::GatewayBroadcast`]. The [`sweeper`] reconciles leaked state on
//! a timer and [`sync::SyncAdapter`] mirrors committed transitions to the
//! durable store and cache.

pub mod directory;
pub mod events;
pub mod fanout;
pub mod handler;
pub mod moderation;
pub mod presence;
pub mod server;
pub mod session;
pub mod sweeper;
pub mod sync;
