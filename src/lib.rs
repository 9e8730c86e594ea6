//! Palaver - Multi-Channel Chat Server Core
//!
//! This library provides the in-memory core of a multi-channel chat
//! server: a single coordinator owning the set of channels and connected
//! users, one actor per channel running the message fan-out, and the
//! per-(user, channel) stream segments that wire a user's transport into
//! a channel.
//!
//! ## Architecture
//!
//! - **Coordinator**: serializes every mutation of the (users, channels)
//!   state; callers talk to it through typed command envelopes
//! - **Channel actor**: owns its subscriber set; delivers each published
//!   message to all attached parties in publication order
//! - **Party flow**: the bidirectional segment a transport materializes;
//!   materialization yields the kill switch that severs it
//! - **Envelope layer**: `ServerControlMessage` in,
//!   `ServerReplyMessage` out
//!
//! Transports (sockets, web front-ends) and persistence are external
//! collaborators: they drive the core through commands and materialize
//! party flows, nothing more. The core holds no state beyond process
//! memory.
//!
//! ## Example
//!
//! ```rust,ignore
//! use palaver::{Coordinator, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> palaver::Result<()> {
//!     let server = Coordinator::spawn(ServerConfig::default());
//!     let channel = server.new_channel("hardware").await?;
//!     let bot = server.connect("logbot", None, None, vec![channel.id]).await?;
//!     server.disconnect(bot.id).await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod error;
pub mod ids;
pub mod protocol;
pub mod server;

// Re-export error types
pub use error::{Result, ServerError};

// Re-export protocol types
pub use protocol::{
    messages::valid_channel_name, ChannelInfo, ChatClientMessage, Message, UserInfo,
};

// Re-export server types
pub use server::{
    ChannelHandle, Coordinator, KillSwitch, Materializer, PartyFlow, ServerConfig,
    ServerControlMessage, ServerHandle, ServerReplyMessage, StateSnapshot,
};
