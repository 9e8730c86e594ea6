//! Chat server core
//!
//! This module provides the pieces of the server side:
//!
//! - **Coordinator**: single serial owner of channels and users
//! - **Channel actors**: one task per channel running the fan-out
//! - **Party flows**: per-(user, channel) stream segments and their
//!   kill switches
//! - **Envelopes**: the command/reply discipline callers speak

pub mod channel;
pub mod command;
pub mod coordinator;
pub mod flow;
pub mod state;

pub use channel::{ChannelActor, ChannelCommand, ChannelHandle};
pub use command::{ServerControlMessage, ServerReplyMessage};
pub use coordinator::{Coordinator, ServerConfig, ServerHandle};
pub use flow::{KillSwitch, Materializer, PartyFlow};
pub use state::{ChannelData, ServerData, StateSnapshot, Subscription, UserData};
