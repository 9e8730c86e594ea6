//! Protocol layer for the chat server core
//!
//! This module provides the message type definitions exchanged with
//! callers and transports.

pub mod messages;

// Re-export commonly used types
pub use messages::{valid_channel_name, ChannelInfo, ChatClientMessage, Message, UserInfo};
