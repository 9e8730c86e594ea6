//! Message types for the chat system
//!
//! Everything externally visible that can cross a process boundary:
//! channel and user descriptors returned by the coordinator, and the two
//! message shapes a party exchanges with its transport. Uses serde for
//! serialization so embeddings can put these on any wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Check whether a string is acceptable as a channel name.
///
/// Valid names are non-empty and start with a letter.
pub fn valid_channel_name(name: &str) -> bool {
    name.chars().next().map(char::is_alphabetic).unwrap_or(false)
}

// =============================================================================
// Coordinator reply payloads
// =============================================================================

/// Description of a channel as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel id
    pub id: Uuid,
    /// Channel name, unique across the server
    pub name: String,
    /// Current topic
    pub topic: String,
    /// Number of users with a live stream into this channel
    pub user_count: usize,
}

/// Description of a connected user as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// User id
    pub id: Uuid,
    /// Nick, unique across connected users
    pub nick: String,
    /// Optional contact address
    pub email: Option<String>,
    /// Channels the user is joined to, sorted by name
    pub channels: Vec<ChannelInfo>,
}

// =============================================================================
// Party messages
// =============================================================================

/// A message a client publishes into a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message text
    pub body: String,
}

impl Message {
    pub fn new<T: Into<String>>(body: T) -> Self {
        Self { body: body.into() }
    }
}

/// A fanned-out message as delivered to a subscribed client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatClientMessage {
    /// Channel the message was published in
    pub channel_id: Uuid,
    /// User that published the message
    pub sender: Uuid,
    /// Message text
    pub body: String,
}
