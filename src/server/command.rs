//! Command and reply envelopes for the server coordinator
//!
//! Callers talk to the coordinator exclusively through
//! [`ServerControlMessage`] values, each carrying the oneshot the reply
//! comes back on. The coordinator applies commands one at a time, so each
//! reply describes a state the server actually passed through.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::messages::{ChannelInfo, UserInfo};
use crate::server::flow::Materializer;
use crate::server::state::{ServerData, StateSnapshot};

/// Commands accepted by the server coordinator
pub enum ServerControlMessage {
    /// List every channel with its live user count
    List {
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Create a channel, or return the existing one with this name
    NewChannel {
        name: String,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Look a channel up by name
    FindChannel {
        name: String,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Replace a channel's topic
    SetTopic {
        channel_id: Uuid,
        topic: String,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Remove a channel and sever every subscription to it
    DropChannel {
        channel_id: Uuid,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Register a user and subscribe it to the listed channels.
    ///
    /// Ids that name no existing channel are dropped from the list.
    Connect {
        nick: String,
        email: Option<String>,
        materializer: Option<Materializer>,
        channels: Vec<Uuid>,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Sever all of a user's subscriptions and remove it
    Disconnect {
        user_id: Uuid,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Join a user to a channel by name, creating the channel if absent
    Join {
        user_id: Uuid,
        channel_name: String,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Remove a user from a channel, severing its stream
    Leave {
        user_id: Uuid,
        channel_id: Uuid,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Describe a connected user
    GetUser {
        user_id: Uuid,
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Snapshot the raw state (inspection and tests)
    ReadState {
        reply: oneshot::Sender<ServerReplyMessage>,
    },

    /// Apply an arbitrary transform to the raw state (inspection and tests)
    UpdateState {
        apply: Box<dyn FnOnce(&mut ServerData) + Send>,
        reply: oneshot::Sender<ServerReplyMessage>,
    },
}

/// Replies produced by the server coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerReplyMessage {
    /// Every channel, for `List`
    ChannelList(Vec<ChannelInfo>),
    /// A single channel, for `NewChannel` / `FindChannel`
    ChannelInfo(ChannelInfo),
    /// A single user, for `Connect` / `GetUser`
    UserInfo(UserInfo),
    /// Raw state snapshot, for `ReadState`
    State(StateSnapshot),
    /// The command applied and had nothing further to report
    Ack,
    /// The command was rejected; the text is one of the stable wordings
    Error(String),
}
