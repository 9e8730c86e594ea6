//! Error handling for the chat server core

use std::fmt;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error types
///
/// The `Display` wording of each rejection variant is stable: it is the
/// exact text callers see inside an `Error` reply, so tests and embeddings
/// may match on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Channel name is empty or does not start with a letter
    InvalidChannelName,
    /// No channel with the requested name exists
    ChannelNameNotFound,
    /// No channel with the requested id exists
    ChannelNotFound,
    /// No user with the requested id exists
    UserNotFound,
    /// Another connected user already holds this nick
    NickTaken,
    /// The user is already joined to this channel
    AlreadyJoined,
    /// The user is not joined to this channel
    NotJoined,
    /// A user-supplied materializer failed while wiring a party flow
    Materializer(String),
    /// A rejection received from the server whose wording is not one of
    /// the fixed strings above
    Rejected(String),
    /// Server internal error
    Internal(String),
    /// The coordinator task is gone; no further commands can be served
    ConnectionLost,
}

impl ServerError {
    /// Map an error reply's text back to the matching variant.
    ///
    /// Wordings that are not one of the fixed rejection strings are kept
    /// verbatim in [`ServerError::Rejected`].
    pub fn from_reply<T: Into<String>>(text: T) -> Self {
        let text = text.into();
        match text.as_str() {
            "Invalid channel name" => ServerError::InvalidChannelName,
            "Channel with such name not found" => ServerError::ChannelNameNotFound,
            "Channel not found" => ServerError::ChannelNotFound,
            "User with such id not found" => ServerError::UserNotFound,
            "User with such nick already exists" => ServerError::NickTaken,
            "User already joined this channel" => ServerError::AlreadyJoined,
            "User is not joined channel" => ServerError::NotJoined,
            _ => ServerError::Rejected(text),
        }
    }

    /// Create a materializer error
    pub fn materializer<T: Into<String>>(msg: T) -> Self {
        ServerError::Materializer(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ServerError::Internal(msg.into())
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidChannelName => write!(f, "Invalid channel name"),
            ServerError::ChannelNameNotFound => write!(f, "Channel with such name not found"),
            ServerError::ChannelNotFound => write!(f, "Channel not found"),
            ServerError::UserNotFound => write!(f, "User with such id not found"),
            ServerError::NickTaken => write!(f, "User with such nick already exists"),
            ServerError::AlreadyJoined => write!(f, "User already joined this channel"),
            ServerError::NotJoined => write!(f, "User is not joined channel"),
            ServerError::Materializer(msg) => write!(f, "Materializer failed: {}", msg),
            ServerError::Rejected(msg) => write!(f, "{}", msg),
            ServerError::Internal(msg) => write!(f, "Internal error: {}", msg),
            ServerError::ConnectionLost => write!(f, "Server coordinator is gone"),
        }
    }
}

impl std::error::Error for ServerError {}
