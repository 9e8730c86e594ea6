//! Coordinator-owned server state
//!
//! [`ServerData`] is the single source of truth for which channels exist
//! and which users are connected where. Only the coordinator task touches
//! it; there is no lock because there is no second writer.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::messages::{ChannelInfo, UserInfo};
use crate::server::channel::ChannelHandle;
use crate::server::flow::{KillSwitch, Materializer};

/// A user's standing in one channel
#[derive(Debug)]
pub enum Subscription {
    /// A live stream is running; the switch severs it
    Live(KillSwitch),
    /// Joined without a stream (headless user)
    Headless,
}

impl Subscription {
    pub fn is_live(&self) -> bool {
        matches!(self, Subscription::Live(_))
    }

    /// Fire the kill switch, if there is one. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if let Subscription::Live(switch) = self {
            switch.shutdown();
        }
    }
}

/// Server-side record of one channel
#[derive(Debug)]
pub struct ChannelData {
    pub id: Uuid,
    pub name: String,
    pub topic: String,
    /// Owning reference to the channel actor; dropping the last handle
    /// stops the actor
    pub actor: ChannelHandle,
}

/// Server-side record of one connected user
pub struct UserData {
    pub id: Uuid,
    pub nick: String,
    pub email: Option<String>,
    /// How to materialize a party flow for this user; `None` = headless
    pub materializer: Option<Materializer>,
    /// Joined channels and the switch guarding each live stream
    pub channels: HashMap<Uuid, Subscription>,
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("id", &self.id)
            .field("nick", &self.nick)
            .field("email", &self.email)
            .field("materializer", &self.materializer.is_some())
            .field("channels", &self.channels)
            .finish()
    }
}

/// The full coordinator state
#[derive(Debug, Default)]
pub struct ServerData {
    pub channels: HashMap<Uuid, ChannelData>,
    pub users: HashMap<Uuid, UserData>,
}

impl ServerData {
    /// Look a channel up by its unique name (case-sensitive).
    pub fn channel_by_name(&self, name: &str) -> Option<&ChannelData> {
        self.channels.values().find(|chan| chan.name == name)
    }

    /// Whether any connected user holds this nick.
    pub fn nick_taken(&self, nick: &str) -> bool {
        self.users.values().any(|user| user.nick == nick)
    }

    /// Number of users with a live stream into the channel.
    ///
    /// Headless joins are bookkeeping only and never show up in counts.
    pub fn live_count(&self, channel_id: Uuid) -> usize {
        self.users
            .values()
            .filter(|user| {
                user.channels
                    .get(&channel_id)
                    .map(Subscription::is_live)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Build the caller-facing description of one channel.
    pub fn channel_info(&self, chan: &ChannelData) -> ChannelInfo {
        ChannelInfo {
            id: chan.id,
            name: chan.name.clone(),
            topic: chan.topic.clone(),
            user_count: self.live_count(chan.id),
        }
    }

    /// Build the caller-facing description of one user.
    pub fn user_info(&self, user: &UserData) -> UserInfo {
        let mut channels: Vec<ChannelInfo> = user
            .channels
            .keys()
            .filter_map(|channel_id| self.channels.get(channel_id))
            .map(|chan| self.channel_info(chan))
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        UserInfo {
            id: user.id,
            nick: user.nick.clone(),
            email: user.email.clone(),
            channels,
        }
    }

    /// Deep, order-normalized copy of the state without live handles.
    pub fn snapshot(&self) -> StateSnapshot {
        let mut channels: Vec<ChannelSnapshot> = self
            .channels
            .values()
            .map(|chan| ChannelSnapshot {
                id: chan.id,
                name: chan.name.clone(),
                topic: chan.topic.clone(),
            })
            .collect();
        channels.sort_by_key(|chan| chan.id);

        let mut users: Vec<UserSnapshot> = self
            .users
            .values()
            .map(|user| {
                let mut subscriptions: Vec<SubscriptionSnapshot> = user
                    .channels
                    .iter()
                    .map(|(channel_id, sub)| SubscriptionSnapshot {
                        channel_id: *channel_id,
                        live: sub.is_live(),
                    })
                    .collect();
                subscriptions.sort_by_key(|sub| sub.channel_id);

                UserSnapshot {
                    id: user.id,
                    nick: user.nick.clone(),
                    email: user.email.clone(),
                    headless: user.materializer.is_none(),
                    channels: subscriptions,
                }
            })
            .collect();
        users.sort_by_key(|user| user.id);

        StateSnapshot { channels, users }
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Inspection copy of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub id: Uuid,
    pub name: String,
    pub topic: String,
}

/// Inspection copy of one (user, channel) subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub channel_id: Uuid,
    pub live: bool,
}

/// Inspection copy of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: Uuid,
    pub nick: String,
    pub email: Option<String>,
    pub headless: bool,
    pub channels: Vec<SubscriptionSnapshot>,
}

/// Inspection copy of the whole server state, sorted by id so two
/// snapshots of equal states compare equal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub channels: Vec<ChannelSnapshot>,
    pub users: Vec<UserSnapshot>,
}
