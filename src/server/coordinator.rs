//! Server coordinator: the single owner of channel and user state
//!
//! The coordinator is one task draining a mailbox of
//! [`ServerControlMessage`]s. Commands apply one at a time, so every
//! observable transition, including wiring or severing party streams,
//! is atomic with respect to concurrent callers. The only work that
//! leaves the mailbox is the `List` merge, which asks every channel actor
//! for its attached parties from a spawned collector task.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::ids;
use crate::protocol::messages::{valid_channel_name, ChannelInfo, UserInfo};
use crate::server::channel::{ChannelActor, ChannelHandle};
use crate::server::command::{ServerControlMessage, ServerReplyMessage};
use crate::server::flow::{Materializer, PartyFlow};
use crate::server::state::{ChannelData, ServerData, StateSnapshot, Subscription, UserData};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of each party's fan-out sink. A party whose sink is full
    /// misses messages instead of stalling the channel.
    pub fanout_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { fanout_buffer: 64 }
    }
}

/// The coordinator task state
pub struct Coordinator {
    config: ServerConfig,
    state: ServerData,
    rx: mpsc::UnboundedReceiver<ServerControlMessage>,
}

impl Coordinator {
    /// Spawn a coordinator task and return the handle callers use.
    pub fn spawn(config: ServerConfig) -> ServerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            config,
            state: ServerData::default(),
            rx,
        };
        tokio::spawn(coordinator.run());
        ServerHandle { tx }
    }

    async fn run(mut self) {
        info!("Server coordinator started");

        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }

        // Last handle gone: sever every live stream before the state drops.
        for user in self.state.users.values() {
            for sub in user.channels.values() {
                sub.shutdown();
            }
        }
        info!("Server coordinator stopped");
    }

    fn handle(&mut self, cmd: ServerControlMessage) {
        match cmd {
            ServerControlMessage::List { reply } => self.list(reply),
            ServerControlMessage::NewChannel { name, reply } => {
                respond(reply, self.new_channel(name));
            }
            ServerControlMessage::FindChannel { name, reply } => {
                respond(reply, self.find_channel(&name));
            }
            ServerControlMessage::SetTopic {
                channel_id,
                topic,
                reply,
            } => respond(reply, self.set_topic(channel_id, topic)),
            ServerControlMessage::DropChannel { channel_id, reply } => {
                respond(reply, self.drop_channel(channel_id));
            }
            ServerControlMessage::Connect {
                nick,
                email,
                materializer,
                channels,
                reply,
            } => respond(reply, self.connect(nick, email, materializer, channels)),
            ServerControlMessage::Disconnect { user_id, reply } => {
                respond(reply, self.disconnect(user_id));
            }
            ServerControlMessage::Join {
                user_id,
                channel_name,
                reply,
            } => respond(reply, self.join(user_id, channel_name)),
            ServerControlMessage::Leave {
                user_id,
                channel_id,
                reply,
            } => respond(reply, self.leave(user_id, channel_id)),
            ServerControlMessage::GetUser { user_id, reply } => {
                respond(reply, self.get_user(user_id));
            }
            ServerControlMessage::ReadState { reply } => {
                respond(reply, Ok(ServerReplyMessage::State(self.state.snapshot())));
            }
            ServerControlMessage::UpdateState { apply, reply } => {
                respond(reply, self.update_state(apply));
            }
        }
    }

    /// Answer `List` without blocking the mailbox: snapshot the channels,
    /// then let a collector task gather each actor's party list.
    fn list(&self, reply: oneshot::Sender<ServerReplyMessage>) {
        let channels: Vec<(ChannelInfo, ChannelHandle)> = self
            .state
            .channels
            .values()
            .map(|chan| {
                let info = ChannelInfo {
                    id: chan.id,
                    name: chan.name.clone(),
                    topic: chan.topic.clone(),
                    user_count: 0,
                };
                (info, chan.actor.clone())
            })
            .collect();

        tokio::spawn(async move {
            let mut infos = Vec::with_capacity(channels.len());
            for (mut info, actor) in channels {
                match actor.list_users().await {
                    Some(users) => info.user_count = users.len(),
                    None => {
                        warn!(
                            "Channel '{}' actor unreachable, reporting 0 users",
                            info.name
                        );
                    }
                }
                infos.push(info);
            }
            infos.sort_by(|a, b| a.name.cmp(&b.name));
            let _ = reply.send(ServerReplyMessage::ChannelList(infos));
        });
    }

    fn new_channel(&mut self, name: String) -> Result<ServerReplyMessage> {
        if let Some(chan) = self.state.channel_by_name(&name) {
            return Ok(ServerReplyMessage::ChannelInfo(
                self.state.channel_info(chan),
            ));
        }

        let chan = stage_channel(&name)?;
        let info = ChannelInfo {
            id: chan.id,
            name: chan.name.clone(),
            topic: String::new(),
            user_count: 0,
        };
        info!("Channel '{}' created", chan.name);
        self.state.channels.insert(chan.id, chan);
        Ok(ServerReplyMessage::ChannelInfo(info))
    }

    fn find_channel(&self, name: &str) -> Result<ServerReplyMessage> {
        let chan = self
            .state
            .channel_by_name(name)
            .ok_or(ServerError::ChannelNameNotFound)?;
        Ok(ServerReplyMessage::ChannelInfo(
            self.state.channel_info(chan),
        ))
    }

    fn set_topic(&mut self, channel_id: Uuid, topic: String) -> Result<ServerReplyMessage> {
        let chan = self
            .state
            .channels
            .get_mut(&channel_id)
            .ok_or(ServerError::ChannelNotFound)?;
        chan.topic = topic;
        Ok(ServerReplyMessage::Ack)
    }

    fn drop_channel(&mut self, channel_id: Uuid) -> Result<ServerReplyMessage> {
        let chan = self
            .state
            .channels
            .remove(&channel_id)
            .ok_or(ServerError::ChannelNotFound)?;

        // Kick every subscriber; live streams are severed on the spot.
        for user in self.state.users.values_mut() {
            if let Some(sub) = user.channels.remove(&channel_id) {
                sub.shutdown();
            }
        }

        info!("Channel '{}' dropped", chan.name);
        Ok(ServerReplyMessage::Ack)
    }

    fn connect(
        &mut self,
        nick: String,
        email: Option<String>,
        materializer: Option<Materializer>,
        channels: Vec<Uuid>,
    ) -> Result<ServerReplyMessage> {
        if self.state.nick_taken(&nick) {
            return Err(ServerError::NickTaken);
        }

        let user_id = ids::fresh_id();
        let mut subscriptions: HashMap<Uuid, Subscription> = HashMap::new();

        for channel_id in channels {
            if subscriptions.contains_key(&channel_id) {
                continue;
            }
            let Some(chan) = self.state.channels.get(&channel_id) else {
                // Ids that name no channel are dropped from the list.
                debug!(
                    "Connect for '{}' names unknown channel {}, skipping",
                    nick, channel_id
                );
                continue;
            };
            match materialize(&self.config, materializer.as_ref(), chan, user_id) {
                Ok(sub) => {
                    subscriptions.insert(channel_id, sub);
                }
                Err(e) => {
                    for sub in subscriptions.values() {
                        sub.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        let user = UserData {
            id: user_id,
            nick: nick.clone(),
            email,
            materializer,
            channels: subscriptions,
        };
        self.state.users.insert(user_id, user);

        let info = self
            .state
            .users
            .get(&user_id)
            .map(|user| self.state.user_info(user))
            .expect("freshly inserted user");

        info!("User '{}' connected", nick);
        Ok(ServerReplyMessage::UserInfo(info))
    }

    fn disconnect(&mut self, user_id: Uuid) -> Result<ServerReplyMessage> {
        let user = self
            .state
            .users
            .remove(&user_id)
            .ok_or(ServerError::UserNotFound)?;

        for sub in user.channels.values() {
            sub.shutdown();
        }

        info!("User '{}' disconnected", user.nick);
        Ok(ServerReplyMessage::Ack)
    }

    fn join(&mut self, user_id: Uuid, channel_name: String) -> Result<ServerReplyMessage> {
        let Some(user) = self.state.users.get(&user_id) else {
            return Err(ServerError::UserNotFound);
        };

        // Resolve the target, staging a new channel when the name is free.
        // Nothing is committed until the subscription materialized, so a
        // failing materializer leaves no half-created channel behind.
        let (channel_id, staged) = match self.state.channel_by_name(&channel_name) {
            Some(chan) => {
                if user.channels.contains_key(&chan.id) {
                    return Err(ServerError::AlreadyJoined);
                }
                (chan.id, None)
            }
            None => {
                let chan = stage_channel(&channel_name)?;
                (chan.id, Some(chan))
            }
        };

        let sub = match &staged {
            Some(chan) => materialize(&self.config, user.materializer.as_ref(), chan, user_id)?,
            None => {
                let chan = self
                    .state
                    .channels
                    .get(&channel_id)
                    .ok_or(ServerError::ChannelNotFound)?;
                materialize(&self.config, user.materializer.as_ref(), chan, user_id)?
            }
        };

        if let Some(chan) = staged {
            info!("Channel '{}' created", chan.name);
            self.state.channels.insert(channel_id, chan);
        }
        if let Some(user) = self.state.users.get_mut(&user_id) {
            user.channels.insert(channel_id, sub);
        }

        info!("User {} joined channel '{}'", user_id, channel_name);
        Ok(ServerReplyMessage::Ack)
    }

    fn leave(&mut self, user_id: Uuid, channel_id: Uuid) -> Result<ServerReplyMessage> {
        let user = self
            .state
            .users
            .get_mut(&user_id)
            .ok_or(ServerError::UserNotFound)?;
        let sub = user
            .channels
            .remove(&channel_id)
            .ok_or(ServerError::NotJoined)?;

        sub.shutdown();
        Ok(ServerReplyMessage::Ack)
    }

    fn get_user(&self, user_id: Uuid) -> Result<ServerReplyMessage> {
        let user = self
            .state
            .users
            .get(&user_id)
            .ok_or(ServerError::UserNotFound)?;
        Ok(ServerReplyMessage::UserInfo(self.state.user_info(user)))
    }

    fn update_state(
        &mut self,
        apply: Box<dyn FnOnce(&mut ServerData) + Send>,
    ) -> Result<ServerReplyMessage> {
        match catch_unwind(AssertUnwindSafe(|| apply(&mut self.state))) {
            Ok(()) => Ok(ServerReplyMessage::Ack),
            Err(_) => Err(ServerError::internal("state update panicked")),
        }
    }
}

/// Build a channel record (with a running actor) without registering it.
fn stage_channel(name: &str) -> Result<ChannelData> {
    if !valid_channel_name(name) {
        return Err(ServerError::InvalidChannelName);
    }
    let id = ids::fresh_id();
    Ok(ChannelData {
        id,
        name: name.to_string(),
        topic: String::new(),
        actor: ChannelActor::spawn(id, name),
    })
}

/// Wire one user into one channel.
///
/// Headless users just get the bookkeeping entry. For live users the
/// materializer runs inside the current coordinator step; a panic in it
/// is contained here so it cannot poison the mailbox loop.
fn materialize(
    config: &ServerConfig,
    materializer: Option<&Materializer>,
    chan: &ChannelData,
    user_id: Uuid,
) -> Result<Subscription> {
    let Some(materializer) = materializer else {
        return Ok(Subscription::Headless);
    };

    let flow = PartyFlow::new(chan.actor.clone(), user_id, config.fanout_buffer);
    match catch_unwind(AssertUnwindSafe(|| materializer(flow))) {
        Ok(switch) => Ok(Subscription::Live(switch)),
        Err(_) => {
            // The flow may have attached before the panic; the actor must
            // not keep a stale sink.
            chan.actor.detach(user_id);
            warn!(
                "Materializer panicked for user {} on channel '{}'",
                user_id, chan.name
            );
            Err(ServerError::materializer(format!(
                "materializer panicked for channel '{}'",
                chan.name
            )))
        }
    }
}

fn respond(reply: oneshot::Sender<ServerReplyMessage>, result: Result<ServerReplyMessage>) {
    let msg = match result {
        Ok(msg) => msg,
        Err(e) => ServerReplyMessage::Error(e.to_string()),
    };
    let _ = reply.send(msg);
}

/// Clonable handle to a running coordinator.
///
/// Each method sends one envelope and awaits its reply; the raw
/// [`send`](ServerHandle::send) escape hatch exists for embeddings that
/// build [`ServerControlMessage`] values themselves.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerControlMessage>,
}

impl ServerHandle {
    /// Enqueue a raw command envelope.
    pub fn send(&self, msg: ServerControlMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| ServerError::ConnectionLost)
    }

    async fn request<F>(&self, build: F) -> Result<ServerReplyMessage>
    where
        F: FnOnce(oneshot::Sender<ServerReplyMessage>) -> ServerControlMessage,
    {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| ServerError::ConnectionLost)
    }

    fn reject(reply: ServerReplyMessage) -> ServerError {
        match reply {
            ServerReplyMessage::Error(text) => ServerError::from_reply(text),
            other => ServerError::internal(format!("unexpected reply: {:?}", other)),
        }
    }

    fn ack(reply: ServerReplyMessage) -> Result<()> {
        match reply {
            ServerReplyMessage::Ack => Ok(()),
            other => Err(Self::reject(other)),
        }
    }

    /// List every channel with its live user count.
    pub async fn list(&self) -> Result<Vec<ChannelInfo>> {
        match self
            .request(|reply| ServerControlMessage::List { reply })
            .await?
        {
            ServerReplyMessage::ChannelList(channels) => Ok(channels),
            other => Err(Self::reject(other)),
        }
    }

    /// Create a channel, or fetch the existing one with this name.
    pub async fn new_channel(&self, name: impl Into<String>) -> Result<ChannelInfo> {
        let name = name.into();
        match self
            .request(|reply| ServerControlMessage::NewChannel { name, reply })
            .await?
        {
            ServerReplyMessage::ChannelInfo(info) => Ok(info),
            other => Err(Self::reject(other)),
        }
    }

    /// Look a channel up by name.
    pub async fn find_channel(&self, name: impl Into<String>) -> Result<ChannelInfo> {
        let name = name.into();
        match self
            .request(|reply| ServerControlMessage::FindChannel { name, reply })
            .await?
        {
            ServerReplyMessage::ChannelInfo(info) => Ok(info),
            other => Err(Self::reject(other)),
        }
    }

    /// Replace a channel's topic.
    pub async fn set_topic(&self, channel_id: Uuid, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        let reply = self
            .request(|reply| ServerControlMessage::SetTopic {
                channel_id,
                topic,
                reply,
            })
            .await?;
        Self::ack(reply)
    }

    /// Remove a channel and kick every subscriber.
    pub async fn drop_channel(&self, channel_id: Uuid) -> Result<()> {
        let reply = self
            .request(|reply| ServerControlMessage::DropChannel { channel_id, reply })
            .await?;
        Self::ack(reply)
    }

    /// Register a user, subscribing it to every listed channel that exists.
    pub async fn connect(
        &self,
        nick: impl Into<String>,
        email: Option<String>,
        materializer: Option<Materializer>,
        channels: Vec<Uuid>,
    ) -> Result<UserInfo> {
        let nick = nick.into();
        match self
            .request(|reply| ServerControlMessage::Connect {
                nick,
                email,
                materializer,
                channels,
                reply,
            })
            .await?
        {
            ServerReplyMessage::UserInfo(info) => Ok(info),
            other => Err(Self::reject(other)),
        }
    }

    /// Sever all of a user's subscriptions and remove it.
    pub async fn disconnect(&self, user_id: Uuid) -> Result<()> {
        let reply = self
            .request(|reply| ServerControlMessage::Disconnect { user_id, reply })
            .await?;
        Self::ack(reply)
    }

    /// Join a user to a channel by name, creating the channel if needed.
    pub async fn join(&self, user_id: Uuid, channel_name: impl Into<String>) -> Result<()> {
        let channel_name = channel_name.into();
        let reply = self
            .request(|reply| ServerControlMessage::Join {
                user_id,
                channel_name,
                reply,
            })
            .await?;
        Self::ack(reply)
    }

    /// Remove a user from a channel.
    pub async fn leave(&self, user_id: Uuid, channel_id: Uuid) -> Result<()> {
        let reply = self
            .request(|reply| ServerControlMessage::Leave {
                user_id,
                channel_id,
                reply,
            })
            .await?;
        Self::ack(reply)
    }

    /// Describe a connected user.
    pub async fn get_user(&self, user_id: Uuid) -> Result<UserInfo> {
        match self
            .request(|reply| ServerControlMessage::GetUser { user_id, reply })
            .await?
        {
            ServerReplyMessage::UserInfo(info) => Ok(info),
            other => Err(Self::reject(other)),
        }
    }

    /// Snapshot the raw server state.
    pub async fn read_state(&self) -> Result<StateSnapshot> {
        match self
            .request(|reply| ServerControlMessage::ReadState { reply })
            .await?
        {
            ServerReplyMessage::State(snapshot) => Ok(snapshot),
            other => Err(Self::reject(other)),
        }
    }

    /// Apply an arbitrary transform to the raw server state.
    pub async fn update_state<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ServerData) + Send + 'static,
    {
        let reply = self
            .request(|reply| ServerControlMessage::UpdateState {
                apply: Box::new(apply),
                reply,
            })
            .await?;
        Self::ack(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ChatClientMessage, Message};
    use std::sync::{Arc, Mutex};

    fn server() -> ServerHandle {
        Coordinator::spawn(ServerConfig::default())
    }

    /// In-process transport: one outbound stream per user, one inbound
    /// sender per materialized channel flow, keyed by channel id.
    type Inputs = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Message>>>>;

    fn local_transport() -> (Materializer, mpsc::Receiver<ChatClientMessage>, Inputs) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let inputs: Inputs = Arc::default();
        let registry = Arc::clone(&inputs);
        let materializer: Materializer = Box::new(move |flow: PartyFlow| {
            let (in_tx, in_rx) = mpsc::channel(16);
            registry.lock().unwrap().insert(flow.channel_id(), in_tx);
            flow.run(in_rx, out_tx.clone())
        });
        (materializer, out_rx, inputs)
    }

    fn input_for(inputs: &Inputs, channel_id: Uuid) -> mpsc::Sender<Message> {
        inputs.lock().unwrap().get(&channel_id).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_empty_server_lists_no_channels() {
        let server = server();
        assert_eq!(server.list().await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn test_new_channel_is_idempotent() {
        let server = server();

        let first = server.new_channel("hardware").await.unwrap();
        assert_eq!(first.name, "hardware");
        assert_eq!(first.user_count, 0);

        let second = server.new_channel("hardware").await.unwrap();
        assert_eq!(second.id, first.id);

        assert_eq!(server.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_channel_names_are_rejected() {
        let server = server();

        for name in ["", "1bad"] {
            let err = server.new_channel(name).await.unwrap_err();
            assert_eq!(err, ServerError::InvalidChannelName);
            assert_eq!(err.to_string(), "Invalid channel name");
        }

        let state = server.read_state().await.unwrap();
        assert!(state.channels.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_nick_is_rejected() {
        let server = server();

        let alice = server.connect("alice", None, None, vec![]).await.unwrap();
        assert_eq!(alice.nick, "alice");
        assert!(alice.channels.is_empty());

        let err = server.connect("alice", None, None, vec![]).await.unwrap_err();
        assert_eq!(err, ServerError::NickTaken);
        assert_eq!(err.to_string(), "User with such nick already exists");

        assert_eq!(server.read_state().await.unwrap().users.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_with_channel_then_leave_twice() {
        let server = server();
        let cats = server.new_channel("cats").await.unwrap();

        let bob = server
            .connect("bob", None, None, vec![cats.id])
            .await
            .unwrap();
        assert_eq!(bob.channels.len(), 1);
        assert_eq!(bob.channels[0].name, "cats");

        server.leave(bob.id, cats.id).await.unwrap();

        let err = server.leave(bob.id, cats.id).await.unwrap_err();
        assert_eq!(err, ServerError::NotJoined);
        assert_eq!(err.to_string(), "User is not joined channel");
    }

    #[tokio::test]
    async fn test_join_auto_creates_and_drop_kicks() {
        let server = server();
        let user = server.connect("c", None, None, vec![]).await.unwrap();

        server.join(user.id, "newchan").await.unwrap();
        let newchan = server.find_channel("newchan").await.unwrap();

        server.drop_channel(newchan.id).await.unwrap();

        let after = server.get_user(user.id).await.unwrap();
        assert!(after.channels.is_empty());
        assert_eq!(
            server.find_channel("newchan").await.unwrap_err(),
            ServerError::ChannelNameNotFound
        );
    }

    #[tokio::test]
    async fn test_find_channel_error_wording() {
        let server = server();
        let err = server.find_channel("nowhere").await.unwrap_err();
        assert_eq!(err.to_string(), "Channel with such name not found");
    }

    #[tokio::test]
    async fn test_set_topic() {
        let server = server();
        let chan = server.new_channel("ops").await.unwrap();
        assert_eq!(chan.topic, "");

        server.set_topic(chan.id, "deploys and incidents").await.unwrap();
        let found = server.find_channel("ops").await.unwrap();
        assert_eq!(found.topic, "deploys and incidents");

        let err = server
            .set_topic(ids::fresh_id(), "nope")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Channel not found");
    }

    #[tokio::test]
    async fn test_connect_drops_unknown_and_duplicate_channel_ids() {
        let server = server();
        let cats = server.new_channel("cats").await.unwrap();

        let user = server
            .connect("dana", None, None, vec![cats.id, ids::fresh_id(), cats.id])
            .await
            .unwrap();
        assert_eq!(user.channels.len(), 1);
        assert_eq!(user.channels[0].id, cats.id);
    }

    #[tokio::test]
    async fn test_join_with_invalid_name_does_not_create() {
        let server = server();
        let user = server.connect("erin", None, None, vec![]).await.unwrap();

        let err = server.join(user.id, "9lives").await.unwrap_err();
        assert_eq!(err, ServerError::InvalidChannelName);

        assert!(server.read_state().await.unwrap().channels.is_empty());
    }

    #[tokio::test]
    async fn test_join_twice_is_rejected() {
        let server = server();
        let user = server.connect("finn", None, None, vec![]).await.unwrap();

        server.join(user.id, "dogs").await.unwrap();
        let err = server.join(user.id, "dogs").await.unwrap_err();
        assert_eq!(err, ServerError::AlreadyJoined);
        assert_eq!(err.to_string(), "User already joined this channel");
    }

    #[tokio::test]
    async fn test_unknown_user_ids_are_rejected() {
        let server = server();
        let nobody = ids::fresh_id();

        assert_eq!(
            server.disconnect(nobody).await.unwrap_err(),
            ServerError::UserNotFound
        );
        assert_eq!(
            server.get_user(nobody).await.unwrap_err().to_string(),
            "User with such id not found"
        );
        assert_eq!(
            server.leave(nobody, ids::fresh_id()).await.unwrap_err(),
            ServerError::UserNotFound
        );
        assert_eq!(
            server.join(nobody, "anywhere").await.unwrap_err(),
            ServerError::UserNotFound
        );
    }

    #[tokio::test]
    async fn test_connect_disconnect_round_trip() {
        let server = server();
        server.new_channel("fixture").await.unwrap();

        let before = server.read_state().await.unwrap();
        let alice = server.connect("alice", None, None, vec![]).await.unwrap();
        server.disconnect(alice.id).await.unwrap();
        let after = server.read_state().await.unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_join_leave_round_trip_with_live_user() {
        let server = server();
        let cats = server.new_channel("cats").await.unwrap();

        let (materializer, _out_rx, _inputs) = local_transport();
        let alice = server
            .connect("alice", None, Some(materializer), vec![])
            .await
            .unwrap();

        let before = server.read_state().await.unwrap();

        server.join(alice.id, "cats").await.unwrap();
        let joined = server.find_channel("cats").await.unwrap();
        assert_eq!(joined.user_count, 1);

        server.leave(alice.id, cats.id).await.unwrap();
        let after = server.read_state().await.unwrap();
        assert_eq!(before, after);

        // The channel actor saw the detach as well.
        let listed = server.list().await.unwrap();
        assert_eq!(listed[0].user_count, 0);
    }

    #[tokio::test]
    async fn test_live_fan_out_end_to_end() {
        let server = server();
        let hw = server.new_channel("hardware").await.unwrap();

        let (alice_mat, mut alice_rx, alice_inputs) = local_transport();
        let (bob_mat, mut bob_rx, _bob_inputs) = local_transport();

        let alice = server
            .connect("alice", None, Some(alice_mat), vec![hw.id])
            .await
            .unwrap();
        server
            .connect("bob", None, Some(bob_mat), vec![hw.id])
            .await
            .unwrap();

        let listed = server.list().await.unwrap();
        assert_eq!(listed[0].user_count, 2);

        let to_hw = input_for(&alice_inputs, hw.id);
        to_hw.send(Message::new("resistors?")).await.unwrap();
        to_hw.send(Message::new("got some")).await.unwrap();

        // Both parties observe alice's messages in publication order.
        for rx in [&mut alice_rx, &mut bob_rx] {
            let m1 = rx.recv().await.unwrap();
            let m2 = rx.recv().await.unwrap();
            assert_eq!(m1.sender, alice.id);
            assert_eq!(m1.body, "resistors?");
            assert_eq!(m2.body, "got some");
            assert_eq!(m1.channel_id, hw.id);
        }
    }

    #[tokio::test]
    async fn test_counts_only_include_live_streams() {
        let server = server();
        let hw = server.new_channel("hardware").await.unwrap();

        let (materializer, _out_rx, _inputs) = local_transport();
        server
            .connect("alice", None, Some(materializer), vec![hw.id])
            .await
            .unwrap();
        let bot = server
            .connect("logbot", None, None, vec![hw.id])
            .await
            .unwrap();

        assert_eq!(server.list().await.unwrap()[0].user_count, 1);
        assert_eq!(server.find_channel("hardware").await.unwrap().user_count, 1);
        assert_eq!(bot.channels[0].user_count, 1);
    }

    #[tokio::test]
    async fn test_drop_channel_twice_and_severed_streams() {
        let server = server();
        let hw = server.new_channel("hardware").await.unwrap();

        let (materializer, mut out_rx, _inputs) = local_transport();
        let alice = server
            .connect("alice", None, Some(materializer), vec![hw.id])
            .await
            .unwrap();

        server.drop_channel(hw.id).await.unwrap();
        assert!(server.get_user(alice.id).await.unwrap().channels.is_empty());

        let err = server.drop_channel(hw.id).await.unwrap_err();
        assert_eq!(err.to_string(), "Channel not found");

        // Disconnecting drops the materializer's outbound sender too, so
        // the transport sees its stream end.
        server.disconnect(alice.id).await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_materializer_panic_leaves_state_untouched() {
        let server = server();
        let hw = server.new_channel("hardware").await.unwrap();

        let boom: Materializer = Box::new(|_flow| panic!("wiring refused"));
        let err = server
            .connect("unlucky", None, Some(boom), vec![hw.id])
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Materializer failed"));

        let state = server.read_state().await.unwrap();
        assert!(state.users.is_empty());

        // The coordinator keeps serving commands afterwards.
        let user = server.connect("lucky", None, None, vec![]).await.unwrap();
        assert_eq!(user.nick, "lucky");
    }

    #[tokio::test]
    async fn test_read_and_update_state() {
        let server = server();
        let chan = server.new_channel("mutable").await.unwrap();

        server
            .update_state(move |state| {
                if let Some(chan) = state.channels.get_mut(&chan.id) {
                    chan.topic = "rewired".to_string();
                }
            })
            .await
            .unwrap();

        assert_eq!(server.find_channel("mutable").await.unwrap().topic, "rewired");

        let snapshot = server.read_state().await.unwrap();
        assert_eq!(snapshot.channels.len(), 1);
        assert_eq!(snapshot.channels[0].topic, "rewired");
    }
}
