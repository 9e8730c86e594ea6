//! Channel actor owning the subscriber set and running the fan-out
//!
//! One actor task per channel. All interactions go through the actor's
//! mailbox, so attach, detach and publication are observed atomically: a
//! party either receives a given message or was never attached for it.

use std::collections::HashMap;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::messages::ChatClientMessage;

/// Commands accepted by a channel actor
#[derive(Debug)]
pub enum ChannelCommand {
    /// Attach a party's fan-out sink
    Attach {
        user_id: Uuid,
        sink: mpsc::Sender<ChatClientMessage>,
    },

    /// Detach a party; it stops receiving publications
    Detach { user_id: Uuid },

    /// Publish a message to every attached party
    Publish { sender: Uuid, body: String },

    /// Reply with the ids of the currently attached parties
    ListUsers {
        reply: oneshot::Sender<Vec<Uuid>>,
    },
}

/// Clonable reference to a channel actor
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    /// Id of the channel this handle refers to
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attach a party's sink. Fire-and-forget.
    pub fn attach(&self, user_id: Uuid, sink: mpsc::Sender<ChatClientMessage>) {
        let _ = self.tx.send(ChannelCommand::Attach { user_id, sink });
    }

    /// Detach a party. Fire-and-forget; harmless if the actor is gone.
    pub fn detach(&self, user_id: Uuid) {
        let _ = self.tx.send(ChannelCommand::Detach { user_id });
    }

    /// Publish a message into the channel.
    ///
    /// Returns `false` when the actor has stopped (channel dropped), which
    /// tells pumps to shut down.
    pub fn publish(&self, sender: Uuid, body: String) -> bool {
        self.tx
            .send(ChannelCommand::Publish { sender, body })
            .is_ok()
    }

    /// Ask the actor for its attached party ids.
    ///
    /// Returns `None` when the actor has stopped.
    pub async fn list_users(&self) -> Option<Vec<Uuid>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ChannelCommand::ListUsers { reply }).ok()?;
        rx.await.ok()
    }
}

/// Per-channel actor state
pub struct ChannelActor {
    id: Uuid,
    name: String,
    /// Attached parties and their fan-out sinks
    parties: HashMap<Uuid, mpsc::Sender<ChatClientMessage>>,
    rx: mpsc::UnboundedReceiver<ChannelCommand>,
}

impl ChannelActor {
    /// Spawn a new channel actor task and return a handle to it.
    ///
    /// The actor stops once every handle (and every attached pump holding
    /// a clone) has been dropped.
    pub fn spawn(id: Uuid, name: impl Into<String>) -> ChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ChannelActor {
            id,
            name: name.into(),
            parties: HashMap::new(),
            rx,
        };
        tokio::spawn(actor.run());
        ChannelHandle { id, tx }
    }

    async fn run(mut self) {
        debug!("Channel actor for '{}' started", self.name);

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ChannelCommand::Attach { user_id, sink } => {
                    self.parties.insert(user_id, sink);
                    debug!("Party {} attached to '{}'", user_id, self.name);
                }
                ChannelCommand::Detach { user_id } => {
                    self.parties.remove(&user_id);
                    debug!("Party {} detached from '{}'", user_id, self.name);
                }
                ChannelCommand::Publish { sender, body } => {
                    self.fan_out(sender, body);
                }
                ChannelCommand::ListUsers { reply } => {
                    let _ = reply.send(self.parties.keys().copied().collect());
                }
            }
        }

        debug!("Channel actor for '{}' stopped", self.name);
    }

    /// Deliver one publication to every attached sink.
    ///
    /// Sinks are bounded: a full sink means that subscriber misses this
    /// message; a closed sink is pruned. Neither disturbs delivery to the
    /// other parties, and no send here ever blocks the actor.
    fn fan_out(&mut self, sender: Uuid, body: String) {
        let mut gone = Vec::new();

        for (user_id, sink) in &self.parties {
            let msg = ChatClientMessage {
                channel_id: self.id,
                sender,
                body: body.clone(),
            };
            match sink.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(
                        "Dropped message for slow party {} in '{}'",
                        user_id, self.name
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    gone.push(*user_id);
                }
            }
        }

        for user_id in gone {
            self.parties.remove(&user_id);
            debug!("Pruned closed sink of party {} in '{}'", user_id, self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::fresh_id;

    fn attach_party(chan: &ChannelHandle, capacity: usize) -> (Uuid, mpsc::Receiver<ChatClientMessage>) {
        let user_id = fresh_id();
        let (tx, rx) = mpsc::channel(capacity);
        chan.attach(user_id, tx);
        (user_id, rx)
    }

    /// The mailbox is FIFO, so a completed `list_users` round trip means
    /// every previously sent command has been processed.
    async fn barrier(chan: &ChannelHandle) -> Vec<Uuid> {
        chan.list_users().await.unwrap_or_default()
    }

    #[tokio::test]
    async fn test_fan_out_preserves_publisher_order() {
        let chan = ChannelActor::spawn(fresh_id(), "orders");
        let (alice, mut alice_rx) = attach_party(&chan, 8);
        let (_bob, mut bob_rx) = attach_party(&chan, 8);

        assert!(chan.publish(alice, "first".to_string()));
        assert!(chan.publish(alice, "second".to_string()));
        barrier(&chan).await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            let m1 = rx.recv().await.unwrap();
            let m2 = rx.recv().await.unwrap();
            assert_eq!(m1.body, "first");
            assert_eq!(m2.body, "second");
            assert_eq!(m1.sender, alice);
            assert_eq!(m2.sender, alice);
        }
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let chan = ChannelActor::spawn(fresh_id(), "quiet");
        let (alice, mut alice_rx) = attach_party(&chan, 8);

        chan.publish(alice, "heard".to_string());
        chan.detach(alice);
        chan.publish(alice, "unheard".to_string());
        barrier(&chan).await;

        assert_eq!(alice_rx.recv().await.unwrap().body, "heard");
        // Detached: the actor dropped its sink, so the stream ends.
        assert!(alice_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_list_users_reports_attached_parties() {
        let chan = ChannelActor::spawn(fresh_id(), "census");
        let (alice, _alice_rx) = attach_party(&chan, 8);
        let (bob, _bob_rx) = attach_party(&chan, 8);

        let mut users = barrier(&chan).await;
        users.sort();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(users, expected);

        chan.detach(bob);
        assert_eq!(barrier(&chan).await, vec![alice]);
    }

    #[tokio::test]
    async fn test_full_sink_drops_without_disturbing_others() {
        let chan = ChannelActor::spawn(fresh_id(), "congested");
        let (slow, mut slow_rx) = attach_party(&chan, 1);
        let (_fast, mut fast_rx) = attach_party(&chan, 8);

        chan.publish(slow, "one".to_string());
        chan.publish(slow, "two".to_string());
        chan.publish(slow, "three".to_string());
        barrier(&chan).await;

        // The slow party only had room for the first message.
        assert_eq!(slow_rx.recv().await.unwrap().body, "one");
        assert!(slow_rx.try_recv().is_err());

        // The fast party saw everything, in order.
        for body in ["one", "two", "three"] {
            assert_eq!(fast_rx.recv().await.unwrap().body, body);
        }
    }

    #[tokio::test]
    async fn test_closed_sink_is_pruned() {
        let chan = ChannelActor::spawn(fresh_id(), "pruning");
        let (alice, _alice_rx) = attach_party(&chan, 8);
        let (_bob, bob_rx) = attach_party(&chan, 8);
        drop(bob_rx);

        chan.publish(alice, "ping".to_string());
        assert_eq!(barrier(&chan).await, vec![alice]);
    }

    #[tokio::test]
    async fn test_actor_stops_when_handles_dropped() {
        let chan = ChannelActor::spawn(fresh_id(), "ephemeral");
        let (_alice, mut alice_rx) = attach_party(&chan, 8);
        barrier(&chan).await;

        // The loop ends once the last handle is gone, and the actor's
        // sinks drop with it.
        drop(chan);
        assert!(alice_rx.recv().await.is_none());
    }
}
