//! Per-(user, channel) flow segments and their kill switches
//!
//! A [`PartyFlow`] describes the bidirectional wiring between one user's
//! transport and one channel actor. Materializing it spawns the two pump
//! tasks and hands back the [`KillSwitch`] that severs the subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::messages::{ChatClientMessage, Message};
use crate::server::channel::ChannelHandle;

/// Function that materializes a prepared flow into a running stream.
///
/// Supplied per user on connect; invoked by the coordinator for every
/// channel the user joins. `None` at the user level means a headless user
/// (bot or test fixture) that joins channels without any live stream.
pub type Materializer = Box<dyn Fn(PartyFlow) -> KillSwitch + Send>;

/// Bidirectional flow description between a user and a channel.
///
/// Inbound half: client [`Message`]s become channel publications carrying
/// the user id. Outbound half: the channel fan-out arrives as
/// [`ChatClientMessage`]s for the transport to ship.
pub struct PartyFlow {
    channel: ChannelHandle,
    user_id: Uuid,
    /// Capacity of the fan-out sink the channel actor writes into
    buffer: usize,
}

impl PartyFlow {
    pub fn new(channel: ChannelHandle, user_id: Uuid, buffer: usize) -> Self {
        Self {
            channel,
            user_id,
            buffer,
        }
    }

    /// Id of the user this flow belongs to
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Id of the channel this flow feeds
    pub fn channel_id(&self) -> Uuid {
        self.channel.id()
    }

    /// Materialize the flow against a transport.
    ///
    /// `incoming` carries what the client sends; `outgoing` receives the
    /// channel fan-out. Attaches the party to the channel actor, spawns
    /// both pumps, and returns the switch that tears it all down.
    pub fn run(
        self,
        mut incoming: mpsc::Receiver<Message>,
        outgoing: mpsc::Sender<ChatClientMessage>,
    ) -> KillSwitch {
        let (fan_tx, mut fan_rx) = mpsc::channel(self.buffer);
        self.channel.attach(self.user_id, fan_tx);

        let publisher = self.channel.clone();
        let user_id = self.user_id;
        let inbound = tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                if !publisher.publish(user_id, msg.body) {
                    break;
                }
            }
        });

        let outbound = tokio::spawn(async move {
            while let Some(msg) = fan_rx.recv().await {
                if outgoing.send(msg).await.is_err() {
                    break;
                }
            }
        });

        KillSwitch::new(
            self.channel,
            self.user_id,
            vec![inbound.abort_handle(), outbound.abort_handle()],
        )
    }
}

/// One-shot handle that severs a party's subscription to a channel.
///
/// `shutdown` aborts the flow's pump tasks and detaches the party from
/// the channel actor. Calling it again is harmless.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    inner: Arc<SwitchInner>,
}

#[derive(Debug)]
struct SwitchInner {
    fired: AtomicBool,
    pumps: Vec<AbortHandle>,
    channel: ChannelHandle,
    user_id: Uuid,
}

impl KillSwitch {
    fn new(channel: ChannelHandle, user_id: Uuid, pumps: Vec<AbortHandle>) -> Self {
        Self {
            inner: Arc::new(SwitchInner {
                fired: AtomicBool::new(false),
                pumps,
                channel,
                user_id,
            }),
        }
    }

    /// Terminate the flow. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        for pump in &self.inner.pumps {
            pump.abort();
        }
        self.inner.channel.detach(self.inner.user_id);
        debug!(
            "Kill switch fired for party {} on channel {}",
            self.inner.user_id,
            self.inner.channel.id()
        );
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}
