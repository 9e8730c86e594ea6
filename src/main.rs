//! Chat server core demo
//!
//! Runs the coordinator in-process with a couple of simulated clients:
//! two live users wired up through mpsc transports and one headless bot.
//! Shows connect/join/publish/fan-out/leave and prints the channel list
//! as JSON at the end.
//!
//! Usage:
//!   cargo run

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use palaver::{
    ChatClientMessage, Coordinator, Materializer, Message, PartyFlow, ServerConfig, ServerHandle,
    UserInfo,
};

/// Per-channel input senders a local client writes into, filled in as the
/// coordinator materializes flows for the user.
type Inputs = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Message>>>>;

/// A chat client living in this process, its transport being two mpsc
/// channels per flow.
struct LocalClient {
    user: UserInfo,
    inputs: Inputs,
    rx: mpsc::Receiver<ChatClientMessage>,
}

impl LocalClient {
    async fn connect(
        server: &ServerHandle,
        nick: &str,
        channels: Vec<Uuid>,
    ) -> palaver::Result<Self> {
        let (out_tx, rx) = mpsc::channel(64);
        let inputs: Inputs = Arc::default();

        let registry = Arc::clone(&inputs);
        let materializer: Materializer = Box::new(move |flow: PartyFlow| {
            let (in_tx, in_rx) = mpsc::channel(64);
            registry
                .lock()
                .expect("input registry poisoned")
                .insert(flow.channel_id(), in_tx);
            flow.run(in_rx, out_tx.clone())
        });

        let user = server
            .connect(nick, None, Some(materializer), channels)
            .await?;
        Ok(Self { user, inputs, rx })
    }

    async fn say(&self, channel_id: Uuid, text: &str) {
        let input = self
            .inputs
            .lock()
            .expect("input registry poisoned")
            .get(&channel_id)
            .cloned();
        if let Some(input) = input {
            let _ = input.send(Message::new(text)).await;
        }
    }

    async fn print_received(&mut self, count: usize, names: &HashMap<Uuid, String>) {
        for _ in 0..count {
            if let Some(msg) = self.rx.recv().await {
                let sender = names
                    .get(&msg.sender)
                    .map(String::as_str)
                    .unwrap_or("unknown");
                println!("[{}] {}: {}", self.user.nick, sender, msg.body);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let server = Coordinator::spawn(ServerConfig::default());

    let hardware = server.new_channel("hardware").await?;
    server
        .set_topic(hardware.id, "soldering and firmware")
        .await?;

    let mut alice = LocalClient::connect(&server, "alice", vec![hardware.id]).await?;
    let mut bob = LocalClient::connect(&server, "bob", vec![hardware.id]).await?;
    let logbot = server.connect("logbot", None, None, vec![hardware.id]).await?;

    let names: HashMap<Uuid, String> = [
        (alice.user.id, "alice".to_string()),
        (bob.user.id, "bob".to_string()),
    ]
    .into();

    alice.say(hardware.id, "anyone fixed the flaky jtag probe?").await;
    bob.say(hardware.id, "reflowed it yesterday, works now").await;

    // Fan-out includes the publishers themselves, so each client sees both
    // messages.
    alice.print_received(2, &names).await;
    bob.print_received(2, &names).await;

    let channels = server.list().await?;
    println!("{}", serde_json::to_string_pretty(&channels)?);

    info!("Winding down");
    server.leave(bob.user.id, hardware.id).await?;
    server.disconnect(alice.user.id).await?;
    server.disconnect(bob.user.id).await?;
    server.disconnect(logbot.id).await?;
    server.drop_channel(hardware.id).await?;

    let channels = server.list().await?;
    println!("channels left: {}", channels.len());

    Ok(())
}
