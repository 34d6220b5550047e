//! Shared helpers for the LAN integration tests: chat clients on an
//! in-process loopback segment.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use vertochat::chat::{ChatEvent, Controller};
use vertochat::config::settings::{Settings, SettingsSaver};
use vertochat::config::{ChatConfig, NetworkConfig};
use vertochat::transport::loopback::{LoopbackHub, LoopbackNetwork};
use vertochat::transport::{Endpoint, MessageTransport, ReceiverListener};
use vertochat_proto::codec;
use vertochat_proto::message::MessageBody;

/// How long to wait for something to happen on the simulated LAN.
pub const WAIT: Duration = Duration::from_secs(3);

/// Settle delay used by test clients.
pub const LOGON_DELAY: Duration = Duration::from_millis(50);

/// Remembers the last saved settings instead of writing a file.
#[derive(Default)]
pub struct MemorySaver(pub parking_lot::Mutex<Option<Settings>>);

impl SettingsSaver for MemorySaver {
    fn save(&self, settings: &Settings) {
        *self.0.lock() = Some(settings.clone());
    }
}

/// Fast timers, no periodic connection checks.
pub fn configs() -> (NetworkConfig, ChatConfig) {
    (
        NetworkConfig {
            monitor_interval: Duration::from_secs(3600),
            probe_timeout: Duration::from_millis(200),
            ..NetworkConfig::default()
        },
        ChatConfig {
            idle_interval: Duration::from_secs(3600),
            logon_delay: LOGON_DELAY,
            ..ChatConfig::default()
        },
    )
}

/// One chat client on the segment, with the events it has seen.
pub struct Client {
    pub chat: Controller<LoopbackNetwork>,
    pub network: Arc<LoopbackNetwork>,
    pub saver: Arc<MemorySaver>,
    events: mpsc::UnboundedReceiver<ChatEvent>,
    seen: Vec<ChatEvent>,
}

impl Client {
    /// A logged-off client at `10.0.0.<last>`.
    pub fn new(hub: &Arc<LoopbackHub>, last: u8, nick: &str) -> Self {
        let (network_config, chat_config) = configs();
        Self::with_configs(hub, last, nick, network_config, chat_config)
    }

    /// A logged-off client with custom configuration.
    pub fn with_configs(
        hub: &Arc<LoopbackHub>,
        last: u8,
        nick: &str,
        network_config: NetworkConfig,
        chat_config: ChatConfig,
    ) -> Self {
        let network = Arc::new(LoopbackNetwork::new(hub, Ipv4Addr::new(10, 0, 0, last)));
        let saver = Arc::new(MemorySaver::default());
        let settings = Settings {
            nick: nick.to_string(),
            ..Settings::default()
        };
        let (chat, events) = Controller::new(
            Arc::clone(&network),
            network_config,
            chat_config,
            settings,
            Arc::clone(&saver) as Arc<dyn SettingsSaver>,
        );
        Self {
            chat,
            network,
            saver,
            events,
            seen: Vec::new(),
        }
    }

    /// A client that is logged on and settled.
    pub async fn online(hub: &Arc<LoopbackHub>, last: u8, nick: &str) -> Self {
        let client = Self::new(hub, last, nick);
        client.chat.log_on().await.expect("log on");
        wait_until(|| client.chat.is_logon_completed()).await;
        client
    }

    pub fn code(&self) -> i32 {
        self.chat.me_code()
    }

    /// Wait for an event matching `pred` and consume it.
    pub async fn wait_for(&mut self, pred: impl Fn(&ChatEvent) -> bool) -> ChatEvent {
        let found = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(pos) = self.seen.iter().position(&pred) {
                    return self.seen.remove(pos);
                }
                let event = self.events.recv().await.expect("event channel open");
                self.seen.push(event);
            }
        })
        .await;
        match found {
            Ok(event) => event,
            Err(_) => panic!("expected event not seen, got {:?}", self.seen),
        }
    }

    /// Wait for a system message equal to `text`.
    pub async fn wait_for_system(&mut self, text: &str) {
        self.wait_for(|e| matches!(e, ChatEvent::SystemMessage(t) if t == text))
            .await;
    }

    /// Whether a matching event has arrived so far. Does not wait.
    pub fn has_seen(&mut self, pred: impl Fn(&ChatEvent) -> bool) -> bool {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        self.seen.iter().any(pred)
    }

    /// Wait until this client knows `other`.
    pub async fn wait_knows(&self, other: &Self) {
        let code = other.code();
        wait_until(|| self.chat.user(code).is_some()).await;
    }
}

/// Poll `cond` until it holds or [`WAIT`] passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Two settled clients that know each other.
pub async fn pair(hub: &Arc<LoopbackHub>) -> (Client, Client) {
    let kenny = Client::online(hub, 1, "Kenny").await;
    let stan = Client::online(hub, 2, "Stan").await;
    kenny.wait_knows(&stan).await;
    stan.wait_knows(&kenny).await;
    (kenny, stan)
}

#[derive(Default)]
struct Heard(parking_lot::Mutex<Vec<(Ipv4Addr, String)>>);

impl ReceiverListener for Heard {
    fn message_arrived(&self, message: &str, ip: Ipv4Addr) {
        self.0.lock().push((ip, message.to_string()));
    }
}

/// A bare host on the segment that records every datagram sent to the
/// chat group, for counting what a client actually put on the wire.
pub struct GroupTap {
    network: Arc<LoopbackNetwork>,
    transport: MessageTransport<LoopbackNetwork>,
    heard: Arc<Heard>,
    syncs: AtomicU32,
}

impl GroupTap {
    /// A tap at `10.0.0.<last>`.
    pub fn new(hub: &Arc<LoopbackHub>, last: u8) -> Self {
        let network = Arc::new(LoopbackNetwork::new(hub, Ipv4Addr::new(10, 0, 0, last)));
        let (network_config, _) = configs();
        let transport = MessageTransport::new(
            Arc::clone(&network),
            Endpoint::Group(network_config.group),
            network_config.packet_size,
        );
        let heard = Arc::new(Heard::default());
        transport
            .start_receiver(network.address(), Arc::clone(&heard) as Arc<dyn ReceiverListener>)
            .expect("tap receiver");
        transport.start_sender(network.address()).expect("tap sender");
        Self {
            network,
            transport,
            heard,
            syncs: AtomicU32::new(0),
        }
    }

    /// Wait until every datagram sent to the group before this call has
    /// been recorded. Each socket receives in send order, so seeing our own
    /// marker means everything earlier has arrived.
    pub async fn sync(&self) {
        let n = self.syncs.fetch_add(1, Ordering::SeqCst);
        let marker = format!("0!TAPSYNC#{n}:");
        self.transport.send(&marker).expect("tap marker");
        let me = self.network.address();
        wait_until(|| {
            self.heard
                .0
                .lock()
                .iter()
                .any(|(ip, text)| *ip == me && *text == marker)
        })
        .await;
    }

    /// Decodable group messages recorded from `client`, in arrival order.
    pub fn bodies_from(&self, client: &Client) -> Vec<MessageBody> {
        let from = client.network.address();
        self.heard
            .0
            .lock()
            .iter()
            .filter(|(ip, _)| *ip == from)
            .filter_map(|(_, text)| codec::decode(text).ok())
            .map(|message| message.body)
            .collect()
    }

    /// Chat lines recorded from `client`.
    pub fn chat_lines_from(&self, client: &Client) -> Vec<String> {
        self.bodies_from(client)
            .into_iter()
            .filter_map(|body| match body {
                MessageBody::Chat { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }
}
