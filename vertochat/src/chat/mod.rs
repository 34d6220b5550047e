//! Chat core for `VertoChat`.
//!
//! [`Controller`] is the single place where chat state changes. Commands
//! from the user interface and callbacks from the network both take the
//! same lock around the chat state; notifications for the user interface go
//! out on an unbounded [`ChatEvent`] channel so they never re-enter it.
//!
//! Every command validates first, then sends one message, then changes
//! local state. A rejected command sends nothing and changes nothing.
//!
//! # Lifecycle
//!
//! ```text
//! Offline --log_on--> Connecting --settle delay--> Online
//!                          |                        |
//!                          +---- network down ------+--> Suspended
//!                                                           |
//!                          network back: re-announce <-----+
//! ```

pub mod parser;
mod responder;
pub mod state;
mod timers;
pub mod transfers;
pub mod users;

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vertochat_proto::codec;
use vertochat_proto::message::{
    ClientInfo, FileAbort, FileAccept, FileOffer, GroupMessage, MessageBody, PrivateMessage,
    TopicPayload,
};

use crate::config::settings::{Settings, SettingsSaver};
use crate::config::{ChatConfig, NetworkConfig};
use crate::net::{NetworkConnectionListener, NetworkService};
use crate::transport::{Network, TransportError};

use parser::{MessageParser, MessageResponder, PrivateMessageParser};
pub use state::{ChatState, ConnectionPhase, Topic};
pub use transfers::{Direction, Transfer, WaitingOffer};
use transfers::{TransferList, WaitingList};
pub use users::{User, UserList};
use users::is_valid_nick;

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// Not logged on, or the network is down.
    #[error("you are not connected to the network")]
    NotConnected,
    /// Not logged on.
    #[error("you are not logged on")]
    NotLoggedOn,
    /// The local user is away.
    #[error("you can not do that while away")]
    MeAway,
    /// `come_back` while present.
    #[error("you are not away")]
    NotAway,
    /// Blank chat or private message.
    #[error("the message is empty")]
    EmptyMessage,
    /// `go_away` without a reason.
    #[error("an away message is required")]
    EmptyAwayMessage,
    /// Text longer than the message byte budget.
    #[error("the text is too long, the limit is {max} bytes")]
    TooLong {
        /// The byte budget.
        max: usize,
    },
    /// Nick fails validation.
    #[error("'{0}' is not a valid nick")]
    InvalidNick(String),
    /// Another online user has the nick.
    #[error("the nick '{0}' is in use by someone else")]
    NickInUse(String),
    /// No user with the given code.
    #[error("no such user")]
    UnknownUser,
    /// Sending a file to yourself.
    #[error("you can not send a file to yourself")]
    UserIsMe,
    /// The target user is away.
    #[error("{0} is away")]
    UserAway(String),
    /// The target user is offline.
    #[error("{0} is offline")]
    UserOffline(String),
    /// The target user announced no private chat port.
    #[error("{0} can not receive private messages")]
    NoPrivatePort(String),
    /// Private chat is turned off locally.
    #[error("private chat is disabled")]
    PrivateChatDisabled,
    /// No matching file offer.
    #[error("no such file offer")]
    NoSuchOffer,
}

impl Rejection {
    /// Stable identifier for the reason, for front ends that translate.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::NotLoggedOn => "not_logged_on",
            Self::MeAway => "me_away",
            Self::NotAway => "not_away",
            Self::EmptyMessage => "empty_message",
            Self::EmptyAwayMessage => "empty_away_message",
            Self::TooLong { .. } => "too_long",
            Self::InvalidNick(_) => "invalid_nick",
            Self::NickInUse(_) => "nick_in_use",
            Self::UnknownUser => "unknown_user",
            Self::UserIsMe => "user_is_me",
            Self::UserAway(_) => "user_away",
            Self::UserOffline(_) => "user_offline",
            Self::NoPrivatePort(_) => "no_private_port",
            Self::PrivateChatDisabled => "private_chat_disabled",
            Self::NoSuchOffer => "no_such_offer",
        }
    }
}

/// Errors returned by [`Controller`] commands.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// A precondition failed. Nothing was sent or changed.
    #[error("{0}")]
    Rejected(#[from] Rejection),

    /// The message could not be sent. Nothing was changed.
    #[error("failed to send: {0}")]
    SendFailed(#[source] TransportError),

    /// The network could not be opened.
    #[error("network error: {0}")]
    Transport(#[from] TransportError),

    /// The controller has been shut down.
    #[error("the chat has been shut down")]
    ShutDown,
}

/// Notifications for the user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Informational line.
    SystemMessage(String),
    /// The topic to display.
    ShowTopic(Topic),
    /// The local user went away or came back.
    AwayChanged {
        /// Whether the local user is away.
        away: bool,
        /// The away message. Empty when back.
        message: String,
    },
    /// A group chat line, including the local user's own.
    ChatMessage {
        /// Sender code.
        code: i32,
        /// Sender nick.
        nick: String,
        /// Packed RGB color.
        color: i32,
        /// The line.
        text: String,
    },
    /// A private chat line.
    PrivateMessage {
        /// The other party of the conversation.
        user_code: i32,
        /// Nick of the sender.
        nick: String,
        /// Packed RGB color.
        color: i32,
        /// The line.
        text: String,
        /// Sent by the local user.
        outgoing: bool,
    },
    /// Informational line for one private conversation.
    PrivateSystemMessage {
        /// The other party of the conversation.
        user_code: i32,
        /// The line.
        text: String,
    },
    /// Users joined, left or changed.
    UserListChanged,
    /// A peer offers a file.
    FileOffered {
        /// Peer code.
        user_code: i32,
        /// Peer nick.
        nick: String,
        /// File identifier within the offer.
        hash: i32,
        /// File name.
        file_name: String,
        /// Size in bytes.
        size: u64,
    },
    /// A peer accepted the local user's offer.
    FileAccepted {
        /// Peer code.
        user_code: i32,
        /// File identifier within the offer.
        hash: i32,
        /// File name.
        file_name: String,
        /// Port the peer receives on.
        port: u16,
    },
    /// A peer aborted or rejected a transfer.
    FileAborted {
        /// Peer code.
        user_code: i32,
        /// File identifier within the offer.
        hash: i32,
        /// File name.
        file_name: String,
    },
    /// The connection phase changed.
    ConnectionStatus(ConnectionPhase),
}

/// Everything guarded by the controller lock.
struct ChatCore {
    users: UserList,
    topic: Topic,
    state: ChatState,
    waiting: WaitingList,
    transfers: TransferList,
    unidentified: HashSet<i32>,
    settings: Settings,
    logged_on_at: Option<Instant>,
    shut_down: bool,
}

#[derive(Default)]
struct Tasks {
    idle: Option<JoinHandle<()>>,
    day: Option<JoinHandle<()>>,
    settle: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [self.idle.take(), self.day.take(), self.settle.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

struct ControllerInner<N: Network> {
    me_code: i32,
    this: Weak<Self>,
    service: NetworkService<N>,
    config: ChatConfig,
    saver: Arc<dyn SettingsSaver>,
    events: mpsc::UnboundedSender<ChatEvent>,
    core: Mutex<ChatCore>,
    tasks: Mutex<Tasks>,
}

/// Milliseconds since the Unix epoch.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Owns the chat state and the network service.
pub struct Controller<N: Network> {
    inner: Arc<ControllerInner<N>>,
}

impl<N: Network> Controller<N> {
    /// Creates a logged-off controller.
    ///
    /// The local user gets a random 8-digit code. If the configured nick is
    /// not valid, the code doubles as the nick.
    pub fn new(
        network: Arc<N>,
        network_config: NetworkConfig,
        chat_config: ChatConfig,
        settings: Settings,
        saver: Arc<dyn SettingsSaver>,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let me_code = rand::rng().random_range(10_000_000..100_000_000);
        let nick = if is_valid_nick(&settings.nick) {
            settings.nick.clone()
        } else {
            me_code.to_string()
        };
        let mut me = User::me(me_code, nick);
        me.client.clone_from(&chat_config.client_name);
        me.operating_system = std::env::consts::OS.to_string();

        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|this: &Weak<ControllerInner<N>>| {
            let responder: Weak<dyn MessageResponder> = this.clone();
            let group = Arc::new(MessageParser::new(me_code, responder.clone()));
            let private = Arc::new(PrivateMessageParser::new(me_code, responder));
            ControllerInner {
                me_code,
                this: this.clone(),
                service: NetworkService::new(network, network_config, group, private),
                config: chat_config,
                saver,
                events,
                core: Mutex::new(ChatCore {
                    users: UserList::new(me),
                    topic: Topic::default(),
                    state: ChatState::default(),
                    waiting: WaitingList::new(),
                    transfers: TransferList::new(),
                    unidentified: HashSet::new(),
                    settings,
                    logged_on_at: None,
                    shut_down: false,
                }),
                tasks: Mutex::new(Tasks::default()),
            }
        });
        let listener: Weak<dyn NetworkConnectionListener> = Arc::downgrade(&inner) as Weak<ControllerInner<N>>;
        inner.service.register_connection_listener(listener);
        tracing::info!(code = me_code, "chat controller created");
        (Self { inner }, rx)
    }

    /// Start the idle and day timers and greet the user.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.core.lock().shut_down {
            return;
        }
        {
            let mut tasks = inner.tasks.lock();
            if tasks.idle.is_none() {
                tasks.idle = Some(tokio::spawn(timers::idle_loop(
                    Weak::clone(&inner.this),
                    inner.config.idle_interval,
                )));
            }
            if tasks.day.is_none() {
                tasks.day = Some(tokio::spawn(timers::day_loop(
                    Weak::clone(&inner.this),
                    timers::DAY_CHECK_INTERVAL,
                )));
            }
        }
        inner.system(format!("Welcome to {}!", inner.config.client_name));
        inner.system(format!(
            "Today is {}",
            timers::format_day(chrono::Local::now().date_naive())
        ));
    }

    /// Connect to the network. LOGON goes out as soon as it is up.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ShutDown`] after [`shutdown`](Self::shutdown),
    /// or [`ControllerError::Transport`] if no interface is usable or the
    /// group socket cannot be bound.
    pub async fn log_on(&self) -> Result<(), ControllerError> {
        let inner = &self.inner;
        {
            let mut core = inner.core.lock();
            if core.shut_down {
                return Err(ControllerError::ShutDown);
            }
            if inner.service.is_connection_alive() {
                tracing::debug!("already logged on");
                return Ok(());
            }
            core.state.phase = ConnectionPhase::Connecting;
        }
        inner.emit(ChatEvent::ConnectionStatus(ConnectionPhase::Connecting));

        if let Err(e) = inner.service.connect().await {
            let mut core = inner.core.lock();
            if !core.state.logged_on {
                core.state.phase = ConnectionPhase::Offline;
            }
            drop(core);
            inner.emit(ChatEvent::ConnectionStatus(ConnectionPhase::Offline));
            inner.system(format!("Failed to connect to the network: {e}"));
            return Err(ControllerError::Transport(e));
        }
        Ok(())
    }

    /// Log off. With `remove_users`, forget every peer; otherwise keep them
    /// and only release their transfers.
    pub fn log_off(&self, remove_users: bool) {
        self.inner.log_off(remove_users);
    }

    /// Log off keeping peers and stop the timers. Later calls do nothing.
    pub fn shutdown(&self) {
        {
            let mut core = self.inner.core.lock();
            if core.shut_down {
                return;
            }
            core.shut_down = true;
        }
        self.inner.log_off(false);
        self.inner.tasks.lock().abort_all();
        tracing::info!("chat shut down");
    }

    /// Send a chat line to everyone.
    ///
    /// # Errors
    ///
    /// [`Rejection`] when not connected, away, or the text is blank or too
    /// long; [`ControllerError::SendFailed`] if the send fails.
    pub fn send_chat_message(&self, text: &str) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let core = inner.core.lock();
        if !inner.is_connected(&core) {
            return Err(Rejection::NotConnected.into());
        }
        if core.users.me().away {
            return Err(Rejection::MeAway.into());
        }
        if text.trim().is_empty() {
            return Err(Rejection::EmptyMessage.into());
        }
        inner.check_length(text)?;

        let color = core.settings.own_color;
        inner.send(
            &core,
            MessageBody::Chat {
                color,
                text: text.to_string(),
            },
        )?;
        inner.emit(ChatEvent::ChatMessage {
            code: inner.me_code,
            nick: core.users.me().nick().to_string(),
            color,
            text: text.to_string(),
        });
        Ok(())
    }

    /// Mark the local user away with `message`.
    ///
    /// # Errors
    ///
    /// [`Rejection`] when the message is blank or too long or when not
    /// logged on; [`ControllerError::SendFailed`] if the send fails.
    pub fn go_away(&self, message: &str) -> Result<(), ControllerError> {
        let inner = &self.inner;
        if message.trim().is_empty() {
            return Err(Rejection::EmptyAwayMessage.into());
        }
        let mut core = inner.core.lock();
        if !core.state.logged_on {
            return Err(Rejection::NotLoggedOn.into());
        }
        inner.check_length(message)?;

        inner.send(
            &core,
            MessageBody::Away {
                message: message.to_string(),
            },
        )?;
        core.users.change_away(inner.me_code, true, message);
        drop(core);
        inner.emit(ChatEvent::AwayChanged {
            away: true,
            message: message.to_string(),
        });
        inner.emit(ChatEvent::UserListChanged);
        inner.system(format!("You went away: {message}"));
        Ok(())
    }

    /// Mark the local user present again.
    ///
    /// # Errors
    ///
    /// [`Rejection`] when not logged on or not away;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn come_back(&self) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if !core.state.logged_on {
            return Err(Rejection::NotLoggedOn.into());
        }
        if !core.users.me().away {
            return Err(Rejection::NotAway.into());
        }

        inner.send(&core, MessageBody::Back)?;
        core.users.change_away(inner.me_code, false, "");
        drop(core);
        inner.emit(ChatEvent::AwayChanged {
            away: false,
            message: String::new(),
        });
        inner.emit(ChatEvent::UserListChanged);
        inner.system("You came back");
        Ok(())
    }

    /// Set the topic. An empty text removes it.
    ///
    /// # Errors
    ///
    /// [`Rejection`] when not logged on, away, or the text is too long;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn change_topic(&self, text: &str) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if !core.state.logged_on {
            return Err(Rejection::NotLoggedOn.into());
        }
        if core.users.me().away {
            return Err(Rejection::MeAway.into());
        }
        let text = text.trim();
        inner.check_length(text)?;

        // Strictly newer than what we hold, whatever the local clock says.
        let timestamp = now_ms().max(core.topic.timestamp.saturating_add(1));
        let topic = Topic::new(text, core.users.me().nick(), timestamp);
        inner.send(&core, MessageBody::Topic(topic_payload(&topic)))?;
        core.topic.change(&topic);
        drop(core);

        if topic.is_set() {
            inner.system(format!("You changed the topic to: {text}"));
        } else {
            inner.system("You removed the topic");
        }
        inner.emit(ChatEvent::ShowTopic(topic));
        Ok(())
    }

    /// Change the local user's nick and save it in the settings.
    ///
    /// # Errors
    ///
    /// [`Rejection`] when away, the nick is invalid, or someone else has it;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn change_my_nick(&self, nick: &str) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let nick = nick.trim();
        let mut core = inner.core.lock();
        if core.users.me().away {
            return Err(Rejection::MeAway.into());
        }
        if !is_valid_nick(nick) {
            return Err(Rejection::InvalidNick(nick.to_string()).into());
        }
        if core.users.is_nick_taken(nick, Some(inner.me_code)) {
            return Err(Rejection::NickInUse(nick.to_string()).into());
        }
        if core.users.me().nick() == nick {
            return Ok(());
        }

        if inner.is_connected(&core) {
            inner.send_as(nick, MessageBody::Nick)?;
        }
        core.users.change_nick(inner.me_code, nick);
        core.settings.nick = nick.to_string();
        let settings = core.settings.clone();
        drop(core);

        inner.saver.save(&settings);
        inner.emit(ChatEvent::UserListChanged);
        inner.system(format!("You changed nick to {nick}"));
        Ok(())
    }

    /// Tell the others whether the local user is typing. Only changes are
    /// sent, and only while connected.
    pub fn update_me_writing(&self, writing: bool) {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if core.state.wrote == writing {
            return;
        }
        if inner.is_connected(&core) {
            let body = if writing {
                MessageBody::Writing
            } else {
                MessageBody::StoppedWriting
            };
            if let Err(e) = inner.send(&core, body) {
                tracing::warn!(error = %e, "failed to send writing state");
                return;
            }
        }
        core.state.wrote = writing;
        core.users.change_writing(inner.me_code, writing);
    }

    /// Offer a file to a user. Returns the hash identifying the offer.
    ///
    /// # Errors
    ///
    /// [`Rejection`] when the user is unknown or is me, when not connected,
    /// when either side is away, or the name is too long;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn send_file(&self, user_code: i32, file_name: &str, size: u64) -> Result<i32, ControllerError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let user = core.users.get(user_code).ok_or(Rejection::UnknownUser)?;
        if user.is_me() {
            return Err(Rejection::UserIsMe.into());
        }
        if !inner.is_connected(&core) {
            return Err(Rejection::NotConnected.into());
        }
        if core.users.me().away {
            return Err(Rejection::MeAway.into());
        }
        if user.away {
            return Err(Rejection::UserAway(user.nick().to_string()).into());
        }
        inner.check_length(file_name)?;
        let nick = user.nick().to_string();

        let hash = rand::rng().random_range(1..i32::MAX);
        inner.send(
            &core,
            MessageBody::SendFile(FileOffer {
                to_code: user_code,
                size,
                hash,
                file_name: file_name.to_string(),
            }),
        )?;
        core.waiting.add(WaitingOffer {
            user_code,
            hash,
            file_name: file_name.to_string(),
            size,
            direction: Direction::Outgoing,
        });
        drop(core);
        inner.system(format!("Trying to send the file {file_name} to {nick}"));
        Ok(hash)
    }

    /// Accept an incoming file offer, receiving on `port`.
    ///
    /// # Errors
    ///
    /// [`Rejection`] when not connected or there is no such offer;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn accept_file_transfer(&self, user_code: i32, hash: i32, port: u16) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        if !inner.is_connected(&core) {
            return Err(Rejection::NotConnected.into());
        }
        let offer = core
            .waiting
            .get(Direction::Incoming, user_code, hash)
            .cloned()
            .ok_or(Rejection::NoSuchOffer)?;

        inner.send(
            &core,
            MessageBody::SendFileAccept(FileAccept {
                to_code: user_code,
                port,
                hash,
                file_name: offer.file_name.clone(),
            }),
        )?;
        core.waiting.take(Direction::Incoming, user_code, hash);
        let file_name = offer.file_name.clone();
        core.transfers.start(Transfer::from_offer(offer, port));
        drop(core);
        inner.system(format!("Accepted the file {file_name}"));
        Ok(())
    }

    /// Reject an incoming file offer.
    ///
    /// # Errors
    ///
    /// [`Rejection::NoSuchOffer`] when there is no such offer;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn reject_file_transfer(&self, user_code: i32, hash: i32) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let offer = core
            .waiting
            .get(Direction::Incoming, user_code, hash)
            .cloned()
            .ok_or(Rejection::NoSuchOffer)?;

        if inner.is_connected(&core) {
            inner.send(&core, abort_body(user_code, hash, &offer.file_name))?;
        }
        core.waiting.take(Direction::Incoming, user_code, hash);
        drop(core);
        inner.system(format!("Rejected the file {}", offer.file_name));
        Ok(())
    }

    /// Withdraw an outgoing offer or abort an accepted transfer.
    ///
    /// # Errors
    ///
    /// [`Rejection::NoSuchOffer`] when nothing matches;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn cancel_file_transfer(&self, user_code: i32, hash: i32) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let file_name = core
            .waiting
            .get(Direction::Outgoing, user_code, hash)
            .map(|offer| offer.file_name.clone())
            .or_else(|| {
                [Direction::Incoming, Direction::Outgoing]
                    .into_iter()
                    .find_map(|d| core.transfers.get(d, user_code, hash))
                    .map(|t| t.file_name.clone())
            })
            .ok_or(Rejection::NoSuchOffer)?;

        if inner.is_connected(&core) {
            inner.send(&core, abort_body(user_code, hash, &file_name))?;
        }
        core.waiting.take(Direction::Outgoing, user_code, hash);
        core.transfers.cancel(Direction::Incoming, user_code, hash);
        core.transfers.cancel(Direction::Outgoing, user_code, hash);
        drop(core);
        inner.system(format!("Cancelled the file transfer of {file_name}"));
        Ok(())
    }

    /// Send a private message to one user.
    ///
    /// # Errors
    ///
    /// [`Rejection`] for an unknown user, when not connected or away, for a
    /// blank or too long text, when the user has no private port, is away
    /// or offline, or when private chat is disabled locally;
    /// [`ControllerError::SendFailed`] if the send fails.
    pub fn send_private_message(&self, user_code: i32, text: &str) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let mut core = inner.core.lock();
        let user = core.users.get(user_code).ok_or(Rejection::UnknownUser)?;
        if !inner.is_connected(&core) {
            return Err(Rejection::NotConnected.into());
        }
        if core.users.me().away {
            return Err(Rejection::MeAway.into());
        }
        if text.trim().is_empty() {
            return Err(Rejection::EmptyMessage.into());
        }
        inner.check_length(text)?;
        let nick = user.nick().to_string();
        let (port, ip) = match (user.private_chat_port, user.ip) {
            (0, _) | (_, None) => return Err(Rejection::NoPrivatePort(nick).into()),
            (port, Some(ip)) => (port, ip),
        };
        if user.away {
            return Err(Rejection::UserAway(nick).into());
        }
        if !user.is_online() {
            return Err(Rejection::UserOffline(nick).into());
        }
        if !inner.service.is_private_chat_enabled() {
            return Err(Rejection::PrivateChatDisabled.into());
        }

        let color = core.settings.own_color;
        let line = codec::encode_private(&PrivateMessage::new(inner.me_code, user_code, color, text));
        inner
            .service
            .send_to_user(&line, ip, port)
            .map_err(ControllerError::SendFailed)?;
        if let Some(user) = core.users.get_mut(user_code) {
            user.private_chat.get_or_insert_default().logged_off = false;
        }
        let my_nick = core.users.me().nick().to_string();
        drop(core);
        inner.emit(ChatEvent::PrivateMessage {
            user_code,
            nick: my_nick,
            color,
            text: text.to_string(),
            outgoing: true,
        });
        Ok(())
    }

    /// Clear the unread flag of a private conversation.
    pub fn mark_private_chat_read(&self, user_code: i32) {
        self.inner.core.lock().users.change_new_message(user_code, false);
    }

    /// Run a connection check now instead of waiting for the monitor.
    pub async fn check_network(&self) {
        self.inner.service.check_connection().await;
    }

    /// The local user's code.
    #[must_use]
    pub fn me_code(&self) -> i32 {
        self.inner.me_code
    }

    /// The local user.
    #[must_use]
    pub fn me(&self) -> User {
        self.inner.core.lock().users.me().clone()
    }

    /// The current topic.
    #[must_use]
    pub fn topic(&self) -> Topic {
        self.inner.core.lock().topic.clone()
    }

    /// All users in discovery order, the local user first.
    #[must_use]
    pub fn users(&self) -> Vec<User> {
        self.inner.core.lock().users.iter().cloned().collect()
    }

    /// Look up a user by code.
    #[must_use]
    pub fn user(&self, code: i32) -> Option<User> {
        self.inner.core.lock().users.get(code).cloned()
    }

    /// Look up an online user by nick, ignoring case.
    #[must_use]
    pub fn user_by_nick(&self, nick: &str) -> Option<User> {
        self.inner.core.lock().users.by_nick(nick).cloned()
    }

    /// Logged on and the network is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let core = self.inner.core.lock();
        self.inner.is_connected(&core)
    }

    /// LOGON sent and no logoff since.
    #[must_use]
    pub fn is_logged_on(&self) -> bool {
        self.inner.core.lock().state.logged_on
    }

    /// The settle delay after logon has passed.
    #[must_use]
    pub fn is_logon_completed(&self) -> bool {
        self.inner.core.lock().state.logon_completed
    }

    /// The local user is typing.
    #[must_use]
    pub fn is_wrote(&self) -> bool {
        self.inner.core.lock().state.wrote
    }

    /// Where the client is in its connection lifecycle.
    #[must_use]
    pub fn connection_phase(&self) -> ConnectionPhase {
        self.inner.core.lock().state.phase
    }

    /// File offers nobody has answered yet.
    #[must_use]
    pub fn waiting_offers(&self) -> Vec<WaitingOffer> {
        self.inner.core.lock().waiting.offers()
    }

    /// Accepted file transfers.
    #[must_use]
    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.core.lock().transfers.transfers()
    }

    /// Port the private chat socket listens on, if open.
    #[must_use]
    pub fn private_chat_port(&self) -> Option<u16> {
        self.inner.service.private_chat_port()
    }
}

fn topic_payload(topic: &Topic) -> TopicPayload {
    TopicPayload {
        timestamp: topic.timestamp,
        nick: topic.nick.clone(),
        text: topic.text.clone(),
    }
}

fn abort_body(user_code: i32, hash: i32, file_name: &str) -> MessageBody {
    MessageBody::SendFileAbort(FileAbort {
        to_code: user_code,
        hash,
        file_name: file_name.to_string(),
    })
}

impl<N: Network> ControllerInner<N> {
    fn emit(&self, event: ChatEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("no one is listening for chat events");
        }
    }

    fn system(&self, text: impl Into<String>) {
        self.emit(ChatEvent::SystemMessage(text.into()));
    }

    fn is_connected(&self, core: &ChatCore) -> bool {
        core.state.logged_on && self.service.is_network_up()
    }

    fn check_length(&self, text: &str) -> Result<(), Rejection> {
        if text.len() > self.config.max_message_bytes {
            Err(Rejection::TooLong {
                max: self.config.max_message_bytes,
            })
        } else {
            Ok(())
        }
    }

    /// Send a group message from the local user.
    fn send(&self, core: &ChatCore, body: MessageBody) -> Result<(), ControllerError> {
        self.send_as(core.users.me().nick(), body)
    }

    fn send_as(&self, nick: &str, body: MessageBody) -> Result<(), ControllerError> {
        let line = codec::encode(&GroupMessage::new(self.me_code, nick, body));
        self.service
            .send_to_all(&line)
            .map_err(ControllerError::SendFailed)
    }

    /// Send without a caller to report failure to.
    fn announce(&self, core: &ChatCore, body: MessageBody) {
        let kind = body.kind();
        if let Err(e) = self.send(core, body) {
            tracing::debug!(%kind, error = %e, "announcement not sent");
        }
    }

    fn client_message(&self, core: &ChatCore) -> MessageBody {
        let since_logon = core
            .logged_on_at
            .map_or(0, |at| i64::try_from(at.elapsed().as_millis()).unwrap_or(i64::MAX));
        MessageBody::Client(ClientInfo {
            client: self.config.client_name.clone(),
            since_logon_ms: since_logon,
            operating_system: core.users.me().operating_system.clone(),
            private_chat_port: Some(self.service.private_chat_port().unwrap_or(0)),
        })
    }

    fn send_log_on(&self, core: &mut ChatCore) {
        core.logged_on_at = Some(Instant::now());
        core.users.me_mut().logon_time = now_ms();
        self.announce(core, MessageBody::LogOn);
        self.announce(core, self.client_message(core));
        self.announce(core, MessageBody::Expose);
        self.announce(core, MessageBody::GetTopic);
        core.state.logged_on = true;
        core.state.phase = ConnectionPhase::Connecting;
    }

    fn schedule_settle(&self) {
        let task = tokio::spawn(timers::settle(
            Weak::clone(&self.this),
            self.config.logon_delay,
        ));
        if let Some(previous) = self.tasks.lock().settle.replace(task) {
            previous.abort();
        }
    }

    fn cancel_settle(&self) {
        if let Some(task) = self.tasks.lock().settle.take() {
            task.abort();
        }
    }

    /// The settle delay expired.
    fn logon_settled(&self) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.service.is_network_up() {
            tracing::debug!("network not up after the settle delay, logon not completed");
            return;
        }
        core.state.logon_completed = true;
        let phase_changed = core.state.phase == ConnectionPhase::Connecting;
        if phase_changed {
            core.state.phase = ConnectionPhase::Online;
        }
        drop(core);
        tracing::info!("logon completed");
        if phase_changed {
            self.emit(ChatEvent::ConnectionStatus(ConnectionPhase::Online));
        }
    }

    fn log_off(&self, remove_users: bool) {
        self.cancel_settle();
        let was_logged_on = {
            let mut core = self.core.lock();
            let was_logged_on = core.state.logged_on;
            if was_logged_on {
                self.announce(&core, MessageBody::LogOff);
            }
            core.state.reset();
            core.unidentified.clear();
            core.logged_on_at = None;
            was_logged_on
        };

        let was_up = self.service.is_network_up();
        self.service.disconnect();
        if was_logged_on && !was_up {
            self.system("You logged off");
        }

        let mut core = self.core.lock();
        core.topic.reset();
        for code in core.users.peer_codes() {
            if remove_users {
                self.remove_user(&mut core, code, "You logged off");
            } else {
                Self::release_user(&mut core, code);
            }
        }
        core.users.me_mut().reset();
        drop(core);

        self.emit(ChatEvent::UserListChanged);
        self.emit(ChatEvent::ShowTopic(Topic::default()));
        self.emit(ChatEvent::ConnectionStatus(ConnectionPhase::Offline));
        tracing::info!(remove_users, "logged off");
    }

    fn release_user(core: &mut ChatCore, code: i32) {
        let cancelled = core.transfers.cancel_user(code);
        let withdrawn = core.waiting.remove_user(code);
        if !cancelled.is_empty() || !withdrawn.is_empty() {
            tracing::debug!(
                code,
                transfers = cancelled.len(),
                offers = withdrawn.len(),
                "released file transfers"
            );
        }
    }

    /// Forget a peer: cancel its transfers and tell its private chat.
    fn remove_user(&self, core: &mut ChatCore, code: i32, private_message: &str) -> Option<User> {
        let mut user = core.users.remove(code)?;
        Self::release_user(core, code);
        core.unidentified.remove(&code);
        if let Some(chat) = user.private_chat.as_mut() {
            chat.logged_off = true;
            self.emit(ChatEvent::PrivateSystemMessage {
                user_code: code,
                text: private_message.to_string(),
            });
        }
        self.emit(ChatEvent::UserListChanged);
        Some(user)
    }

    /// One round of the idle timer.
    fn idle_tick(&self) {
        let now = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if !self.is_connected(core) {
            return;
        }
        self.announce(core, MessageBody::Idle);

        let timed_out = core.users.timed_out_users(now, self.config.user_timeout);
        for code in &timed_out {
            if let Some(user) = self.remove_user(core, *code, "The user timed out") {
                tracing::info!(code, nick = user.nick(), "user timed out");
                self.system(format!("{} timed out", user.nick()));
            }
        }
        if !timed_out.is_empty() {
            self.announce(core, MessageBody::Expose);
        }
    }
}

impl<N: Network> NetworkConnectionListener for ControllerInner<N> {
    fn before_network_came_up(&self) {
        tracing::debug!("network coming up");
    }

    fn network_came_up(&self, silent: bool) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            self.send_log_on(&mut core);
            drop(core);
            self.schedule_settle();
            self.emit(ChatEvent::ConnectionStatus(ConnectionPhase::Connecting));
            return;
        }

        let topic = core.topic.clone();
        let away_message = core.users.me().away_message.clone();
        self.announce(&core, MessageBody::Topic(topic_payload(&topic)));
        self.announce(&core, MessageBody::Exposing { away_message });
        self.announce(&core, MessageBody::GetTopic);
        self.announce(&core, MessageBody::Expose);
        self.announce(&core, self.client_message(&core));
        self.announce(&core, MessageBody::Idle);
        let completed = core.state.logon_completed;
        let phase = if completed {
            ConnectionPhase::Online
        } else {
            ConnectionPhase::Connecting
        };
        core.state.phase = phase;
        drop(core);

        if !completed {
            self.schedule_settle();
        }
        self.emit(ChatEvent::ShowTopic(topic));
        if !silent {
            self.system("You are connected to the network again");
        }
        self.emit(ChatEvent::ConnectionStatus(phase));
    }

    fn network_went_down(&self, silent: bool) {
        let mut core = self.core.lock();
        let topic = core.topic.clone();
        if core.state.logged_on {
            core.state.phase = ConnectionPhase::Suspended;
            drop(core);
            if !silent {
                self.system("You lost contact with the network");
            }
            self.emit(ChatEvent::ConnectionStatus(ConnectionPhase::Suspended));
        } else {
            drop(core);
            self.system("You logged off");
        }
        self.emit(ChatEvent::ShowTopic(topic));
    }
}

impl<N: Network> Drop for ControllerInner<N> {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}
