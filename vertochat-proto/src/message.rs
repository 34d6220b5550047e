//! Wire message types for the `VertoChat` LAN protocol.
//!
//! Every datagram is a single line of text. Group messages travel over the
//! multicast group and look like `<code>!<TYPE>#<nick>:<payload>`; private
//! messages travel over unicast and carry the target code in the header
//! slot. See [`crate::codec`] for the exact grammar of each payload.

use std::fmt;
use std::str::FromStr;

use crate::codec::CodecError;

/// Maximum size of a single datagram on the wire, in bytes.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Maximum size of user-supplied text (chat line, topic, away message,
/// file name), in bytes. Enforced by the sender, never by the codec.
pub const MAX_MESSAGE_BYTES: usize = 450;

/// Message type token, the part between `!` and `#` in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A peer joined the chat.
    LogOn,
    /// A peer left the chat.
    LogOff,
    /// Request that every peer announce itself.
    Expose,
    /// Answer to [`MessageKind::Expose`].
    Exposing,
    /// Request for the current topic.
    GetTopic,
    /// Topic announcement.
    Topic,
    /// A peer went away.
    Away,
    /// A peer came back from away.
    Back,
    /// Chat line to everyone.
    Msg,
    /// A peer started typing.
    Writing,
    /// A peer stopped typing.
    StoppedWriting,
    /// A peer changed nick (the new nick is in the header).
    Nick,
    /// Somebody is using a nick that is already taken.
    NickCrash,
    /// Client software details.
    Client,
    /// Periodic liveness heartbeat.
    Idle,
    /// File transfer offer.
    SendFile,
    /// File transfer offer accepted.
    SendFileAccept,
    /// File transfer offer aborted or rejected.
    SendFileAbort,
    /// Private message over unicast.
    PrivMsg,
}

impl MessageKind {
    /// All message kinds, in protocol order.
    pub const ALL: [Self; 19] = [
        Self::LogOn,
        Self::LogOff,
        Self::Expose,
        Self::Exposing,
        Self::GetTopic,
        Self::Topic,
        Self::Away,
        Self::Back,
        Self::Msg,
        Self::Writing,
        Self::StoppedWriting,
        Self::Nick,
        Self::NickCrash,
        Self::Client,
        Self::Idle,
        Self::SendFile,
        Self::SendFileAccept,
        Self::SendFileAbort,
        Self::PrivMsg,
    ];

    /// The literal token used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LogOn => "LOGON",
            Self::LogOff => "LOGOFF",
            Self::Expose => "EXPOSE",
            Self::Exposing => "EXPOSING",
            Self::GetTopic => "GETTOPIC",
            Self::Topic => "TOPIC",
            Self::Away => "AWAY",
            Self::Back => "BACK",
            Self::Msg => "MSG",
            Self::Writing => "WRITING",
            Self::StoppedWriting => "STOPPEDWRITING",
            Self::Nick => "NICK",
            Self::NickCrash => "NICKCRASH",
            Self::Client => "CLIENT",
            Self::Idle => "IDLE",
            Self::SendFile => "SENDFILE",
            Self::SendFileAccept => "SENDFILEACCEPT",
            Self::SendFileAbort => "SENDFILEABORT",
            Self::PrivMsg => "PRIVMSG",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CodecError::UnknownType(s.to_string()))
    }
}

/// A message sent to the whole multicast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// Code of the sending user.
    pub code: i32,
    /// Nick of the sending user (the new nick for [`MessageBody::Nick`]).
    pub nick: String,
    /// Type-specific payload.
    pub body: MessageBody,
}

impl GroupMessage {
    /// Creates a group message from its parts.
    pub fn new(code: i32, nick: impl Into<String>, body: MessageBody) -> Self {
        Self {
            code,
            nick: nick.into(),
            body,
        }
    }

    /// The wire type of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Typed payload of a [`GroupMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// `LOGON`, empty payload.
    LogOn,
    /// `LOGOFF`, empty payload.
    LogOff,
    /// `EXPOSE`, empty payload.
    Expose,
    /// `EXPOSING`, carrying the away message (empty when present).
    Exposing {
        /// Current away message of the sender.
        away_message: String,
    },
    /// `GETTOPIC`, empty payload.
    GetTopic,
    /// `TOPIC`, `(<timestamp>)<nick>:<text>`.
    Topic(TopicPayload),
    /// `AWAY`, carrying the away message.
    Away {
        /// Why the sender went away.
        message: String,
    },
    /// `BACK`, empty payload.
    Back,
    /// `MSG`, `[<rgb>]<text>`.
    Chat {
        /// Packed RGB color of the text.
        color: i32,
        /// The chat line.
        text: String,
    },
    /// `WRITING`, empty payload.
    Writing,
    /// `STOPPEDWRITING`, empty payload.
    StoppedWriting,
    /// `NICK`, empty payload.
    Nick,
    /// `NICKCRASH`, carrying the contested nick.
    NickCrash {
        /// The nick that is in use by more than one peer.
        nick: String,
    },
    /// `CLIENT`, `(<client>)[<ms>]{<os>}<port>` with the port in angle brackets.
    Client(ClientInfo),
    /// `IDLE`, empty payload.
    Idle,
    /// `SENDFILE`, `(<to>)[<size>]{<hash>}<name>`.
    SendFile(FileOffer),
    /// `SENDFILEACCEPT`, `(<to>)[<port>]{<hash>}<name>`.
    SendFileAccept(FileAccept),
    /// `SENDFILEABORT`, `(<to>){<hash>}<name>`.
    SendFileAbort(FileAbort),
}

impl MessageBody {
    /// The wire type carrying this payload.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::LogOn => MessageKind::LogOn,
            Self::LogOff => MessageKind::LogOff,
            Self::Expose => MessageKind::Expose,
            Self::Exposing { .. } => MessageKind::Exposing,
            Self::GetTopic => MessageKind::GetTopic,
            Self::Topic(_) => MessageKind::Topic,
            Self::Away { .. } => MessageKind::Away,
            Self::Back => MessageKind::Back,
            Self::Chat { .. } => MessageKind::Msg,
            Self::Writing => MessageKind::Writing,
            Self::StoppedWriting => MessageKind::StoppedWriting,
            Self::Nick => MessageKind::Nick,
            Self::NickCrash { .. } => MessageKind::NickCrash,
            Self::Client(_) => MessageKind::Client,
            Self::Idle => MessageKind::Idle,
            Self::SendFile(_) => MessageKind::SendFile,
            Self::SendFileAccept(_) => MessageKind::SendFileAccept,
            Self::SendFileAbort(_) => MessageKind::SendFileAbort,
        }
    }
}

/// Topic as carried by a `TOPIC` message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicPayload {
    /// Milliseconds since the Unix epoch when the topic was set.
    pub timestamp: i64,
    /// Nick of the user who set the topic.
    pub nick: String,
    /// The topic text. Empty means no topic.
    pub text: String,
}

/// Client software details announced after logon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client name and version, e.g. `VertoChat v1.3.0 Swing`.
    pub client: String,
    /// Milliseconds since the sender logged on.
    pub since_logon_ms: i64,
    /// Operating system name.
    pub operating_system: String,
    /// Unicast port for private chat, `Some(0)` when disabled.
    ///
    /// `None` when the field was not a number. Older and foreign clients
    /// are known to send garbage here, so this is not a decode failure.
    pub private_chat_port: Option<u16>,
}

/// A file offered to a single user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// Code of the user the file is offered to.
    pub to_code: i32,
    /// File size in bytes.
    pub size: u64,
    /// Identifier of this offer, chosen by the sender.
    pub hash: i32,
    /// File name without directories.
    pub file_name: String,
}

/// Acceptance of a [`FileOffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAccept {
    /// Code of the user who made the offer.
    pub to_code: i32,
    /// TCP port the receiver listens on for the file.
    pub port: u16,
    /// Identifier of the offer being accepted.
    pub hash: i32,
    /// File name from the offer.
    pub file_name: String,
}

/// Abort or rejection of a file transfer, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAbort {
    /// Code of the other party of the transfer.
    pub to_code: i32,
    /// Identifier of the offer being aborted.
    pub hash: i32,
    /// File name from the offer.
    pub file_name: String,
}

/// A private message sent over unicast to a single user.
///
/// The target code appears twice on the wire: once in the header where a
/// group message carries the nick, and once inside the payload. The payload
/// copy in [`to_code`](Self::to_code) is authoritative; the header copy is
/// kept verbatim in [`header_target`](Self::header_target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    /// Code of the sending user.
    pub from_code: i32,
    /// Raw header slot (normally the target code as text).
    pub header_target: String,
    /// Code of the receiving user.
    pub to_code: i32,
    /// Packed RGB color of the text.
    pub color: i32,
    /// The message text.
    pub text: String,
}

impl PrivateMessage {
    /// Creates a private message with both target slots filled in.
    pub fn new(from_code: i32, to_code: i32, color: i32, text: impl Into<String>) -> Self {
        Self {
            from_code,
            header_target: to_code.to_string(),
            to_code,
            color,
            text: text.into(),
        }
    }

    /// Whether the header slot disagrees with the payload target code.
    #[must_use]
    pub fn has_target_mismatch(&self) -> bool {
        self.header_target.parse::<i32>().ok() != Some(self.to_code)
    }
}
