//! Text encoding and decoding for the `VertoChat` wire protocol.
//!
//! Group grammar: `<code>!<TYPE>#<nick>:<payload>`.
//! Private grammar: `<code>!PRIVMSG#<toCode>:(<toCode>)[<rgb>]<text>`.
//!
//! Decoding walks the line once, checking that each delimiter is where the
//! grammar expects it before slicing, so no input can make it panic. Text
//! fields are never escaped; the sender is responsible for keeping them
//! free of characters that would confuse older clients.

use std::fmt;
use std::str::FromStr;

use crate::message::{
    ClientInfo, FileAbort, FileAccept, FileOffer, GroupMessage, MessageBody, MessageKind,
    PrivateMessage, TopicPayload,
};

/// Error type for decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A delimiter is missing or a numeric field is not a number.
    #[error("malformed message: {reason}")]
    Malformed {
        /// What was wrong with the line.
        reason: String,
    },
    /// The header is well formed but the type token is not known.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// A known type arrived on a channel that does not carry it.
    #[error("{0} is not valid on this channel")]
    UnexpectedKind(MessageKind),
}

impl CodecError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Encodes a group message into its wire line.
#[must_use]
pub fn encode(message: &GroupMessage) -> String {
    message.to_string()
}

/// Encodes a private message into its wire line.
#[must_use]
pub fn encode_private(message: &PrivateMessage) -> String {
    message.to_string()
}

/// Decodes a line received on the multicast group.
///
/// # Errors
///
/// Returns `CodecError::Malformed` when a delimiter is missing or a numeric
/// field cannot be parsed, `CodecError::UnknownType` for an unrecognized
/// type token, and `CodecError::UnexpectedKind` for `PRIVMSG`.
pub fn decode(raw: &str) -> Result<GroupMessage, CodecError> {
    let header = Header::parse(raw)?;
    if header.kind == MessageKind::PrivMsg {
        return Err(CodecError::UnexpectedKind(header.kind));
    }
    let body = decode_body(header.kind, header.payload)?;
    Ok(GroupMessage {
        code: header.code,
        nick: header.nick.to_string(),
        body,
    })
}

/// Decodes a line received on the private unicast socket.
///
/// # Errors
///
/// Returns `CodecError::Malformed` when a delimiter is missing or a numeric
/// field cannot be parsed, `CodecError::UnknownType` for an unrecognized
/// type token, and `CodecError::UnexpectedKind` for any type other than
/// `PRIVMSG`.
pub fn decode_private(raw: &str) -> Result<PrivateMessage, CodecError> {
    let header = Header::parse(raw)?;
    if header.kind != MessageKind::PrivMsg {
        return Err(CodecError::UnexpectedKind(header.kind));
    }

    let mut cursor = Cursor::new(header.payload);
    cursor.open('(', "target code")?;
    let to_code = parse_number(cursor.take_until(')', "target code")?, "target code")?;
    cursor.open('[', "color")?;
    let color = parse_number(cursor.take_until(']', "color")?, "color")?;

    Ok(PrivateMessage {
        from_code: header.code,
        header_target: header.nick.to_string(),
        to_code,
        color,
        text: cursor.rest().to_string(),
    })
}

/// The fixed part of every line.
struct Header<'a> {
    code: i32,
    kind: MessageKind,
    nick: &'a str,
    payload: &'a str,
}

impl<'a> Header<'a> {
    fn parse(raw: &'a str) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(raw);
        let code = parse_number(cursor.take_until('!', "user code")?, "user code")?;
        let token = cursor.take_until('#', "message type")?;
        let nick = cursor.take_until(':', "nick")?;
        let kind = MessageKind::from_str(token)?;
        Ok(Self {
            code,
            kind,
            nick,
            payload: cursor.rest(),
        })
    }
}

fn decode_body(kind: MessageKind, payload: &str) -> Result<MessageBody, CodecError> {
    let body = match kind {
        MessageKind::LogOn => MessageBody::LogOn,
        MessageKind::LogOff => MessageBody::LogOff,
        MessageKind::Expose => MessageBody::Expose,
        MessageKind::Exposing => MessageBody::Exposing {
            away_message: payload.to_string(),
        },
        MessageKind::GetTopic => MessageBody::GetTopic,
        MessageKind::Topic => {
            let mut cursor = Cursor::new(payload);
            cursor.open('(', "topic timestamp")?;
            let timestamp =
                parse_number(cursor.take_until(')', "topic timestamp")?, "topic timestamp")?;
            let nick = cursor.take_until(':', "topic nick")?;
            MessageBody::Topic(TopicPayload {
                timestamp,
                nick: nick.to_string(),
                text: cursor.rest().to_string(),
            })
        }
        MessageKind::Away => MessageBody::Away {
            message: payload.to_string(),
        },
        MessageKind::Back => MessageBody::Back,
        MessageKind::Msg => {
            let mut cursor = Cursor::new(payload);
            cursor.open('[', "color")?;
            let color = parse_number(cursor.take_until(']', "color")?, "color")?;
            MessageBody::Chat {
                color,
                text: cursor.rest().to_string(),
            }
        }
        MessageKind::Writing => MessageBody::Writing,
        MessageKind::StoppedWriting => MessageBody::StoppedWriting,
        MessageKind::Nick => MessageBody::Nick,
        MessageKind::NickCrash => MessageBody::NickCrash {
            nick: payload.to_string(),
        },
        MessageKind::Client => MessageBody::Client(decode_client(payload)?),
        MessageKind::Idle => MessageBody::Idle,
        MessageKind::SendFile => {
            let mut cursor = Cursor::new(payload);
            let to_code = take_target(&mut cursor)?;
            cursor.open('[', "file size")?;
            let size = parse_number(cursor.take_until(']', "file size")?, "file size")?;
            let hash = take_hash(&mut cursor)?;
            MessageBody::SendFile(FileOffer {
                to_code,
                size,
                hash,
                file_name: cursor.rest().to_string(),
            })
        }
        MessageKind::SendFileAccept => {
            let mut cursor = Cursor::new(payload);
            let to_code = take_target(&mut cursor)?;
            cursor.open('[', "file port")?;
            let port = parse_number(cursor.take_until(']', "file port")?, "file port")?;
            let hash = take_hash(&mut cursor)?;
            MessageBody::SendFileAccept(FileAccept {
                to_code,
                port,
                hash,
                file_name: cursor.rest().to_string(),
            })
        }
        MessageKind::SendFileAbort => {
            let mut cursor = Cursor::new(payload);
            let to_code = take_target(&mut cursor)?;
            let hash = take_hash(&mut cursor)?;
            MessageBody::SendFileAbort(FileAbort {
                to_code,
                hash,
                file_name: cursor.rest().to_string(),
            })
        }
        MessageKind::PrivMsg => return Err(CodecError::UnexpectedKind(kind)),
    };
    Ok(body)
}

fn decode_client(payload: &str) -> Result<ClientInfo, CodecError> {
    let mut cursor = Cursor::new(payload);
    cursor.open('(', "client name")?;
    let client = cursor.take_until(')', "client name")?;
    cursor.open('[', "time since logon")?;
    let since_logon_ms = parse_number(
        cursor.take_until(']', "time since logon")?,
        "time since logon",
    )?;
    cursor.open('{', "operating system")?;
    let operating_system = cursor.take_until('}', "operating system")?;
    cursor.open('<', "private chat port")?;
    let port = cursor.take_until('>', "private chat port")?;

    Ok(ClientInfo {
        client: client.to_string(),
        since_logon_ms,
        operating_system: operating_system.to_string(),
        private_chat_port: port.parse().ok(),
    })
}

fn take_target(cursor: &mut Cursor<'_>) -> Result<i32, CodecError> {
    cursor.open('(', "target code")?;
    parse_number(cursor.take_until(')', "target code")?, "target code")
}

fn take_hash(cursor: &mut Cursor<'_>) -> Result<i32, CodecError> {
    cursor.open('{', "file hash")?;
    parse_number(cursor.take_until('}', "file hash")?, "file hash")
}

fn parse_number<T: FromStr>(field: &str, name: &str) -> Result<T, CodecError> {
    field
        .parse()
        .map_err(|_| CodecError::malformed(format!("{name} is not a number: {field:?}")))
}

/// Single-pass reader over a line, consuming one delimited field at a time.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    const fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    /// Consumes `delim`, which must be the next character.
    fn open(&mut self, delim: char, field: &str) -> Result<(), CodecError> {
        self.rest = self.rest.strip_prefix(delim).ok_or_else(|| {
            CodecError::malformed(format!("expected '{delim}' before {field}"))
        })?;
        Ok(())
    }

    /// Returns everything up to the first `delim` and consumes the delimiter.
    fn take_until(&mut self, delim: char, field: &str) -> Result<&'a str, CodecError> {
        let (field_text, rest) = self.rest.split_once(delim).ok_or_else(|| {
            CodecError::malformed(format!("missing '{delim}' after {field}"))
        })?;
        self.rest = rest;
        Ok(field_text)
    }

    const fn rest(&self) -> &'a str {
        self.rest
    }
}

impl fmt::Display for GroupMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}#{}:", self.code, self.kind(), self.nick)?;
        match &self.body {
            MessageBody::LogOn
            | MessageBody::LogOff
            | MessageBody::Expose
            | MessageBody::GetTopic
            | MessageBody::Back
            | MessageBody::Writing
            | MessageBody::StoppedWriting
            | MessageBody::Nick
            | MessageBody::Idle => Ok(()),
            MessageBody::Exposing { away_message } => f.write_str(away_message),
            MessageBody::Away { message } => f.write_str(message),
            MessageBody::NickCrash { nick } => f.write_str(nick),
            MessageBody::Topic(topic) => {
                write!(f, "({}){}:{}", topic.timestamp, topic.nick, topic.text)
            }
            MessageBody::Chat { color, text } => write!(f, "[{color}]{text}"),
            MessageBody::Client(info) => {
                write!(
                    f,
                    "({})[{}]{{{}}}<",
                    info.client, info.since_logon_ms, info.operating_system
                )?;
                if let Some(port) = info.private_chat_port {
                    write!(f, "{port}")?;
                }
                f.write_str(">")
            }
            MessageBody::SendFile(offer) => write!(
                f,
                "({})[{}]{{{}}}{}",
                offer.to_code, offer.size, offer.hash, offer.file_name
            ),
            MessageBody::SendFileAccept(accept) => write!(
                f,
                "({})[{}]{{{}}}{}",
                accept.to_code, accept.port, accept.hash, accept.file_name
            ),
            MessageBody::SendFileAbort(abort) => write!(
                f,
                "({}){{{}}}{}",
                abort.to_code, abort.hash, abort.file_name
            ),
        }
    }
}

impl fmt::Display for PrivateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}!{}#{}:({})[{}]{}",
            self.from_code,
            MessageKind::PrivMsg,
            self.header_target,
            self.to_code,
            self.color,
            self.text
        )
    }
}
