//! Turns received datagrams into [`MessageResponder`] calls.
//!
//! [`MessageParser`] handles the multicast group and
//! [`PrivateMessageParser`] the private unicast port. Both decode, drop
//! the local user's own echo, and make exactly one responder call per
//! message. Decode failures are logged and discarded.

use std::net::Ipv4Addr;
use std::sync::Weak;

use vertochat_proto::codec::{self, CodecError};
use vertochat_proto::message::{
    ClientInfo, FileAbort, FileAccept, FileOffer, GroupMessage, MessageBody, TopicPayload,
};

use crate::transport::ReceiverListener;

/// Who sent a group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Sender's user code.
    pub code: i32,
    /// Nick in the message header. For `NICK` this is the new nick.
    pub nick: String,
    /// Source address of the datagram.
    pub ip: Ipv4Addr,
}

/// Receives one call per decoded message.
pub trait MessageResponder: Send + Sync + 'static {
    /// The local user's own `LOGON` came back from the group.
    fn me_log_on(&self, ip: Ipv4Addr);
    /// `LOGON`
    fn user_log_on(&self, origin: &Origin);
    /// `LOGOFF`
    fn user_log_off(&self, origin: &Origin);
    /// `EXPOSING`
    fn user_exposed(&self, origin: &Origin, away_message: &str);
    /// `EXPOSE`
    fn expose_requested(&self, origin: &Origin);
    /// `TOPIC`
    fn topic_changed(&self, origin: &Origin, topic: &TopicPayload);
    /// `GETTOPIC`
    fn topic_requested(&self, origin: &Origin);
    /// `AWAY`
    fn away_changed(&self, origin: &Origin, message: &str);
    /// `BACK`
    fn back_changed(&self, origin: &Origin);
    /// `MSG`
    fn chat_message(&self, origin: &Origin, color: i32, text: &str);
    /// `WRITING`
    fn writing_changed(&self, origin: &Origin);
    /// `STOPPEDWRITING`
    fn stopped_writing_changed(&self, origin: &Origin);
    /// `NICK`
    fn nick_changed(&self, origin: &Origin);
    /// `NICKCRASH`
    fn nick_crash(&self, origin: &Origin, nick: &str);
    /// `CLIENT`
    fn client_info(&self, origin: &Origin, info: &ClientInfo);
    /// `IDLE`
    fn idle(&self, origin: &Origin);
    /// `SENDFILE` addressed to the local user.
    fn file_transfer_request(&self, origin: &Origin, offer: &FileOffer);
    /// `SENDFILEACCEPT` addressed to the local user.
    fn file_transfer_accept(&self, origin: &Origin, accept: &FileAccept);
    /// `SENDFILEABORT` addressed to the local user.
    fn file_transfer_abort(&self, origin: &Origin, abort: &FileAbort);
    /// `PRIVMSG` addressed to the local user.
    fn private_message(&self, code: i32, ip: Ipv4Addr, color: i32, text: &str);
}

fn log_decode_error(error: &CodecError, raw: &str, ip: Ipv4Addr) {
    match error {
        CodecError::Malformed { .. } => {
            tracing::error!(error = %error, message = raw, ip = %ip, "discarding malformed message");
        }
        CodecError::UnknownType(_) | CodecError::UnexpectedKind(_) => {
            tracing::debug!(error = %error, message = raw, ip = %ip, "ignoring message");
        }
    }
}

/// Parses group messages.
pub struct MessageParser {
    me_code: i32,
    responder: Weak<dyn MessageResponder>,
}

impl MessageParser {
    /// A parser for the local user `me_code`, dispatching to `responder`.
    pub fn new(me_code: i32, responder: Weak<dyn MessageResponder>) -> Self {
        Self { me_code, responder }
    }

    fn dispatch(&self, responder: &dyn MessageResponder, message: GroupMessage, ip: Ipv4Addr) {
        let GroupMessage { code, nick, body } = message;
        if code == self.me_code {
            if body == MessageBody::LogOn {
                responder.me_log_on(ip);
            }
            return;
        }

        let origin = Origin { code, nick, ip };
        let for_me = |to_code: i32| {
            let addressed = to_code == self.me_code;
            if !addressed {
                tracing::trace!(to_code, "file message for another user");
            }
            addressed
        };

        match body {
            MessageBody::LogOn => responder.user_log_on(&origin),
            MessageBody::LogOff => responder.user_log_off(&origin),
            MessageBody::Expose => responder.expose_requested(&origin),
            MessageBody::Exposing { away_message } => {
                responder.user_exposed(&origin, &away_message);
            }
            MessageBody::GetTopic => responder.topic_requested(&origin),
            MessageBody::Topic(topic) => responder.topic_changed(&origin, &topic),
            MessageBody::Away { message } => responder.away_changed(&origin, &message),
            MessageBody::Back => responder.back_changed(&origin),
            MessageBody::Chat { color, text } => responder.chat_message(&origin, color, &text),
            MessageBody::Writing => responder.writing_changed(&origin),
            MessageBody::StoppedWriting => responder.stopped_writing_changed(&origin),
            MessageBody::Nick => responder.nick_changed(&origin),
            MessageBody::NickCrash { nick } => responder.nick_crash(&origin, &nick),
            MessageBody::Client(info) => {
                if info.private_chat_port.is_none() {
                    tracing::warn!(code, ip = %ip, "client info without a valid private chat port");
                }
                responder.client_info(&origin, &info);
            }
            MessageBody::Idle => responder.idle(&origin),
            MessageBody::SendFile(offer) => {
                if for_me(offer.to_code) {
                    responder.file_transfer_request(&origin, &offer);
                }
            }
            MessageBody::SendFileAccept(accept) => {
                if for_me(accept.to_code) {
                    responder.file_transfer_accept(&origin, &accept);
                }
            }
            MessageBody::SendFileAbort(abort) => {
                if for_me(abort.to_code) {
                    responder.file_transfer_abort(&origin, &abort);
                }
            }
        }
    }
}

impl ReceiverListener for MessageParser {
    fn message_arrived(&self, message: &str, ip: Ipv4Addr) {
        let Some(responder) = self.responder.upgrade() else {
            return;
        };
        match codec::decode(message) {
            Ok(decoded) => self.dispatch(responder.as_ref(), decoded, ip),
            Err(e) => log_decode_error(&e, message, ip),
        }
    }
}

/// Parses private messages.
pub struct PrivateMessageParser {
    me_code: i32,
    responder: Weak<dyn MessageResponder>,
}

impl PrivateMessageParser {
    /// A parser for the local user `me_code`, dispatching to `responder`.
    pub fn new(me_code: i32, responder: Weak<dyn MessageResponder>) -> Self {
        Self { me_code, responder }
    }
}

impl ReceiverListener for PrivateMessageParser {
    fn message_arrived(&self, message: &str, ip: Ipv4Addr) {
        let Some(responder) = self.responder.upgrade() else {
            return;
        };
        let decoded = match codec::decode_private(message) {
            Ok(decoded) => decoded,
            Err(e) => {
                log_decode_error(&e, message, ip);
                return;
            }
        };
        if decoded.from_code == self.me_code {
            return;
        }
        if decoded.has_target_mismatch() {
            tracing::debug!(
                header = decoded.header_target,
                target = decoded.to_code,
                "private message targets differ, using the inner one"
            );
        }
        if decoded.to_code != self.me_code {
            tracing::debug!(to_code = decoded.to_code, ip = %ip, "private message for another user");
            return;
        }
        responder.private_message(decoded.from_code, ip, decoded.color, &decoded.text);
    }
}
