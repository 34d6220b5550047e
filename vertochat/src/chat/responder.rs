//! Inbound message handling: how the controller reacts to what peers say.

use std::net::Ipv4Addr;
use std::time::Instant;

use vertochat_proto::message::{ClientInfo, FileAbort, FileAccept, FileOffer, MessageBody, TopicPayload};

use super::parser::{MessageResponder, Origin};
use super::transfers::{Direction, Transfer, WaitingOffer};
use super::users::{AddOutcome, NickChange, User, is_valid_nick};
use super::{ChatCore, ChatEvent, ControllerInner, Topic, abort_body, now_ms, topic_payload};
use crate::transport::Network;

impl<N: Network> ControllerInner<N> {
    /// Note that `code` is alive. Unknown users are asked to expose
    /// themselves, once, after logon has completed. Returns whether the
    /// user is known.
    fn identify(&self, core: &mut ChatCore, code: i32, ip: Ipv4Addr) -> bool {
        if core.users.touch(code, ip, Instant::now()) {
            return true;
        }
        if core.state.logon_completed && core.unidentified.insert(code) {
            tracing::debug!(code, ip = %ip, "unidentified user, asking for exposure");
            self.announce(core, MessageBody::Expose);
        }
        false
    }

    fn new_user(origin: &Origin) -> User {
        let mut user = User::new(origin.code, origin.nick.clone());
        user.ip = Some(origin.ip);
        user
    }

    /// Add a user. Returns the nick it got, or `None` if already known.
    /// With `answer_clash`, a newcomer asking for my nick gets NICKCRASH.
    fn add_user(&self, core: &mut ChatCore, user: User, answer_clash: bool) -> Option<String> {
        let code = user.code();
        core.unidentified.remove(&code);
        match core.users.add_or_update_user(user) {
            AddOutcome::AlreadyKnown => None,
            AddOutcome::Added => core.users.get(code).map(|u| u.nick().to_string()),
            AddOutcome::Renamed { requested, assigned } => {
                if answer_clash && requested.eq_ignore_ascii_case(core.users.me().nick()) {
                    tracing::info!(code, nick = requested, "peer uses my nick");
                    self.announce(core, MessageBody::NickCrash { nick: requested });
                }
                Some(assigned)
            }
        }
    }
}

impl<N: Network> MessageResponder for ControllerInner<N> {
    fn me_log_on(&self, ip: Ipv4Addr) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }
        core.users.me_mut().ip = Some(ip);
        let nick = core.users.me().nick().to_string();
        drop(core);
        self.system(format!("You logged on as {nick} from {ip}"));
    }

    fn user_log_on(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }
        let mut user = Self::new_user(origin);
        user.logon_time = now_ms();
        let Some(nick) = self.add_user(&mut core, user, true) else {
            return;
        };
        drop(core);
        tracing::info!(code = origin.code, nick, "user logged on");
        self.emit(ChatEvent::UserListChanged);
        self.system(format!("{nick} logged on from {}", origin.ip));
    }

    fn user_log_off(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }
        let Some(user) = self.remove_user(&mut core, origin.code, "The user logged off") else {
            return;
        };
        drop(core);
        tracing::info!(code = origin.code, nick = user.nick(), "user logged off");
        self.system(format!("{} logged off", user.nick()));
    }

    fn user_exposed(&self, origin: &Origin, away_message: &str) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }

        if !core.users.contains(origin.code) {
            let mut user = Self::new_user(origin);
            if !away_message.is_empty() {
                user.away = true;
                user.away_message = away_message.to_string();
            }
            let Some(nick) = self.add_user(&mut core, user, false) else {
                return;
            };
            let completed = core.state.logon_completed;
            drop(core);
            self.emit(ChatEvent::UserListChanged);
            if completed {
                self.system(format!("{nick} logged on from {}", origin.ip));
            }
            return;
        }

        self.identify(&mut core, origin.code, origin.ip);
        let away = !away_message.is_empty();
        let mut changed = core
            .users
            .get(origin.code)
            .is_some_and(|user| user.away != away || user.away_message != away_message);
        if changed {
            core.users.change_away(origin.code, away, away_message);
        }
        // Resync a nick we missed, unless someone else holds it now.
        if is_valid_nick(&origin.nick)
            && matches!(
                core.users.change_nick(origin.code, &origin.nick),
                NickChange::Changed { .. }
            )
        {
            changed = true;
        }
        drop(core);
        if changed {
            self.emit(ChatEvent::UserListChanged);
        }
    }

    fn expose_requested(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }
        self.identify(&mut core, origin.code, origin.ip);
        let away_message = core.users.me().away_message.clone();
        self.announce(&core, MessageBody::Exposing { away_message });
        self.announce(&core, self.client_message(&core));
    }

    fn topic_changed(&self, origin: &Origin, topic: &TopicPayload) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }
        self.identify(&mut core, origin.code, origin.ip);
        let update = Topic::new(topic.text.clone(), topic.nick.clone(), topic.timestamp);
        if !core.topic.change(&update) {
            return;
        }
        let completed = core.state.logon_completed;
        drop(core);

        tracing::debug!(code = origin.code, timestamp = update.timestamp, "topic changed");
        if !completed {
            if update.is_set() {
                self.system(format!("Topic is: {update}"));
            }
        } else if update.is_set() {
            self.system(format!("{} changed the topic to: {}", update.nick, update.text));
        } else {
            self.system(format!("{} removed the topic", origin.nick));
        }
        self.emit(ChatEvent::ShowTopic(update));
    }

    fn topic_requested(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }
        self.identify(&mut core, origin.code, origin.ip);
        if core.topic.is_set() {
            let payload = topic_payload(&core.topic);
            self.announce(&core, MessageBody::Topic(payload));
        }
    }

    fn away_changed(&self, origin: &Origin, message: &str) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        core.users.change_away(origin.code, true, message);
        let nick = core.users.get(origin.code).map(|u| u.nick().to_string()).unwrap_or_default();
        drop(core);
        self.emit(ChatEvent::UserListChanged);
        self.system(format!("{nick} went away: {message}"));
    }

    fn back_changed(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        core.users.change_away(origin.code, false, "");
        let nick = core.users.get(origin.code).map(|u| u.nick().to_string()).unwrap_or_default();
        drop(core);
        self.emit(ChatEvent::UserListChanged);
        self.system(format!("{nick} came back"));
    }

    fn chat_message(&self, origin: &Origin, color: i32, text: &str) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        let nick = core.users.get(origin.code).map(|u| u.nick().to_string()).unwrap_or_default();
        drop(core);
        self.emit(ChatEvent::ChatMessage {
            code: origin.code,
            nick,
            color,
            text: text.to_string(),
        });
    }

    fn writing_changed(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        if core.users.change_writing(origin.code, true) {
            drop(core);
            self.emit(ChatEvent::UserListChanged);
        }
    }

    fn stopped_writing_changed(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        if core.users.change_writing(origin.code, false) {
            drop(core);
            self.emit(ChatEvent::UserListChanged);
        }
    }

    fn nick_changed(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        if !is_valid_nick(&origin.nick) {
            tracing::debug!(code = origin.code, nick = origin.nick, "ignoring invalid nick");
            return;
        }
        match core.users.change_nick(origin.code, &origin.nick) {
            NickChange::Changed { old } => {
                drop(core);
                self.emit(ChatEvent::UserListChanged);
                self.system(format!("{old} changed nick to {}", origin.nick));
            }
            NickChange::InUse if origin.nick.eq_ignore_ascii_case(core.users.me().nick()) => {
                tracing::info!(code = origin.code, nick = origin.nick, "peer took my nick");
                self.announce(
                    &core,
                    MessageBody::NickCrash {
                        nick: origin.nick.clone(),
                    },
                );
            }
            NickChange::InUse | NickChange::Unchanged | NickChange::UnknownUser => {}
        }
    }

    fn nick_crash(&self, origin: &Origin, nick: &str) {
        let mut core = self.core.lock();
        if !core.state.logged_on {
            return;
        }
        self.identify(&mut core, origin.code, origin.ip);
        if !nick.eq_ignore_ascii_case(core.users.me().nick()) {
            return;
        }

        let fallback = self.me_code.to_string();
        if let Err(e) = self.send_as(&fallback, MessageBody::Nick) {
            tracing::warn!(error = %e, "failed to announce nick reset");
        }
        core.users.change_nick(self.me_code, &fallback);
        drop(core);
        tracing::warn!(nick, "nick crash");
        self.emit(ChatEvent::UserListChanged);
        self.system(format!("Nick crash, resetting nick to {fallback}"));
    }

    fn client_info(&self, origin: &Origin, info: &ClientInfo) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        if let Some(user) = core.users.get_mut(origin.code) {
            user.client.clone_from(&info.client);
            user.operating_system.clone_from(&info.operating_system);
            user.private_chat_port = info.private_chat_port.unwrap_or(0);
            user.logon_time = now_ms().saturating_sub(info.since_logon_ms);
        }
        drop(core);
        self.emit(ChatEvent::UserListChanged);
    }

    fn idle(&self, origin: &Origin) {
        let mut core = self.core.lock();
        if core.state.logged_on {
            self.identify(&mut core, origin.code, origin.ip);
        }
    }

    fn file_transfer_request(&self, origin: &Origin, offer: &FileOffer) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        let nick = core.users.get(origin.code).map(|u| u.nick().to_string()).unwrap_or_default();

        if core.users.me().away {
            self.announce(&core, abort_body(origin.code, offer.hash, &offer.file_name));
            drop(core);
            self.system(format!(
                "{nick} tried to send you the file {}, but you are away",
                offer.file_name
            ));
            return;
        }

        core.waiting.add(WaitingOffer {
            user_code: origin.code,
            hash: offer.hash,
            file_name: offer.file_name.clone(),
            size: offer.size,
            direction: Direction::Incoming,
        });
        drop(core);
        self.emit(ChatEvent::FileOffered {
            user_code: origin.code,
            nick: nick.clone(),
            hash: offer.hash,
            file_name: offer.file_name.clone(),
            size: offer.size,
        });
        self.system(format!(
            "{nick} is trying to send you the file {} ({} bytes)",
            offer.file_name, offer.size
        ));
    }

    fn file_transfer_accept(&self, origin: &Origin, accept: &FileAccept) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        let Some(offer) = core.waiting.take(Direction::Outgoing, origin.code, accept.hash) else {
            tracing::debug!(code = origin.code, hash = accept.hash, "accept for unknown offer");
            return;
        };
        core.transfers.start(Transfer::from_offer(offer, accept.port));
        let nick = core.users.get(origin.code).map(|u| u.nick().to_string()).unwrap_or_default();
        drop(core);
        self.emit(ChatEvent::FileAccepted {
            user_code: origin.code,
            hash: accept.hash,
            file_name: accept.file_name.clone(),
            port: accept.port,
        });
        self.system(format!("{nick} accepted the file {}", accept.file_name));
    }

    fn file_transfer_abort(&self, origin: &Origin, abort: &FileAbort) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, origin.code, origin.ip) {
            return;
        }
        let mut found = false;
        for direction in [Direction::Incoming, Direction::Outgoing] {
            found |= core.waiting.take(direction, origin.code, abort.hash).is_some();
            found |= core.transfers.cancel(direction, origin.code, abort.hash).is_some();
        }
        if !found {
            tracing::debug!(code = origin.code, hash = abort.hash, "abort for unknown transfer");
            return;
        }
        let nick = core.users.get(origin.code).map(|u| u.nick().to_string()).unwrap_or_default();
        drop(core);
        self.emit(ChatEvent::FileAborted {
            user_code: origin.code,
            hash: abort.hash,
            file_name: abort.file_name.clone(),
        });
        self.system(format!("{nick} aborted the transfer of {}", abort.file_name));
    }

    fn private_message(&self, code: i32, ip: Ipv4Addr, color: i32, text: &str) {
        let mut core = self.core.lock();
        if !core.state.logged_on || !self.identify(&mut core, code, ip) {
            return;
        }
        core.users.change_new_message(code, true);
        let Some(user) = core.users.get_mut(code) else {
            return;
        };
        if let Some(chat) = user.private_chat.as_mut() {
            chat.logged_off = false;
        }
        let nick = user.nick().to_string();
        drop(core);
        self.emit(ChatEvent::PrivateMessage {
            user_code: code,
            nick,
            color,
            text: text.to_string(),
            outgoing: false,
        });
    }
}
