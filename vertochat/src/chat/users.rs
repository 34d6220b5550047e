//! The registry of known users.
//!
//! [`UserList`] keeps users in discovery order with a code index and a
//! case-insensitive nick index over online users. Identity fields (code,
//! nick, online flag, "is me") are private to this module so the indexes
//! cannot go stale; everything else on [`User`] is plain data.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Maximum nick length in characters.
pub const MAX_NICK_LEN: usize = 10;

/// Whether `nick` is acceptable: 1 to 10 letters, digits, `-`, `_` or `.`.
#[must_use]
pub fn is_valid_nick(nick: &str) -> bool {
    let len = nick.chars().count();
    (1..=MAX_NICK_LEN).contains(&len)
        && nick
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// State of an open private conversation with a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivateChat {
    /// Messages arrived that the local user has not looked at.
    pub unread: bool,
    /// The peer logged off while the conversation was open.
    pub logged_off: bool,
}

/// A peer in the chat, or the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    code: i32,
    nick: String,
    is_me: bool,
    online: bool,
    /// Whether the user is away.
    pub away: bool,
    /// Why the user is away. Empty when present.
    pub away_message: String,
    /// When the user was last heard from.
    pub last_idle: Instant,
    /// Whether the user is typing.
    pub writing: bool,
    /// Unicast port for private chat. 0 when disabled or unknown.
    pub private_chat_port: u16,
    /// Address the user's datagrams come from.
    pub ip: Option<Ipv4Addr>,
    /// Client name and version.
    pub client: String,
    /// Operating system the client runs on.
    pub operating_system: String,
    /// When the user logged on, in milliseconds since the Unix epoch.
    pub logon_time: i64,
    /// Open private conversation, if any.
    pub private_chat: Option<PrivateChat>,
}

impl User {
    /// Creates an online peer.
    pub fn new(code: i32, nick: impl Into<String>) -> Self {
        Self {
            code,
            nick: nick.into(),
            is_me: false,
            online: true,
            away: false,
            away_message: String::new(),
            last_idle: Instant::now(),
            writing: false,
            private_chat_port: 0,
            ip: None,
            client: String::new(),
            operating_system: String::new(),
            logon_time: 0,
            private_chat: None,
        }
    }

    /// Creates the local user.
    pub fn me(code: i32, nick: impl Into<String>) -> Self {
        Self {
            is_me: true,
            ..Self::new(code, nick)
        }
    }

    /// Unique user code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// Current nick.
    #[must_use]
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Whether this is the local user.
    #[must_use]
    pub const fn is_me(&self) -> bool {
        self.is_me
    }

    /// Whether the user is online. Removed users are offline.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.online
    }

    /// Back to present and not typing.
    pub fn reset(&mut self) {
        self.away = false;
        self.away_message.clear();
        self.writing = false;
    }
}

/// Result of [`UserList::add_or_update_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new user was inserted with the nick it asked for.
    Added,
    /// A new user was inserted, but its nick was taken.
    Renamed {
        /// The nick the user asked for.
        requested: String,
        /// The nick it got.
        assigned: String,
    },
    /// The code was already known. Nothing changed.
    AlreadyKnown,
}

/// Result of [`UserList::change_nick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NickChange {
    /// The nick changed from `old`.
    Changed {
        /// The previous nick.
        old: String,
    },
    /// The user already had this nick.
    Unchanged,
    /// Another online user has the nick.
    InUse,
    /// No user with this code.
    UnknownUser,
}

/// Known users in discovery order, the local user first.
#[derive(Debug, Clone)]
pub struct UserList {
    me: User,
    order: Vec<i32>,
    peers: HashMap<i32, User>,
    nicks: HashMap<String, i32>,
}

fn nick_key(nick: &str) -> String {
    nick.to_lowercase()
}

impl UserList {
    /// A list holding only the local user.
    #[must_use]
    pub fn new(mut me: User) -> Self {
        me.is_me = true;
        me.online = true;
        let mut nicks = HashMap::new();
        nicks.insert(nick_key(&me.nick), me.code);
        Self {
            me,
            order: Vec::new(),
            peers: HashMap::new(),
            nicks,
        }
    }

    /// Number of users, including the local user.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len() + 1
    }

    /// Always false: the local user is always listed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Users in discovery order, the local user first.
    pub fn iter(&self) -> impl Iterator<Item = &User> {
        std::iter::once(&self.me).chain(self.order.iter().filter_map(|code| self.peers.get(code)))
    }

    /// Codes of every user except the local one, in discovery order.
    #[must_use]
    pub fn peer_codes(&self) -> Vec<i32> {
        self.order.clone()
    }

    /// The local user.
    #[must_use]
    pub const fn me(&self) -> &User {
        &self.me
    }

    /// Mutable access to the local user's data fields.
    pub const fn me_mut(&mut self) -> &mut User {
        &mut self.me
    }

    /// Look up by code.
    #[must_use]
    pub fn get(&self, code: i32) -> Option<&User> {
        if code == self.me.code {
            Some(&self.me)
        } else {
            self.peers.get(&code)
        }
    }

    /// Mutable access to a user's data fields.
    pub fn get_mut(&mut self, code: i32) -> Option<&mut User> {
        if code == self.me.code {
            Some(&mut self.me)
        } else {
            self.peers.get_mut(&code)
        }
    }

    /// Whether `code` is known.
    #[must_use]
    pub fn contains(&self, code: i32) -> bool {
        code == self.me.code || self.peers.contains_key(&code)
    }

    /// Look up an online user by nick, ignoring case.
    #[must_use]
    pub fn by_nick(&self, nick: &str) -> Option<&User> {
        self.nicks
            .get(&nick_key(nick))
            .and_then(|code| self.get(*code))
    }

    /// Whether an online user other than `except` has `nick`.
    #[must_use]
    pub fn is_nick_taken(&self, nick: &str, except: Option<i32>) -> bool {
        self.nicks
            .get(&nick_key(nick))
            .is_some_and(|code| Some(*code) != except)
    }

    /// Insert `user` if its code is new. A taken nick is replaced by the
    /// user's code as text.
    pub fn add_or_update_user(&mut self, mut user: User) -> AddOutcome {
        if self.contains(user.code) {
            return AddOutcome::AlreadyKnown;
        }
        user.is_me = false;
        user.online = true;

        let outcome = if self.is_nick_taken(&user.nick, None) || user.nick.is_empty() {
            let assigned = self.free_nick_for(user.code);
            let requested = std::mem::replace(&mut user.nick, assigned.clone());
            tracing::debug!(code = user.code, requested, assigned, "nick taken, renaming new user");
            AddOutcome::Renamed {
                requested,
                assigned,
            }
        } else {
            AddOutcome::Added
        };

        self.nicks.insert(nick_key(&user.nick), user.code);
        self.order.push(user.code);
        self.peers.insert(user.code, user);
        outcome
    }

    fn free_nick_for(&self, code: i32) -> String {
        let base = code.to_string();
        if !self.is_nick_taken(&base, None) {
            return base;
        }
        (1u32..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.is_nick_taken(candidate, None))
            .unwrap_or(base)
    }

    /// Remove a peer. The local user cannot be removed. The returned user
    /// is marked offline.
    pub fn remove(&mut self, code: i32) -> Option<User> {
        if code == self.me.code {
            tracing::warn!(code, "refusing to remove the local user");
            return None;
        }
        let mut user = self.peers.remove(&code)?;
        self.order.retain(|c| *c != code);
        if self.nicks.get(&nick_key(&user.nick)) == Some(&code) {
            self.nicks.remove(&nick_key(&user.nick));
        }
        user.online = false;
        Some(user)
    }

    /// Set away state. Returns false if the code is unknown.
    pub fn change_away(&mut self, code: i32, away: bool, message: &str) -> bool {
        let Some(user) = self.get_mut(code) else {
            tracing::debug!(code, "away change for unknown user");
            return false;
        };
        user.away = away;
        user.away_message = if away { message.to_string() } else { String::new() };
        true
    }

    /// Set the writing flag. Returns true if it changed.
    pub fn change_writing(&mut self, code: i32, writing: bool) -> bool {
        let Some(user) = self.get_mut(code) else {
            tracing::debug!(code, "writing change for unknown user");
            return false;
        };
        let changed = user.writing != writing;
        user.writing = writing;
        changed
    }

    /// Rename a user, keeping online nicks unique.
    pub fn change_nick(&mut self, code: i32, nick: &str) -> NickChange {
        let Some(current) = self.get(code).map(|u| u.nick.clone()) else {
            tracing::debug!(code, nick, "nick change for unknown user");
            return NickChange::UnknownUser;
        };
        if current == nick {
            return NickChange::Unchanged;
        }
        if self.is_nick_taken(nick, Some(code)) {
            return NickChange::InUse;
        }
        if self.nicks.get(&nick_key(&current)) == Some(&code) {
            self.nicks.remove(&nick_key(&current));
        }
        self.nicks.insert(nick_key(nick), code);
        if let Some(user) = self.get_mut(code) {
            user.nick = nick.to_string();
        }
        NickChange::Changed { old: current }
    }

    /// Mark unread private messages from a user. Opens the private chat
    /// state if needed. Returns false if the code is unknown.
    pub fn change_new_message(&mut self, code: i32, unread: bool) -> bool {
        let Some(user) = self.get_mut(code) else {
            tracing::debug!(code, "new message flag for unknown user");
            return false;
        };
        user.private_chat.get_or_insert_with(PrivateChat::default).unread = unread;
        true
    }

    /// Record that a user was heard from at `now`, from `ip`. Returns false
    /// if the code is unknown.
    pub fn touch(&mut self, code: i32, ip: Ipv4Addr, now: Instant) -> bool {
        let Some(user) = self.get_mut(code) else {
            return false;
        };
        user.last_idle = now;
        user.ip = Some(ip);
        true
    }

    /// Peers not heard from for longer than `timeout`.
    #[must_use]
    pub fn timed_out_users(&self, now: Instant, timeout: Duration) -> Vec<i32> {
        self.iter()
            .filter(|user| !user.is_me && now.saturating_duration_since(user.last_idle) > timeout)
            .map(User::code)
            .collect()
    }
}
