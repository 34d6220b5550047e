//! Line-oriented front end: command parsing, execution and event rendering.

use std::path::Path;

use crate::chat::{ChatEvent, Controller, ControllerError, Rejection, User};
use crate::transport::Network;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text: a chat message.
    Say(String),
    /// `/away <message>`
    Away(String),
    /// `/back`
    Back,
    /// `/topic [text]`. Empty removes the topic.
    Topic(String),
    /// `/nick <nick>`
    Nick(String),
    /// `/msg <nick> <text>`
    Msg {
        /// Recipient nick.
        nick: String,
        /// The line.
        text: String,
    },
    /// `/send <nick> <path>`
    Send {
        /// Recipient nick.
        nick: String,
        /// File to offer.
        path: String,
    },
    /// `/accept <nick> <hash> <port>`
    Accept {
        /// Sender nick.
        nick: String,
        /// Offer identifier.
        hash: i32,
        /// Port to receive on.
        port: u16,
    },
    /// `/reject <nick> <hash>`
    Reject {
        /// Sender nick.
        nick: String,
        /// Offer identifier.
        hash: i32,
    },
    /// `/cancel <nick> <hash>`
    Cancel {
        /// Peer nick.
        nick: String,
        /// Offer identifier.
        hash: i32,
    },
    /// `/users`
    Users,
    /// `/whois <nick>`
    Whois(String),
    /// `/logon`
    LogOn,
    /// `/logoff`
    LogOff,
    /// `/quit`
    Quit,
    /// `/help`
    Help,
    /// Blank input.
    Empty,
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// `/something` that is not a command.
    #[error("unknown command '/{0}', try /help")]
    UnknownCommand(String),
    /// A command with missing or bad arguments.
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Text for `/help`.
pub const HELP: &str = "\
/away <message>           go away
/back                     come back
/topic [text]             change or remove the topic
/nick <nick>              change nick
/msg <nick> <text>        private message
/send <nick> <path>       offer a file
/accept <nick> <hash> <port>
/reject <nick> <hash>
/cancel <nick> <hash>
/users                    list users
/whois <nick>             show user details
/logon  /logoff  /quit";

/// Parse one line of input.
///
/// # Errors
///
/// Returns [`ParseError`] for unknown commands or bad arguments.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(rest) = line.strip_prefix('/') else {
        if line.trim().is_empty() {
            return Ok(Command::Empty);
        }
        return Ok(Command::Say(line.to_string()));
    };

    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    let mut words = args.split_whitespace();
    let command = match name {
        "away" if !args.is_empty() => Command::Away(args.to_string()),
        "away" => return Err(ParseError::Usage("/away <message>")),
        "back" => Command::Back,
        "topic" => Command::Topic(args.to_string()),
        "nick" if !args.is_empty() => Command::Nick(args.to_string()),
        "nick" => return Err(ParseError::Usage("/nick <nick>")),
        "msg" => {
            let (nick, text) = args
                .split_once(' ')
                .filter(|(_, text)| !text.trim().is_empty())
                .ok_or(ParseError::Usage("/msg <nick> <text>"))?;
            Command::Msg {
                nick: nick.to_string(),
                text: text.trim_start().to_string(),
            }
        }
        "send" => {
            let (nick, path) = args
                .split_once(' ')
                .filter(|(_, path)| !path.trim().is_empty())
                .ok_or(ParseError::Usage("/send <nick> <path>"))?;
            Command::Send {
                nick: nick.to_string(),
                path: path.trim().to_string(),
            }
        }
        "accept" => {
            let usage = ParseError::Usage("/accept <nick> <hash> <port>");
            let (Some(nick), Some(hash), Some(port)) = (words.next(), words.next(), words.next())
            else {
                return Err(usage);
            };
            Command::Accept {
                nick: nick.to_string(),
                hash: hash.parse().map_err(|_| usage.clone())?,
                port: port.parse().map_err(|_| usage)?,
            }
        }
        "reject" | "cancel" => {
            let usage = if name == "reject" {
                ParseError::Usage("/reject <nick> <hash>")
            } else {
                ParseError::Usage("/cancel <nick> <hash>")
            };
            let (Some(nick), Some(hash)) = (words.next(), words.next()) else {
                return Err(usage);
            };
            let nick = nick.to_string();
            let hash = hash.parse().map_err(|_| usage)?;
            if name == "reject" {
                Command::Reject { nick, hash }
            } else {
                Command::Cancel { nick, hash }
            }
        }
        "users" => Command::Users,
        "whois" if !args.is_empty() => Command::Whois(args.to_string()),
        "whois" => return Err(ParseError::Usage("/whois <nick>")),
        "logon" => Command::LogOn,
        "logoff" => Command::LogOff,
        "quit" => Command::Quit,
        "help" => Command::Help,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(command)
}

/// Render an event as one line, or `None` if it has no text form.
#[must_use]
pub fn render(event: &ChatEvent) -> Option<String> {
    let line = match event {
        ChatEvent::SystemMessage(text) => format!("*** {text}"),
        ChatEvent::ShowTopic(topic) if topic.is_set() => format!("*** Topic: {topic}"),
        ChatEvent::ChatMessage { nick, text, .. } => format!("<{nick}> {text}"),
        ChatEvent::PrivateMessage {
            nick,
            text,
            outgoing: true,
            ..
        } => format!("-> *{nick}* {text}"),
        ChatEvent::PrivateMessage { nick, text, .. } => format!("*{nick}* {text}"),
        ChatEvent::PrivateSystemMessage { text, .. } => format!("*** (private) {text}"),
        ChatEvent::FileOffered {
            nick,
            hash,
            file_name,
            ..
        } => format!("*** /accept {nick} {hash} <port> or /reject {nick} {hash} for {file_name}"),
        ChatEvent::FileAccepted {
            file_name, port, ..
        } => format!("*** {file_name} can be sent to port {port}"),
        ChatEvent::ConnectionStatus(phase) => format!("*** Status: {phase}"),
        ChatEvent::ShowTopic(_)
        | ChatEvent::AwayChanged { .. }
        | ChatEvent::UserListChanged
        | ChatEvent::FileAborted { .. } => return None,
    };
    Some(line)
}

/// What running a command printed, and whether to stop reading input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Lines to show.
    pub lines: Vec<String>,
    /// `/quit` was given.
    pub quit: bool,
}

impl Outcome {
    fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            quit: false,
        }
    }

    fn report<T>(result: Result<T, ControllerError>) -> Self {
        match result {
            Ok(_) => Self::default(),
            Err(e) => Self::line(format!("*** {e}")),
        }
    }
}

fn code_of<N: Network>(chat: &Controller<N>, nick: &str) -> Result<i32, ControllerError> {
    chat.user_by_nick(nick)
        .map(|user| user.code())
        .ok_or_else(|| Rejection::UnknownUser.into())
}

/// Run one parsed command against the chat.
pub async fn execute<N: Network>(chat: &Controller<N>, command: Command) -> Outcome {
    match command {
        Command::Empty => Outcome::default(),
        Command::Say(text) => Outcome::report(chat.send_chat_message(&text)),
        Command::Away(message) => Outcome::report(chat.go_away(&message)),
        Command::Back => Outcome::report(chat.come_back()),
        Command::Topic(text) => Outcome::report(chat.change_topic(&text)),
        Command::Nick(nick) => Outcome::report(chat.change_my_nick(&nick)),
        Command::Msg { nick, text } => Outcome::report(
            code_of(chat, &nick).and_then(|code| chat.send_private_message(code, &text)),
        ),
        Command::Send { nick, path } => send_file(chat, &nick, &path).await,
        Command::Accept { nick, hash, port } => Outcome::report(
            code_of(chat, &nick).and_then(|code| chat.accept_file_transfer(code, hash, port)),
        ),
        Command::Reject { nick, hash } => Outcome::report(
            code_of(chat, &nick).and_then(|code| chat.reject_file_transfer(code, hash)),
        ),
        Command::Cancel { nick, hash } => Outcome::report(
            code_of(chat, &nick).and_then(|code| chat.cancel_file_transfer(code, hash)),
        ),
        Command::Users => Outcome {
            lines: chat
                .users()
                .iter()
                .map(|user| format!("    {}", user_line(user)))
                .collect(),
            quit: false,
        },
        Command::Whois(nick) => match chat.user_by_nick(&nick) {
            Some(user) => Outcome {
                lines: whois(&user).into_iter().map(|line| format!("    {line}")).collect(),
                quit: false,
            },
            None => Outcome::line(format!("*** {}", Rejection::UnknownUser)),
        },
        Command::LogOn => Outcome::report(chat.log_on().await),
        Command::LogOff => {
            chat.log_off(true);
            Outcome::default()
        }
        Command::Help => Outcome::line(HELP),
        Command::Quit => Outcome {
            lines: Vec::new(),
            quit: true,
        },
    }
}

async fn send_file<N: Network>(chat: &Controller<N>, nick: &str, path: &str) -> Outcome {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Outcome::line(format!("*** {path} is not a file")),
        Err(e) => return Outcome::line(format!("*** Can not read {path}: {e}")),
    };
    let file_name = Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |name| name.to_string_lossy().into_owned());
    match code_of(chat, nick).and_then(|code| chat.send_file(code, &file_name, size)) {
        Ok(hash) => Outcome::line(format!("*** Offered {file_name} to {nick} (hash {hash})")),
        Err(e) => Outcome::line(format!("*** {e}")),
    }
}

/// One line per user for `/users`.
#[must_use]
pub fn user_line(user: &User) -> String {
    let mut line = user.nick().to_string();
    if user.is_me() {
        line.push_str(" (me)");
    }
    if user.away {
        line.push_str(&format!(" [away: {}]", user.away_message));
    }
    if user.writing {
        line.push_str(" ...");
    }
    line
}

/// Details for `/whois`.
#[must_use]
pub fn whois(user: &User) -> Vec<String> {
    let logon = chrono::DateTime::from_timestamp_millis(user.logon_time)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    let idle = user.last_idle.elapsed().as_secs();
    let mut lines = vec![
        format!("{} (code {})", user.nick(), user.code()),
        format!("  client: {}", user.client),
        format!("  os: {}", user.operating_system),
        format!(
            "  address: {}",
            user.ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
        ),
        format!("  logged on: {logon}"),
        format!("  idle: {idle}s"),
    ];
    if user.private_chat_port != 0 {
        lines.push(format!("  private chat port: {}", user.private_chat_port));
    }
    if user.away {
        lines.push(format!("  away: {}", user.away_message));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Topic;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(parse("hello there\n"), Ok(Command::Say("hello there".into())));
        assert_eq!(parse("   "), Ok(Command::Empty));
    }

    #[test]
    fn commands_with_arguments() {
        assert_eq!(parse("/away lunch break"), Ok(Command::Away("lunch break".into())));
        assert_eq!(parse("/topic"), Ok(Command::Topic(String::new())));
        assert_eq!(
            parse("/msg Stan hi there"),
            Ok(Command::Msg {
                nick: "Stan".into(),
                text: "hi there".into()
            })
        );
        assert_eq!(
            parse("/accept Stan 7 40100"),
            Ok(Command::Accept {
                nick: "Stan".into(),
                hash: 7,
                port: 40_100
            })
        );
        assert_eq!(
            parse("/reject Stan 7"),
            Ok(Command::Reject {
                nick: "Stan".into(),
                hash: 7
            })
        );
    }

    #[test]
    fn bad_commands_are_reported() {
        assert_eq!(parse("/away"), Err(ParseError::Usage("/away <message>")));
        assert_eq!(parse("/msg Stan"), Err(ParseError::Usage("/msg <nick> <text>")));
        assert_eq!(
            parse("/accept Stan x 1"),
            Err(ParseError::Usage("/accept <nick> <hash> <port>"))
        );
        assert_eq!(parse("/dance"), Err(ParseError::UnknownCommand("dance".into())));
    }

    #[test]
    fn events_render_as_lines() {
        assert_eq!(
            render(&ChatEvent::ChatMessage {
                code: 1,
                nick: "Stan".into(),
                color: 0,
                text: "hi".into()
            }),
            Some("<Stan> hi".into())
        );
        assert_eq!(
            render(&ChatEvent::ShowTopic(Topic::new("Lunch", "Stan", 1))),
            Some("*** Topic: Lunch (Stan)".into())
        );
        assert_eq!(render(&ChatEvent::ShowTopic(Topic::default())), None);
        assert_eq!(render(&ChatEvent::UserListChanged), None);
    }

    #[test]
    fn user_lines_show_state() {
        let mut user = User::new(12_345_678, "Stan");
        user.away = true;
        user.away_message = "lunch".into();
        assert_eq!(user_line(&user), "Stan [away: lunch]");
        assert_eq!(user_line(&User::me(1, "Kenny")), "Kenny (me)");
        assert!(whois(&user)[0].contains("code 12345678"));
    }
}
