//! Integration tests for group chat between clients on one LAN segment.
//!
//! Covers discovery, chat lines, topic, nick changes and clashes, away
//! state, the file offer handshake and logoff, all over the in-process
//! loopback network.
//!
//! Verification command: `cargo test --test lan_chat`

mod common;

use vertochat::chat::{ChatEvent, ControllerError, Direction, Rejection};
use vertochat::console::{self, Command};
use vertochat::transport::loopback::LoopbackHub;

use common::{Client, GroupTap, pair, wait_until};

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn clients_discover_each_other() {
    let hub = LoopbackHub::new();
    let mut kenny = Client::online(&hub, 1, "Kenny").await;
    let stan = Client::online(&hub, 2, "Stan").await;

    kenny.wait_for_system("Stan logged on from 10.0.0.2").await;
    stan.wait_knows(&kenny).await;

    let seen_by_stan = stan.chat.user(kenny.code()).expect("kenny known");
    assert_eq!(seen_by_stan.nick(), "Kenny");
    assert!(seen_by_stan.is_online());

    // CLIENT follows EXPOSING in the answer to an expose request.
    let client = kenny.chat.me().client;
    wait_until(|| stan.chat.user(kenny.code()).is_some_and(|u| u.client == client)).await;

    let seen_by_kenny = kenny.chat.user_by_nick("stan").expect("stan known");
    assert_eq!(seen_by_kenny.code(), stan.code());
    assert_eq!(kenny.chat.users()[0].code(), kenny.code());
}

#[tokio::test]
async fn own_logon_is_reported_with_the_address() {
    let hub = LoopbackHub::new();
    let mut kenny = Client::new(&hub, 1, "Kenny");
    kenny.chat.log_on().await.expect("log on");

    kenny.wait_for_system("You logged on as Kenny from 10.0.0.1").await;
    assert_eq!(kenny.chat.me().ip, Some("10.0.0.1".parse().expect("ip")));
}

#[tokio::test]
async fn logoff_removes_the_user_everywhere() {
    let hub = LoopbackHub::new();
    let (mut kenny, stan) = pair(&hub).await;

    stan.chat.log_off(true);
    kenny.wait_for_system("Stan logged off").await;
    assert!(kenny.chat.user(stan.code()).is_none());
    assert!(!stan.chat.is_logged_on());
    assert_eq!(stan.chat.users().len(), 1);
}

#[tokio::test]
async fn logoff_command_forgets_every_peer() {
    let hub = LoopbackHub::new();
    let (mut kenny, stan) = pair(&hub).await;
    assert_eq!(kenny.chat.users().len(), 2);

    let outcome = console::execute(&kenny.chat, Command::LogOff).await;
    assert!(!outcome.quit);

    kenny.wait_for_system("You logged off").await;
    let users = kenny.chat.users();
    assert_eq!(users.len(), 1);
    assert!(users[0].is_me());
    assert!(kenny.chat.user(stan.code()).is_none());
}

// =============================================================================
// Chat
// =============================================================================

#[tokio::test]
async fn chat_message_reaches_the_other_client() {
    let hub = LoopbackHub::new();
    let (mut kenny, mut stan) = pair(&hub).await;

    kenny.chat.send_chat_message("hello").expect("send");

    let event = stan
        .wait_for(|e| matches!(e, ChatEvent::ChatMessage { .. }))
        .await;
    assert_eq!(
        event,
        ChatEvent::ChatMessage {
            code: kenny.code(),
            nick: "Kenny".into(),
            color: 0,
            text: "hello".into(),
        }
    );
    // The sender shows its own line too, exactly once.
    kenny
        .wait_for(|e| matches!(e, ChatEvent::ChatMessage { text, .. } if text == "hello"))
        .await;
    assert!(!kenny.has_seen(|e| matches!(e, ChatEvent::ChatMessage { .. })));
}

#[tokio::test]
async fn rejected_chat_sends_nothing() {
    let hub = LoopbackHub::new();
    let (kenny, mut stan) = pair(&hub).await;

    let too_long = "x".repeat(451);
    assert!(matches!(
        kenny.chat.send_chat_message(&too_long),
        Err(ControllerError::Rejected(Rejection::TooLong { max: 450 }))
    ));
    kenny.chat.send_chat_message("marker").expect("send");

    stan.wait_for(|e| matches!(e, ChatEvent::ChatMessage { text, .. } if text == "marker"))
        .await;
    assert!(!stan.has_seen(|e| matches!(e, ChatEvent::ChatMessage { text, .. } if text.len() > 450)));
}

#[tokio::test]
async fn successful_chat_sends_exactly_one_datagram() {
    let hub = LoopbackHub::new();
    let (kenny, _stan) = pair(&hub).await;
    let tap = GroupTap::new(&hub, 9);

    kenny.chat.send_chat_message("hello").expect("send");
    tap.sync().await;

    assert_eq!(tap.chat_lines_from(&kenny), ["hello"]);
}

#[tokio::test]
async fn empty_chat_sends_no_datagram() {
    let hub = LoopbackHub::new();
    let (kenny, _stan) = pair(&hub).await;
    let tap = GroupTap::new(&hub, 9);

    for blank in ["", "   "] {
        assert!(matches!(
            kenny.chat.send_chat_message(blank),
            Err(ControllerError::Rejected(Rejection::EmptyMessage))
        ));
    }
    tap.sync().await;

    assert!(tap.bodies_from(&kenny).is_empty());
}

#[tokio::test]
async fn chat_while_not_connected_sends_no_datagram() {
    let hub = LoopbackHub::new();
    let kenny = Client::new(&hub, 1, "Kenny");
    let tap = GroupTap::new(&hub, 9);

    assert!(matches!(
        kenny.chat.send_chat_message("hello?"),
        Err(ControllerError::Rejected(Rejection::NotConnected))
    ));
    tap.sync().await;

    assert!(tap.bodies_from(&kenny).is_empty());
}

#[tokio::test]
async fn writing_state_is_shared() {
    let hub = LoopbackHub::new();
    let (kenny, stan) = pair(&hub).await;

    kenny.chat.update_me_writing(true);
    wait_until(|| stan.chat.user(kenny.code()).is_some_and(|u| u.writing)).await;
    kenny.chat.update_me_writing(false);
    wait_until(|| stan.chat.user(kenny.code()).is_some_and(|u| !u.writing)).await;
}

// =============================================================================
// Topic
// =============================================================================

#[tokio::test]
async fn topic_change_is_shared_and_late_joiners_get_it() {
    let hub = LoopbackHub::new();
    let (kenny, mut stan) = pair(&hub).await;

    kenny.chat.change_topic("Lunch at noon").expect("topic");
    stan.wait_for_system("Kenny changed the topic to: Lunch at noon")
        .await;
    assert_eq!(stan.chat.topic(), kenny.chat.topic());

    let mut kyle = Client::new(&hub, 3, "Kyle");
    kyle.chat.log_on().await.expect("log on");
    kyle.wait_for_system("Topic is: Lunch at noon (Kenny)").await;
    assert_eq!(kyle.chat.topic().text, "Lunch at noon");
}

#[tokio::test]
async fn removing_the_topic() {
    let hub = LoopbackHub::new();
    let (kenny, mut stan) = pair(&hub).await;

    kenny.chat.change_topic("Lunch").expect("topic");
    stan.wait_for_system("Kenny changed the topic to: Lunch").await;
    kenny.chat.change_topic("").expect("remove topic");
    stan.wait_for_system("Kenny removed the topic").await;
    assert!(!stan.chat.topic().is_set());
}

// =============================================================================
// Nicks
// =============================================================================

#[tokio::test]
async fn nick_change_is_shared_and_saved() {
    let hub = LoopbackHub::new();
    let (kenny, mut stan) = pair(&hub).await;

    kenny.chat.change_my_nick("Kyle").expect("nick");
    stan.wait_for_system("Kenny changed nick to Kyle").await;
    assert_eq!(
        kenny.saver.0.lock().as_ref().map(|s| s.nick.clone()),
        Some("Kyle".to_string())
    );

    assert!(matches!(
        stan.chat.change_my_nick("kyle"),
        Err(ControllerError::Rejected(Rejection::NickInUse(_)))
    ));
    assert_eq!(stan.chat.me().nick(), "Stan");
}

#[tokio::test]
async fn nick_clash_on_logon_resets_the_newcomer() {
    let hub = LoopbackHub::new();
    let kenny = Client::online(&hub, 1, "Kenny").await;
    let mut clone = Client::new(&hub, 2, "kenny");
    clone.chat.log_on().await.expect("log on");

    let code = clone.code().to_string();
    clone
        .wait_for_system(&format!("Nick crash, resetting nick to {code}"))
        .await;
    assert_eq!(clone.chat.me().nick(), code);
    assert_eq!(kenny.chat.me().nick(), "Kenny");
    wait_until(|| kenny.chat.user(clone.code()).is_some_and(|u| u.nick() == code)).await;
}

// =============================================================================
// Away
// =============================================================================

#[tokio::test]
async fn away_and_back_are_shared() {
    let hub = LoopbackHub::new();
    let (kenny, mut stan) = pair(&hub).await;

    kenny.chat.go_away("lunch").expect("away");
    stan.wait_for_system("Kenny went away: lunch").await;
    let seen = stan.chat.user(kenny.code()).expect("kenny known");
    assert!(seen.away);
    assert_eq!(seen.away_message, "lunch");

    assert!(matches!(
        stan.chat.send_file(kenny.code(), "notes.txt", 10),
        Err(ControllerError::Rejected(Rejection::UserAway(_)))
    ));

    kenny.chat.come_back().expect("back");
    stan.wait_for_system("Kenny came back").await;
    assert!(!stan.chat.user(kenny.code()).expect("kenny known").away);
}

// =============================================================================
// File offers
// =============================================================================

#[tokio::test]
async fn file_offer_accept_handshake() {
    let hub = LoopbackHub::new();
    let (mut kenny, mut stan) = pair(&hub).await;

    let hash = kenny
        .chat
        .send_file(stan.code(), "notes.txt", 1024)
        .expect("offer");
    let offered = stan
        .wait_for(|e| matches!(e, ChatEvent::FileOffered { .. }))
        .await;
    assert_eq!(
        offered,
        ChatEvent::FileOffered {
            user_code: kenny.code(),
            nick: "Kenny".into(),
            hash,
            file_name: "notes.txt".into(),
            size: 1024,
        }
    );

    stan.chat
        .accept_file_transfer(kenny.code(), hash, 40_100)
        .expect("accept");
    let accepted = kenny
        .wait_for(|e| matches!(e, ChatEvent::FileAccepted { .. }))
        .await;
    assert_eq!(
        accepted,
        ChatEvent::FileAccepted {
            user_code: stan.code(),
            hash,
            file_name: "notes.txt".into(),
            port: 40_100,
        }
    );
    assert!(kenny.chat.waiting_offers().is_empty());
    let transfer = &kenny.chat.transfers()[0];
    assert_eq!(transfer.direction, Direction::Outgoing);
    assert_eq!(transfer.port, 40_100);
    assert_eq!(stan.chat.transfers()[0].direction, Direction::Incoming);
}

#[tokio::test]
async fn file_offer_reject_handshake() {
    let hub = LoopbackHub::new();
    let (mut kenny, mut stan) = pair(&hub).await;

    let hash = kenny
        .chat
        .send_file(stan.code(), "notes.txt", 1024)
        .expect("offer");
    stan.wait_for(|e| matches!(e, ChatEvent::FileOffered { .. }))
        .await;

    stan.chat
        .reject_file_transfer(kenny.code(), hash)
        .expect("reject");
    kenny
        .wait_for(|e| matches!(e, ChatEvent::FileAborted { hash: h, .. } if *h == hash))
        .await;
    assert!(kenny.chat.waiting_offers().is_empty());
    assert!(stan.chat.waiting_offers().is_empty());
    assert!(matches!(
        stan.chat.accept_file_transfer(kenny.code(), hash, 1),
        Err(ControllerError::Rejected(Rejection::NoSuchOffer))
    ));
}

#[tokio::test]
async fn file_offer_to_someone_else_is_ignored() {
    let hub = LoopbackHub::new();
    let (kenny, mut stan) = pair(&hub).await;
    let mut kyle = Client::online(&hub, 3, "Kyle").await;
    kenny.wait_knows(&kyle).await;

    kenny
        .chat
        .send_file(kyle.code(), "notes.txt", 1)
        .expect("offer");
    kyle.wait_for(|e| matches!(e, ChatEvent::FileOffered { .. }))
        .await;
    assert!(!stan.has_seen(|e| matches!(e, ChatEvent::FileOffered { .. })));
    assert!(stan.chat.waiting_offers().is_empty());
}
