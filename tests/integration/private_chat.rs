//! Integration tests for private chat over unicast.
//!
//! Verification command: `cargo test --test private_chat`

mod common;

use vertochat::chat::{ChatEvent, ControllerError, Rejection};
use vertochat::transport::loopback::LoopbackHub;

use common::{Client, configs, pair, wait_until};

/// Wait until `from` has learned the private chat port of `to`.
async fn knows_port(from: &Client, to: &Client) {
    let code = to.code();
    wait_until(|| {
        from.chat
            .user(code)
            .is_some_and(|u| u.private_chat_port != 0 && u.ip.is_some())
    })
    .await;
}

#[tokio::test]
async fn private_message_reaches_only_the_target() {
    let hub = LoopbackHub::new();
    let (mut kenny, mut stan) = pair(&hub).await;
    let mut kyle = Client::online(&hub, 3, "Kyle").await;
    knows_port(&kenny, &stan).await;

    kenny
        .chat
        .send_private_message(stan.code(), "psst")
        .expect("send");

    let received = stan
        .wait_for(|e| matches!(e, ChatEvent::PrivateMessage { .. }))
        .await;
    assert_eq!(
        received,
        ChatEvent::PrivateMessage {
            user_code: kenny.code(),
            nick: "Kenny".into(),
            color: 0,
            text: "psst".into(),
            outgoing: false,
        }
    );
    kenny
        .wait_for(|e| matches!(e, ChatEvent::PrivateMessage { outgoing: true, .. }))
        .await;
    assert!(!kyle.has_seen(|e| matches!(e, ChatEvent::PrivateMessage { .. })));
    // Kyle stays quiet; make sure the network had time to misdeliver.
    kenny.chat.send_chat_message("sync").expect("send");
    kyle.wait_for(|e| matches!(e, ChatEvent::ChatMessage { text, .. } if text == "sync"))
        .await;
    assert!(!kyle.has_seen(|e| matches!(e, ChatEvent::PrivateMessage { .. })));
}

#[tokio::test]
async fn unread_flag_is_set_and_cleared() {
    let hub = LoopbackHub::new();
    let (kenny, mut stan) = pair(&hub).await;
    knows_port(&kenny, &stan).await;

    kenny
        .chat
        .send_private_message(stan.code(), "psst")
        .expect("send");
    stan.wait_for(|e| matches!(e, ChatEvent::PrivateMessage { .. }))
        .await;

    let chat = stan
        .chat
        .user(kenny.code())
        .and_then(|u| u.private_chat)
        .expect("private chat opened");
    assert!(chat.unread);

    stan.chat.mark_private_chat_read(kenny.code());
    let chat = stan
        .chat
        .user(kenny.code())
        .and_then(|u| u.private_chat)
        .expect("private chat kept");
    assert!(!chat.unread);
}

#[tokio::test]
async fn preconditions_are_checked_in_order() {
    let hub = LoopbackHub::new();
    let (kenny, stan) = pair(&hub).await;
    knows_port(&kenny, &stan).await;

    assert!(matches!(
        kenny.chat.send_private_message(12_345, "hi"),
        Err(ControllerError::Rejected(Rejection::UnknownUser))
    ));
    assert!(matches!(
        kenny.chat.send_private_message(stan.code(), "  "),
        Err(ControllerError::Rejected(Rejection::EmptyMessage))
    ));
    assert!(matches!(
        kenny.chat.send_private_message(stan.code(), &"x".repeat(451)),
        Err(ControllerError::Rejected(Rejection::TooLong { .. }))
    ));

    stan.chat.go_away("lunch").expect("away");
    wait_until(|| kenny.chat.user(stan.code()).is_some_and(|u| u.away)).await;
    assert!(matches!(
        kenny.chat.send_private_message(stan.code(), "hi"),
        Err(ControllerError::Rejected(Rejection::UserAway(_)))
    ));

    kenny.chat.go_away("busy").expect("away");
    assert!(matches!(
        kenny.chat.send_private_message(stan.code(), "hi"),
        Err(ControllerError::Rejected(Rejection::MeAway))
    ));
}

#[tokio::test]
async fn peer_without_private_chat_cannot_be_messaged() {
    let hub = LoopbackHub::new();
    let kenny = Client::online(&hub, 1, "Kenny").await;
    let (mut network_config, chat_config) = configs();
    network_config.private_chat_enabled = false;
    let kyle = Client::with_configs(&hub, 3, "Kyle", network_config, chat_config);
    kyle.chat.log_on().await.expect("log on");
    kenny.wait_knows(&kyle).await;
    kyle.wait_knows(&kenny).await;
    knows_port(&kyle, &kenny).await;

    assert!(matches!(
        kenny.chat.send_private_message(kyle.code(), "hi"),
        Err(ControllerError::Rejected(Rejection::NoPrivatePort(_)))
    ));
    assert!(matches!(
        kyle.chat.send_private_message(kenny.code(), "hi"),
        Err(ControllerError::Rejected(Rejection::PrivateChatDisabled))
    ));
    assert_eq!(kyle.chat.private_chat_port(), None);
}

#[tokio::test]
async fn private_chat_is_told_when_the_peer_leaves() {
    let hub = LoopbackHub::new();
    let (mut kenny, stan) = pair(&hub).await;
    knows_port(&kenny, &stan).await;

    kenny
        .chat
        .send_private_message(stan.code(), "bye?")
        .expect("send");
    stan.chat.log_off(true);

    let event = kenny
        .wait_for(|e| matches!(e, ChatEvent::PrivateSystemMessage { .. }))
        .await;
    assert_eq!(
        event,
        ChatEvent::PrivateSystemMessage {
            user_code: stan.code(),
            text: "The user logged off".into(),
        }
    );
}
