//! Integration tests for losing and regaining the network.
//!
//! Pulls a host's cable on the loopback segment and drives the connection
//! monitor by hand, checking suspension, the re-announce on recovery and
//! idle-timeout eviction of silent peers.
//!
//! Verification command: `cargo test --test connection_recovery`

mod common;

use std::time::Duration;

use vertochat::chat::{ChatEvent, ConnectionPhase, ControllerError, Rejection};
use vertochat::transport::loopback::LoopbackHub;

use common::{Client, configs, pair, wait_until};

/// The monitor needs two failed probes before it declares the link down.
async fn pull_cable(client: &Client) {
    client.network.set_link_up(false);
    client.chat.check_network().await;
    client.chat.check_network().await;
}

async fn plug_cable(client: &Client) {
    client.network.set_link_up(true);
    client.chat.check_network().await;
}

#[tokio::test]
async fn lost_network_suspends_the_chat() {
    let hub = LoopbackHub::new();
    let (mut kenny, _stan) = pair(&hub).await;

    pull_cable(&kenny).await;

    kenny
        .wait_for_system("You lost contact with the network")
        .await;
    kenny
        .wait_for(|e| *e == ChatEvent::ConnectionStatus(ConnectionPhase::Suspended))
        .await;
    assert_eq!(kenny.chat.connection_phase(), ConnectionPhase::Suspended);
    assert!(kenny.chat.is_logged_on());
    assert!(!kenny.chat.is_connected());
    assert!(matches!(
        kenny.chat.send_chat_message("anyone?"),
        Err(ControllerError::Rejected(Rejection::NotConnected))
    ));
}

#[tokio::test]
async fn one_failed_probe_is_not_enough() {
    let hub = LoopbackHub::new();
    let (kenny, _stan) = pair(&hub).await;

    kenny.network.set_link_up(false);
    kenny.chat.check_network().await;
    assert_eq!(kenny.chat.connection_phase(), ConnectionPhase::Online);

    kenny.network.set_link_up(true);
    kenny.chat.check_network().await;
    assert!(kenny.chat.is_connected());
}

#[tokio::test]
async fn silently_dropped_traffic_suspends_the_chat() {
    let hub = LoopbackHub::new();
    let (mut kenny, _stan) = pair(&hub).await;

    // The interface stays listed; only the echo check can notice.
    kenny.network.set_black_hole(true);
    kenny.chat.check_network().await;
    assert_eq!(kenny.chat.connection_phase(), ConnectionPhase::Online);
    kenny.chat.check_network().await;

    kenny
        .wait_for_system("You lost contact with the network")
        .await;
    assert!(!kenny.chat.is_connected());

    kenny.network.set_black_hole(false);
    kenny.chat.check_network().await;
    kenny
        .wait_for_system("You are connected to the network again")
        .await;
    assert!(kenny.chat.is_connected());
}

#[tokio::test]
async fn recovery_resynchronizes_with_peers() {
    let hub = LoopbackHub::new();
    let (mut kenny, stan) = pair(&hub).await;

    pull_cable(&kenny).await;
    kenny
        .wait_for_system("You lost contact with the network")
        .await;

    // Missed while offline.
    stan.chat.change_topic("Lunch at noon").expect("topic");
    stan.chat.go_away("eating").expect("away");

    plug_cable(&kenny).await;
    kenny
        .wait_for_system("You are connected to the network again")
        .await;
    assert_eq!(kenny.chat.connection_phase(), ConnectionPhase::Online);
    assert!(kenny.chat.is_connected());

    // GETTOPIC and EXPOSE in the re-announce bring the missed state back.
    kenny
        .wait_for_system("Stan changed the topic to: Lunch at noon")
        .await;
    wait_until(|| {
        kenny
            .chat
            .user(stan.code())
            .is_some_and(|u| u.away && u.away_message == "eating")
    })
    .await;

    kenny.chat.send_chat_message("back online").expect("send");
}

#[tokio::test]
async fn silent_peer_times_out() {
    let hub = LoopbackHub::new();
    let (network_config, mut chat_config) = configs();
    chat_config.idle_interval = Duration::from_millis(50);
    chat_config.user_timeout = Duration::from_millis(300);
    let mut kenny = Client::with_configs(&hub, 1, "Kenny", network_config, chat_config);
    kenny.chat.start();
    kenny.chat.log_on().await.expect("log on");
    let stan = Client::online(&hub, 2, "Stan").await;
    kenny.wait_knows(&stan).await;

    stan.network.set_link_up(false);

    kenny.wait_for_system("Stan timed out").await;
    assert!(kenny.chat.user(stan.code()).is_none());
}

#[tokio::test]
async fn logoff_while_suspended_resets_everything() {
    let hub = LoopbackHub::new();
    let (mut kenny, _stan) = pair(&hub).await;

    pull_cable(&kenny).await;
    kenny
        .wait_for_system("You lost contact with the network")
        .await;

    kenny.chat.log_off(false);
    kenny.wait_for_system("You logged off").await;
    assert_eq!(kenny.chat.connection_phase(), ConnectionPhase::Offline);
    assert!(!kenny.chat.is_logged_on());
    // Peers are kept on the shutdown path.
    assert_eq!(kenny.chat.users().len(), 2);
}
