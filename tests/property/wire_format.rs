//! Property-based tests for the text wire format.
//!
//! Uses proptest to verify:
//! 1. Any well-formed group message survives encode → decode.
//! 2. Any private message survives encode → decode.
//! 3. Arbitrary lines never cause a panic in either decoder.
//! 4. Lines missing a header delimiter are always reported as malformed.

use proptest::prelude::*;
use vertochat_proto::codec::{self, CodecError};
use vertochat_proto::message::*;

/// Nicks as the client allows them: no delimiters.
fn arb_nick() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.-]{1,10}"
}

/// Free text. Delimiters are allowed since text is always the last field.
fn arb_text() -> impl Strategy<Value = String> {
    "[^\n]{0,120}"
}

fn arb_topic() -> impl Strategy<Value = TopicPayload> {
    (any::<i64>(), arb_nick(), arb_text()).prop_map(|(timestamp, nick, text)| TopicPayload {
        timestamp,
        nick,
        text,
    })
}

fn arb_client_info() -> impl Strategy<Value = ClientInfo> {
    (
        "[^)\n]{0,40}",
        any::<i64>(),
        "[^}\n]{0,20}",
        proptest::option::of(any::<u16>()),
    )
        .prop_map(
            |(client, since_logon_ms, operating_system, private_chat_port)| ClientInfo {
                client,
                since_logon_ms,
                operating_system,
                private_chat_port,
            },
        )
}

fn arb_body() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        Just(MessageBody::LogOn),
        Just(MessageBody::LogOff),
        Just(MessageBody::Expose),
        arb_text().prop_map(|away_message| MessageBody::Exposing { away_message }),
        Just(MessageBody::GetTopic),
        arb_topic().prop_map(MessageBody::Topic),
        arb_text().prop_map(|message| MessageBody::Away { message }),
        Just(MessageBody::Back),
        (any::<i32>(), arb_text()).prop_map(|(color, text)| MessageBody::Chat { color, text }),
        Just(MessageBody::Writing),
        Just(MessageBody::StoppedWriting),
        Just(MessageBody::Nick),
        arb_nick().prop_map(|nick| MessageBody::NickCrash { nick }),
        arb_client_info().prop_map(MessageBody::Client),
        Just(MessageBody::Idle),
        (any::<i32>(), any::<u64>(), any::<i32>(), arb_text()).prop_map(
            |(to_code, size, hash, file_name)| MessageBody::SendFile(FileOffer {
                to_code,
                size,
                hash,
                file_name,
            })
        ),
        (any::<i32>(), any::<u16>(), any::<i32>(), arb_text()).prop_map(
            |(to_code, port, hash, file_name)| MessageBody::SendFileAccept(FileAccept {
                to_code,
                port,
                hash,
                file_name,
            })
        ),
        (any::<i32>(), any::<i32>(), arb_text()).prop_map(|(to_code, hash, file_name)| {
            MessageBody::SendFileAbort(FileAbort {
                to_code,
                hash,
                file_name,
            })
        }),
    ]
}

fn arb_group_message() -> impl Strategy<Value = GroupMessage> {
    (any::<i32>(), arb_nick(), arb_body()).prop_map(|(code, nick, body)| GroupMessage {
        code,
        nick,
        body,
    })
}

fn arb_private_message() -> impl Strategy<Value = PrivateMessage> {
    (any::<i32>(), any::<i32>(), any::<i32>(), arb_text())
        .prop_map(|(from, to, color, text)| PrivateMessage::new(from, to, color, text))
}

proptest! {
    #[test]
    fn group_message_round_trip(msg in arb_group_message()) {
        let line = codec::encode(&msg);
        let decoded = codec::decode(&line).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn private_message_round_trip(msg in arb_private_message()) {
        let line = codec::encode_private(&msg);
        let decoded = codec::decode_private(&line).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn arbitrary_lines_never_panic(line in ".{0,300}") {
        let _ = codec::decode(&line);
        let _ = codec::decode_private(&line);
    }

    #[test]
    fn structured_garbage_never_panics(
        code in "-?[0-9a]{0,12}",
        token in "[A-Z]{0,15}",
        payload in "[()\\[\\]{}<>:#!0-9a-z-]{0,40}",
    ) {
        let line = format!("{code}!{token}#nick:{payload}");
        let _ = codec::decode(&line);
        let _ = codec::decode_private(&line);
    }

    #[test]
    fn missing_bang_is_malformed(line in "[^!]{0,80}") {
        let is_malformed = matches!(codec::decode(&line), Err(CodecError::Malformed { .. }));
        prop_assert!(is_malformed);
    }

    #[test]
    fn missing_colon_after_nick_is_malformed(code in any::<i32>(), nick in arb_nick()) {
        let line = format!("{code}!MSG#{nick}");
        let is_malformed = matches!(codec::decode(&line), Err(CodecError::Malformed { .. }));
        prop_assert!(is_malformed);
    }
}
