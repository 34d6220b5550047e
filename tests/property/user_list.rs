//! Property-based tests for the user registry.
//!
//! Uses proptest to verify that after any sequence of arrivals, nick
//! changes and removals:
//! 1. Online nicks stay unique, ignoring case.
//! 2. Codes stay unique and the local user is always listed first.
//! 3. Nick lookups agree with the listed users.

use std::collections::HashSet;

use proptest::prelude::*;
use vertochat::chat::users::{User, UserList, is_valid_nick};

const ME: i32 = 10_000_000;

#[derive(Debug, Clone)]
enum Op {
    Add(i32, String),
    ChangeNick(i32, String),
    Remove(i32),
}

/// A small pool of codes and nicks so collisions are common.
fn arb_code() -> impl Strategy<Value = i32> {
    prop_oneof![Just(ME), 10_000_001..10_000_008i32]
}

fn arb_nick() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Kenny".to_string()),
        Just("kenny".to_string()),
        Just("Stan".to_string()),
        Just("KYLE".to_string()),
        Just("kyle".to_string()),
        Just("10000003".to_string()),
        Just(String::new()),
        "[a-z]{1,3}",
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (arb_code(), arb_nick()).prop_map(|(code, nick)| Op::Add(code, nick)),
        2 => (arb_code(), arb_nick()).prop_map(|(code, nick)| Op::ChangeNick(code, nick)),
        1 => arb_code().prop_map(Op::Remove),
    ]
}

fn apply(list: &mut UserList, op: &Op) {
    match op {
        Op::Add(code, nick) => {
            list.add_or_update_user(User::new(*code, nick.clone()));
        }
        // The controller validates nicks before renaming anyone.
        Op::ChangeNick(code, nick) if is_valid_nick(nick) => {
            list.change_nick(*code, nick);
        }
        Op::ChangeNick(..) => {}
        Op::Remove(code) => {
            list.remove(*code);
        }
    }
}

proptest! {
    #[test]
    fn nicks_and_codes_stay_unique(ops in prop::collection::vec(arb_op(), 0..60)) {
        let mut list = UserList::new(User::me(ME, "Kenny"));
        for op in &ops {
            apply(&mut list, op);

            let users: Vec<&User> = list.iter().collect();
            prop_assert_eq!(users[0].code(), ME);
            prop_assert!(users[0].is_me());
            prop_assert_eq!(users.len(), list.len());

            let mut codes = HashSet::new();
            let mut nicks = HashSet::new();
            for user in &users {
                prop_assert!(codes.insert(user.code()), "duplicate code {}", user.code());
                prop_assert!(user.is_online());
                prop_assert!(!user.nick().is_empty());
                prop_assert!(
                    nicks.insert(user.nick().to_lowercase()),
                    "duplicate nick {}",
                    user.nick()
                );
            }
        }
    }

    #[test]
    fn nick_lookup_finds_the_listed_user(ops in prop::collection::vec(arb_op(), 0..60)) {
        let mut list = UserList::new(User::me(ME, "Kenny"));
        for op in &ops {
            apply(&mut list, op);
        }
        for user in list.iter() {
            let found = list.by_nick(&user.nick().to_uppercase()).map(User::code);
            prop_assert_eq!(found, Some(user.code()));
        }
    }

    #[test]
    fn the_local_user_survives_removal(ops in prop::collection::vec(arb_op(), 0..30)) {
        let mut list = UserList::new(User::me(ME, "Kenny"));
        for op in &ops {
            apply(&mut list, op);
        }
        prop_assert!(list.remove(ME).is_none());
        prop_assert!(list.contains(ME));
        prop_assert_eq!(list.me().code(), ME);
    }
}
