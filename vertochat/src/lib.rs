//! `VertoChat`: serverless LAN chat over UDP multicast, wire compatible
//! with `KouChat`.

pub mod chat;
pub mod config;
pub mod console;
pub mod net;
pub mod transport;
