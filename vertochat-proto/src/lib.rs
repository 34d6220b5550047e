//! Shared protocol definitions for the `VertoChat` wire format.

pub mod codec;
pub mod message;
