//! File offers waiting for an answer and transfers that were accepted.
//!
//! Only the handshake is tracked here. An offer sits in the
//! [`WaitingList`] until it is accepted (and moves to the
//! [`TransferList`]) or rejected. Every entry is dropped when its user
//! goes away.

use std::collections::HashMap;

/// Which way a file goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// A peer sends to the local user.
    Incoming,
    /// The local user sends to a peer.
    Outgoing,
}

/// A file offer nobody has answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingOffer {
    /// The peer on the other end.
    pub user_code: i32,
    /// Identifies the file within the offer.
    pub hash: i32,
    /// Name of the file.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Who sends.
    pub direction: Direction,
}

/// Lifecycle of an accepted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Accepted and in progress.
    Active,
    /// Aborted by either side. Inert.
    Cancelled,
}

/// An accepted file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// The peer on the other end.
    pub user_code: i32,
    /// Identifies the file within the offer.
    pub hash: i32,
    /// Name of the file.
    pub file_name: String,
    /// Size in bytes, when known.
    pub size: u64,
    /// Who sends.
    pub direction: Direction,
    /// Port the receiving side listens on.
    pub port: u16,
    /// Whether the transfer still runs.
    pub state: TransferState,
}

impl Transfer {
    /// Accept `offer` with the receiver listening on `port`.
    #[must_use]
    pub fn from_offer(offer: WaitingOffer, port: u16) -> Self {
        Self {
            user_code: offer.user_code,
            hash: offer.hash,
            file_name: offer.file_name,
            size: offer.size,
            direction: offer.direction,
            port,
            state: TransferState::Active,
        }
    }

    /// Mark the transfer aborted.
    pub const fn cancel(&mut self) {
        self.state = TransferState::Cancelled;
    }
}

type Key = (Direction, i32, i32);

/// Offers awaiting accept or reject, in both directions.
#[derive(Debug, Clone, Default)]
pub struct WaitingList {
    offers: HashMap<Key, WaitingOffer>,
}

impl WaitingList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `offer`, replacing an earlier offer with the same key.
    pub fn add(&mut self, offer: WaitingOffer) {
        self.offers
            .insert((offer.direction, offer.user_code, offer.hash), offer);
    }

    /// Look up a waiting offer.
    #[must_use]
    pub fn get(&self, direction: Direction, user_code: i32, hash: i32) -> Option<&WaitingOffer> {
        self.offers.get(&(direction, user_code, hash))
    }

    /// Stop tracking an offer and return it.
    pub fn take(&mut self, direction: Direction, user_code: i32, hash: i32) -> Option<WaitingOffer> {
        self.offers.remove(&(direction, user_code, hash))
    }

    /// Drop every offer involving `user_code`.
    pub fn remove_user(&mut self, user_code: i32) -> Vec<WaitingOffer> {
        let keys: Vec<Key> = self
            .offers
            .keys()
            .filter(|(_, code, _)| *code == user_code)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.offers.remove(&key))
            .collect()
    }

    /// Every waiting offer.
    #[must_use]
    pub fn offers(&self) -> Vec<WaitingOffer> {
        self.offers.values().cloned().collect()
    }

    /// Number of waiting offers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offers.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

/// Accepted transfers.
#[derive(Debug, Clone, Default)]
pub struct TransferList {
    transfers: HashMap<Key, Transfer>,
}

impl TransferList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an accepted transfer.
    pub fn start(&mut self, transfer: Transfer) {
        self.transfers.insert(
            (transfer.direction, transfer.user_code, transfer.hash),
            transfer,
        );
    }

    /// Look up a tracked transfer.
    #[must_use]
    pub fn get(&self, direction: Direction, user_code: i32, hash: i32) -> Option<&Transfer> {
        self.transfers.get(&(direction, user_code, hash))
    }

    /// Cancel and stop tracking a transfer.
    pub fn cancel(&mut self, direction: Direction, user_code: i32, hash: i32) -> Option<Transfer> {
        let mut transfer = self.transfers.remove(&(direction, user_code, hash))?;
        transfer.cancel();
        Some(transfer)
    }

    /// Cancel every transfer with `user_code`.
    pub fn cancel_user(&mut self, user_code: i32) -> Vec<Transfer> {
        let keys: Vec<Key> = self
            .transfers
            .keys()
            .filter(|(_, code, _)| *code == user_code)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|(direction, code, hash)| self.cancel(direction, code, hash))
            .collect()
    }

    /// Every tracked transfer.
    #[must_use]
    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers.values().cloned().collect()
    }

    /// Number of tracked transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
