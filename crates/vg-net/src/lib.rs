// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]

//! Federation plumbing: the static peer registry, the HTTP peer client
//! with per-call timeouts, and the serial block-ingest service fed by a
//! bounded channel.

use core::fmt;
use std::collections::BTreeMap;
use std::time::Duration;

pub mod ingest;
pub mod peers;

pub use ingest::{spawn_ingest, BlockSink, IngestService, INGEST_CAPACITY};
pub use peers::{ConsensusFailure, PeerClient};

/// General peer calls (chain fetch, forwarding).
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-peer consensus round-trip.
pub const CONSENSUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum NetError {
    Timeout,
    Transport(String),
    Status(u16),
    Decode(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("peer call timed out"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Status(code) => write!(f, "unexpected status {code}"),
            Self::Decode(e) => write!(f, "decode: {e}"),
        }
    }
}

impl std::error::Error for NetError {}

/// Fixed operator-id to base-URL mapping, known at startup and never
/// resized while running.
#[derive(Clone, Debug)]
pub struct PeerRegistry {
    peers: BTreeMap<String, String>,
}

impl PeerRegistry {
    pub fn new(peers: BTreeMap<String, String>) -> Self {
        Self { peers }
    }

    /// The reference federation: three operators addressed by container
    /// name, port `8<id>`.
    pub fn reference() -> Self {
        let mut peers = BTreeMap::new();
        for id in ["001", "002", "003"] {
            peers.insert(id.to_string(), format!("http://empresa_{id}:8{id}"));
        }
        Self { peers }
    }

    pub fn base_url(&self, operator_id: &str) -> Option<&str> {
        self.peers.get(operator_id).map(String::as_str)
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, &str)> {
        self.peers.iter().map(|(id, url)| (id.as_str(), url.as_str()))
    }

    /// Every peer except ourselves; the iteration order is stable.
    pub fn others<'a>(&'a self, self_id: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.all().filter(move |(id, _)| *id != self_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Reference point-to-operator assignment of the deployment: the
/// north-east corridor split across the three operators.
pub fn reference_point_operators() -> BTreeMap<String, String> {
    let assignments = [
        ("Salvador", "001"),
        ("Aracaju", "001"),
        ("Maceio", "001"),
        ("Recife", "002"),
        ("Joao Pessoa", "002"),
        ("Natal", "002"),
        ("Fortaleza", "003"),
        ("Teresina", "003"),
        ("Sao Luis", "003"),
    ];
    assignments
        .into_iter()
        .map(|(point, op)| (point.to_string(), op.to_string()))
        .collect()
}
