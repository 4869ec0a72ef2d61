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

//! Ledger data model shared by every operator and the vehicle client.
//!
//! Wire and disk field names are Portuguese (`transacao`, `hash_anterior`,
//! `autor`, ...) and are fixed interface contracts; the canonical hash is
//! derived from a string concatenation of the same fields, so any change
//! here makes the chain unrecognisable to peers.

use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Reserved author/operator id of the fixed first block.
pub const GENESIS_AUTHOR: &str = "GENESIS";
/// Timestamp literal carried by the genesis block on every operator.
pub const GENESIS_TIMESTAMP: &str = "2025-01-01T00:00:00Z";

// ============================
// Transactions
// ============================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    #[serde(rename = "GENESIS")]
    Genesis,
    #[serde(rename = "RESERVA")]
    Reservation,
    #[serde(rename = "RECARGA")]
    Recharge,
    #[serde(rename = "PAGAMENTO")]
    Payment,
}

impl TxKind {
    /// Wire spelling, also the form that enters the canonical hash input.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Genesis => "GENESIS",
            Self::Reservation => "RESERVA",
            Self::Recharge => "RECARGA",
            Self::Payment => "PAGAMENTO",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "tipo")]
    pub kind: TxKind,
    #[serde(rename = "placa", default)]
    pub plate: String,
    #[serde(rename = "valor", default)]
    pub amount: f64,
    #[serde(rename = "ponto", default)]
    pub point: String,
    #[serde(rename = "empresa", default)]
    pub operator: String,
}

impl Transaction {
    pub fn reservation(plate: &str, point: &str, operator: &str) -> Self {
        Self {
            kind: TxKind::Reservation,
            plate: plate.to_string(),
            amount: 0.0,
            point: point.to_string(),
            operator: operator.to_string(),
        }
    }

    pub fn recharge(plate: &str, point: &str, amount: f64, operator: &str) -> Self {
        Self {
            kind: TxKind::Recharge,
            plate: plate.to_string(),
            amount,
            point: point.to_string(),
            operator: operator.to_string(),
        }
    }

    pub fn payment(plate: &str, point: &str, amount: f64, operator: &str) -> Self {
        Self {
            kind: TxKind::Payment,
            plate: plate.to_string(),
            amount,
            point: point.to_string(),
            operator: operator.to_string(),
        }
    }

    /// Settlement key: a PAYMENT settles the first unsettled RECHARGE with
    /// the same (point, amount, operator).
    fn settles(&self, recharge: &Transaction) -> bool {
        self.point == recharge.point
            && self.amount == recharge.amount
            && self.operator == recharge.operator
    }
}

// ============================
// Blocks
// ============================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: String,
    #[serde(rename = "transacao")]
    pub tx: Transaction,
    #[serde(rename = "hash_anterior")]
    pub previous_hash: String,
    pub hash: String,
    #[serde(rename = "autor")]
    pub author: String,
    #[serde(rename = "assinatura")]
    pub signature: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockError {
    IndexSuccession { expected: u64, got: u64 },
    PreviousHashMismatch,
    HashMismatch,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexSuccession { expected, got } => {
                write!(f, "index succession: expected {expected}, got {got}")
            }
            Self::PreviousHashMismatch => f.write_str("previous-hash link broken"),
            Self::HashMismatch => f.write_str("hash does not match canonical fields"),
        }
    }
}

impl std::error::Error for BlockError {}

impl Block {
    /// Forge a successor of `predecessor`, hash filled in, signature empty.
    pub fn forge(tx: Transaction, predecessor: &Block, author: &str, timestamp: String) -> Self {
        let mut block = Block {
            index: predecessor.index + 1,
            timestamp,
            tx,
            previous_hash: predecessor.hash.clone(),
            hash: String::new(),
            author: author.to_string(),
            signature: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The fixed first block, identical on every operator. Unsigned.
    pub fn genesis() -> Self {
        let mut block = Block {
            index: 0,
            timestamp: GENESIS_TIMESTAMP.to_string(),
            tx: Transaction {
                kind: TxKind::Genesis,
                plate: String::new(),
                amount: 0.0,
                point: String::new(),
                operator: GENESIS_AUTHOR.to_string(),
            },
            previous_hash: String::new(),
            hash: String::new(),
            author: GENESIS_AUTHOR.to_string(),
            signature: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Canonical hash input. Field order and the two-decimal amount form
    /// are load-bearing for cross-operator interop.
    pub fn canonical_input(&self) -> String {
        format!(
            "{}{}{}{}{:.2}{}{}{}{}",
            self.index,
            self.timestamp,
            self.tx.kind.as_wire(),
            self.tx.plate,
            self.tx.amount,
            self.tx.point,
            self.tx.operator,
            self.previous_hash,
            self.author
        )
    }

    pub fn compute_hash(&self) -> String {
        vg_crypto::sha256_hex(self.canonical_input().as_bytes())
    }

    /// Structural validation against the direct predecessor: index
    /// succession, previous-hash link, hash recomputation. The signature
    /// is checked one layer up, where the author's public key file is
    /// resolved.
    pub fn validate_against(&self, predecessor: &Block) -> Result<(), BlockError> {
        if self.index != predecessor.index + 1 {
            return Err(BlockError::IndexSuccession {
                expected: predecessor.index + 1,
                got: self.index,
            });
        }
        if self.previous_hash != predecessor.hash {
            return Err(BlockError::PreviousHashMismatch);
        }
        if self.compute_hash() != self.hash {
            return Err(BlockError::HashMismatch);
        }
        Ok(())
    }
}

/// Block timestamps in their human display form, UTC.
pub fn display_timestamp(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S %d/%m/%Y").to_string()
}

pub fn now_timestamp() -> String {
    display_timestamp(Utc::now())
}

// ============================
// Chain
// ============================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Chain {
    #[serde(rename = "blocos")]
    pub blocks: Vec<Block>,
}

/// Per-plate totals derived from the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlateSummary {
    pub recharges: u64,
    pub payments: u64,
    pub recharged_total: f64,
    pub paid_total: f64,
}

impl PlateSummary {
    pub fn pending_balance(&self) -> f64 {
        self.recharged_total - self.paid_total
    }
}

impl Chain {
    pub fn seeded() -> Self {
        Chain {
            blocks: vec![Block::genesis()],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Duplicate rule from the ingest pipeline: same index or same hash.
    pub fn is_duplicate(&self, block: &Block) -> bool {
        self.blocks
            .iter()
            .any(|b| b.index == block.index || b.hash == block.hash)
    }

    pub fn find_by_hash(&self, hash: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.hash == hash)
    }

    pub fn history_for_plate(&self, plate: &str) -> Vec<&Block> {
        self.blocks
            .iter()
            .filter(|b| b.tx.plate == plate)
            .collect()
    }

    /// Recharges of `plate` not yet settled by a payment. A payment
    /// settles the first unsettled recharge with the same
    /// (point, amount, operator), walking the ledger in order, so a second
    /// identical payment never double-settles.
    pub fn pending_recharges(&self, plate: &str) -> Vec<Transaction> {
        let mut recharges: Vec<(Transaction, bool)> = Vec::new();
        for block in &self.blocks {
            if block.tx.plate != plate {
                continue;
            }
            match block.tx.kind {
                TxKind::Recharge => recharges.push((block.tx.clone(), false)),
                TxKind::Payment => {
                    if let Some(slot) = recharges
                        .iter_mut()
                        .find(|(r, settled)| !settled && block.tx.settles(r))
                    {
                        slot.1 = true;
                    }
                }
                _ => {}
            }
        }
        recharges
            .into_iter()
            .filter(|(_, settled)| !settled)
            .map(|(tx, _)| tx)
            .collect()
    }

    pub fn summary_for_plate(&self, plate: &str) -> PlateSummary {
        let mut out = PlateSummary::default();
        for block in self.history_for_plate(plate) {
            match block.tx.kind {
                TxKind::Recharge => {
                    out.recharges += 1;
                    out.recharged_total += block.tx.amount;
                }
                TxKind::Payment => {
                    out.payments += 1;
                    out.paid_total += block.tx.amount;
                }
                _ => {}
            }
        }
        out
    }
}
