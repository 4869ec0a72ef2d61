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

//! Vehicle-side coordinator: maps points to their operators and runs the
//! all-or-nothing multi-point reservation over the federation's REST
//! surface, with compensating cancellations on partial failure. Also the
//! settlement helpers (pending recharges, payments) and cross-operator
//! hash verification.

use core::fmt;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};
use vg_net::{NetError, PeerClient, PeerRegistry};
use vg_types::{Block, Chain, PlateSummary, Transaction};

#[derive(Debug)]
pub enum CoordinatorError {
    /// A requested point maps to no operator; nothing was reserved.
    UnknownPoint(String),
    /// A reservation failed; every previously obtained reservation was
    /// compensated with a cancel request.
    TripAborted { point: String, reason: String },
    /// No operator answered a read request.
    NoOperatorReachable,
    Net(NetError),
    Rejected { status: u16, message: String },
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPoint(p) => write!(f, "point {p} is not served by any operator"),
            Self::TripAborted { point, reason } => {
                write!(f, "trip aborted at {point}: {reason}; partial reservations canceled")
            }
            Self::NoOperatorReachable => f.write_str("no operator reachable"),
            Self::Net(e) => write!(f, "network: {e}"),
            Self::Rejected { status, message } => write!(f, "rejected ({status}): {message}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}
impl From<NetError> for CoordinatorError {
    fn from(e: NetError) -> Self {
        Self::Net(e)
    }
}

/// Node reply to the write endpoints.
#[derive(Debug, Deserialize)]
struct WriteReply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct HashLookupReply {
    #[serde(default)]
    encontrado: bool,
    #[serde(rename = "bloco")]
    block: Option<Block>,
}

#[derive(Debug, Deserialize)]
struct CancelReply {
    #[serde(rename = "cancelados", default)]
    canceled: usize,
}

pub struct Coordinator {
    client: PeerClient,
    registry: PeerRegistry,
    point_operators: BTreeMap<String, String>,
}

impl Coordinator {
    pub fn new(registry: PeerRegistry, point_operators: BTreeMap<String, String>) -> Self {
        Self {
            client: PeerClient::new(),
            registry,
            point_operators,
        }
    }

    /// The reference federation topology.
    pub fn reference() -> Self {
        Self::new(PeerRegistry::reference(), vg_net::reference_point_operators())
    }

    fn operator_base(&self, point: &str) -> Result<(&str, &str), CoordinatorError> {
        let operator = self
            .point_operators
            .get(point)
            .ok_or_else(|| CoordinatorError::UnknownPoint(point.to_string()))?;
        let base = self
            .registry
            .base_url(operator)
            .ok_or_else(|| CoordinatorError::UnknownPoint(point.to_string()))?;
        Ok((operator.as_str(), base))
    }

    async fn post_write(
        &self,
        base: &str,
        path: &str,
        tx: &Transaction,
    ) -> Result<String, CoordinatorError> {
        let (status, body) = self.client.post_json(&format!("{base}{path}"), tx).await?;
        let reply: WriteReply = serde_json::from_slice(&body).unwrap_or(WriteReply {
            status: String::new(),
            hash: String::new(),
            message: String::new(),
        });
        if status.as_u16() == 201 && !reply.hash.is_empty() {
            Ok(reply.hash)
        } else {
            Err(CoordinatorError::Rejected {
                status: status.as_u16(),
                message: if reply.message.is_empty() {
                    reply.status
                } else {
                    reply.message
                },
            })
        }
    }

    /// Reserve a single point at its owning operator.
    pub async fn reserve(&self, plate: &str, point: &str) -> Result<String, CoordinatorError> {
        let (operator, base) = self.operator_base(point)?;
        let tx = Transaction::reservation(plate, point, operator);
        self.post_write(base, "/reserva", &tx).await
    }

    /// All-or-nothing multi-point reservation. Phase 1 maps every point
    /// to its operator and fails fast on an unknown one; phase 2 reserves
    /// point by point, and the first failure triggers compensating
    /// cancels for everything already obtained.
    pub async fn reserve_route(
        &self,
        plate: &str,
        points: &[String],
    ) -> Result<BTreeMap<String, String>, CoordinatorError> {
        for point in points {
            self.operator_base(point)?;
        }

        let mut confirmed: BTreeMap<String, String> = BTreeMap::new();
        for point in points {
            match self.reserve(plate, point).await {
                Ok(hash) => {
                    info!(plate, point, hash, "point reserved");
                    confirmed.insert(point.clone(), hash);
                }
                Err(e) => {
                    warn!(plate, point, error = %e, "reservation failed, compensating");
                    let held: Vec<String> = confirmed.keys().cloned().collect();
                    if let Err(cancel_err) = self.cancel(plate, &held).await {
                        warn!(plate, error = %cancel_err, "compensating cancel incomplete");
                    }
                    return Err(CoordinatorError::TripAborted {
                        point: point.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(confirmed)
    }

    /// Cancel reservations, grouped per owning operator. Returns how many
    /// points the operators released.
    pub async fn cancel(&self, plate: &str, points: &[String]) -> Result<usize, CoordinatorError> {
        let mut by_operator: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for point in points {
            let (operator, _) = self.operator_base(point)?;
            by_operator.entry(operator).or_default().push(point.clone());
        }
        let mut canceled = 0;
        for (operator, group) in by_operator {
            let Some(base) = self.registry.base_url(operator) else { continue };
            let body = serde_json::json!({ "placa_veiculo": plate, "pontos": group });
            let (status, bytes) = self
                .client
                .post_json(&format!("{base}/api/cancelamento"), &body)
                .await?;
            if status.as_u16() == 200 {
                let reply: CancelReply =
                    serde_json::from_slice(&bytes).unwrap_or(CancelReply { canceled: 0 });
                canceled += reply.canceled;
            }
        }
        Ok(canceled)
    }

    pub async fn recharge(
        &self,
        plate: &str,
        point: &str,
        amount: f64,
    ) -> Result<String, CoordinatorError> {
        let (operator, base) = self.operator_base(point)?;
        let tx = Transaction::recharge(plate, point, amount, operator);
        self.post_write(base, "/recarga", &tx).await
    }

    pub async fn pay(
        &self,
        plate: &str,
        point: &str,
        amount: f64,
        operator: &str,
    ) -> Result<String, CoordinatorError> {
        let base = self
            .registry
            .base_url(operator)
            .ok_or_else(|| CoordinatorError::UnknownPoint(point.to_string()))?;
        let tx = Transaction::payment(plate, point, amount, operator);
        self.post_write(base, "/pagamento", &tx).await
    }

    /// Fetch the chain from the first operator that answers.
    pub async fn fetch_chain(&self) -> Result<Chain, CoordinatorError> {
        for (operator, base) in self.registry.all() {
            match self.client.fetch_chain(base).await {
                Ok(chain) => return Ok(chain),
                Err(e) => warn!(operator, error = %e, "chain fetch failed"),
            }
        }
        Err(CoordinatorError::NoOperatorReachable)
    }

    /// Recharges of the plate not yet settled by a payment.
    pub async fn pending_recharges(
        &self,
        plate: &str,
    ) -> Result<Vec<Transaction>, CoordinatorError> {
        Ok(self.fetch_chain().await?.pending_recharges(plate))
    }

    /// Settle every pending recharge with one payment each; returns the
    /// (recharge, payment-hash) pairs in ledger order.
    pub async fn pay_pending(
        &self,
        plate: &str,
    ) -> Result<Vec<(Transaction, String)>, CoordinatorError> {
        let pending = self.pending_recharges(plate).await?;
        let mut settled = Vec::with_capacity(pending.len());
        for recharge in pending {
            let hash = self
                .pay(plate, &recharge.point, recharge.amount, &recharge.operator)
                .await?;
            info!(plate, point = recharge.point, amount = recharge.amount, hash, "recharge settled");
            settled.push((recharge, hash));
        }
        Ok(settled)
    }

    pub async fn history(&self, plate: &str) -> Result<Vec<Block>, CoordinatorError> {
        let chain = self.fetch_chain().await?;
        Ok(chain
            .history_for_plate(plate)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn status_summary(&self, plate: &str) -> Result<PlateSummary, CoordinatorError> {
        Ok(self.fetch_chain().await?.summary_for_plate(plate))
    }

    /// Ask every operator for the hash until one of them finds it.
    pub async fn verify_hash(
        &self,
        hash: &str,
    ) -> Result<Option<(String, Block)>, CoordinatorError> {
        let body = serde_json::json!({ "hash": hash });
        for (operator, base) in self.registry.all() {
            let reply = self
                .client
                .post_json(&format!("{base}/api/verificar-hash"), &body)
                .await;
            let (status, bytes) = match reply {
                Ok(r) => r,
                Err(e) => {
                    warn!(operator, error = %e, "hash lookup failed");
                    continue;
                }
            };
            if status.as_u16() != 200 {
                continue;
            }
            let lookup: HashLookupReply = match serde_json::from_slice(&bytes) {
                Ok(l) => l,
                Err(_) => continue,
            };
            if lookup.encontrado {
                if let Some(block) = lookup.block {
                    return Ok(Some((operator.to_string(), block)));
                }
            }
        }
        Ok(None)
    }
}
