// SPDX-License-Identifier: AGPL-3.0-only

//! Node state and write orchestration. One `Node` value owns every piece
//! of shared state together with its concurrency primitive; handlers
//! receive it as `Arc<Node>` instead of reaching through globals.
//!
//! Lock order everywhere: per-point lock, then ledger lock, then the
//! reservation table. The ledger lock is dropped around peer I/O and
//! re-acquired to commit.

use crate::config::NodeConfig;
use async_trait::async_trait;
use core::fmt;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use vg_bus::{BusConnection, ClientReply};
use vg_consensus::{evaluate_ingest, IngestOutcome, KeyDirectory};
use vg_net::{BlockSink, ConsensusFailure, PeerClient};
use vg_store::{
    ChainFile, OperatorProfile, OperatorProfileFile, PointControlFile, PointRecord, StoreError,
};
use vg_types::{now_timestamp, Block, Chain, Transaction};

// ============================
// Errors
// ============================

#[derive(Debug)]
pub enum CommitError {
    /// Point not owned by this operator (reservation / cancellation).
    NotOwned(String),
    /// Point already reserved by another plate.
    Conflict(String),
    /// Candidate collides with an existing index or hash.
    Duplicate,
    /// The tail moved during propagation on every retry.
    Stale,
    /// A peer was unreachable or refused the candidate.
    Consensus(ConsensusFailure),
    /// Key material failure while signing.
    Crypto(vg_crypto::CryptoError),
    Store(StoreError),
    Internal(String),
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOwned(p) => write!(f, "point {p} is not operated here"),
            Self::Conflict(p) => write!(f, "point {p} already reserved"),
            Self::Duplicate => f.write_str("duplicate block"),
            Self::Stale => f.write_str("chain tail moved during propagation"),
            Self::Consensus(e) => write!(f, "consensus rejected: {e}"),
            Self::Crypto(e) => write!(f, "signature infrastructure: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Internal(e) => write!(f, "internal: {e}"),
        }
    }
}

impl std::error::Error for CommitError {}
impl From<StoreError> for CommitError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
impl From<vg_crypto::CryptoError> for CommitError {
    fn from(e: vg_crypto::CryptoError) -> Self {
        Self::Crypto(e)
    }
}

// ============================
// Ledger
// ============================

/// In-memory chain plus its file; append and persist happen under one
/// coarse lock.
pub struct Ledger {
    pub chain: Chain,
    file: ChainFile,
}

impl Ledger {
    pub fn new(chain: Chain, file: ChainFile) -> Self {
        Self { chain, file }
    }

    pub fn append_and_save(&mut self, block: Block) -> Result<(), StoreError> {
        self.chain.blocks.push(block);
        self.file.save(&self.chain)
    }

    pub fn replace_and_save(&mut self, chain: Chain) -> Result<(), StoreError> {
        self.chain = chain;
        self.file.save(&self.chain)
    }
}

// ============================
// Point table
// ============================

/// Per-point mutexes plus the point-control map and its file. The lock
/// set is created at startup from the owned points and never resized.
pub struct PointTable {
    locks: HashMap<String, Arc<Mutex<()>>>,
    records: RwLock<HashMap<String, PointRecord>>,
    file: PointControlFile,
}

impl PointTable {
    pub fn new(owned_points: &[String], file: PointControlFile) -> Result<Self, StoreError> {
        let records = file.load()?;
        let locks = owned_points
            .iter()
            .map(|p| (p.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Ok(Self {
            locks,
            records: RwLock::new(records),
            file,
        })
    }

    pub fn lock_for(&self, point: &str) -> Option<Arc<Mutex<()>>> {
        self.locks.get(point).cloned()
    }

    pub fn owned(&self) -> Vec<String> {
        self.locks.keys().cloned().collect()
    }

    fn save_records(&self, records: &HashMap<String, PointRecord>) -> Result<(), StoreError> {
        self.file.save(records)
    }

    /// Reserve a point for a plate. Idempotent for the holding plate;
    /// false when another plate holds it. Persisted before returning.
    /// Caller holds the per-point lock.
    pub fn mark_reserved(&self, point: &str, plate: &str) -> Result<bool, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "point table poisoned",
                ))
            })?;
        if let Some(existing) = records.get(point) {
            if existing.plate != plate {
                return Ok(false);
            }
        }
        records.insert(
            point.to_string(),
            PointRecord::reserved(plate, chrono::Utc::now().to_rfc3339()),
        );
        self.save_records(&records)?;
        Ok(true)
    }

    /// Attach the committed block hash to a held reservation.
    pub fn set_reservation_hash(&self, point: &str, plate: &str, hash: &str) {
        let Ok(mut records) = self.records.write() else { return };
        if let Some(record) = records.get_mut(point) {
            if record.plate == plate {
                record.reservation_hash = hash.to_string();
                if let Err(e) = self.save_records(&records) {
                    warn!(point, error = %e, "persist reservation hash failed");
                }
            }
        }
    }

    /// Remove the record iff held by `plate`. Caller holds the per-point
    /// lock.
    pub fn release(&self, point: &str, plate: &str) -> bool {
        let Ok(mut records) = self.records.write() else { return false };
        let held = matches!(records.get(point), Some(r) if r.plate == plate);
        if held {
            records.remove(point);
            if let Err(e) = self.save_records(&records) {
                warn!(point, error = %e, "persist point release failed");
            }
        }
        held
    }

    pub fn holder_of(&self, point: &str) -> Option<String> {
        let records = self.records.read().ok()?;
        records.get(point).map(|r| r.plate.clone())
    }
}

// ============================
// Metrics
// ============================

#[derive(Default)]
pub struct Metrics {
    pub blocks_accepted: AtomicU64,
    pub blocks_duplicate: AtomicU64,
    pub blocks_rejected: AtomicU64,
    pub consensus_failures: AtomicU64,
    pub bus_in: AtomicU64,
    pub bus_out: AtomicU64,
}

impl Metrics {
    pub fn render_prometheus(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let counters = [
            ("voltgrid_blocks_accepted_total", &self.blocks_accepted),
            ("voltgrid_blocks_duplicate_total", &self.blocks_duplicate),
            ("voltgrid_blocks_rejected_total", &self.blocks_rejected),
            ("voltgrid_consensus_failures_total", &self.consensus_failures),
            ("voltgrid_bus_in_total", &self.bus_in),
            ("voltgrid_bus_out_total", &self.bus_out),
        ];
        for (name, value) in counters {
            let _ = writeln!(&mut out, "# TYPE {name} counter");
            let _ = writeln!(&mut out, "{name} {}", value.load(Ordering::Relaxed));
        }
        out
    }
}

// ============================
// Node
// ============================

pub struct Node {
    pub config: NodeConfig,
    pub profile: Mutex<OperatorProfile>,
    profile_file: OperatorProfileFile,
    pub ledger: Mutex<Ledger>,
    pub points: PointTable,
    /// plate to point to state string, kept consistent with the point
    /// table inside the per-point lock.
    pub reservations: Mutex<HashMap<String, HashMap<String, String>>>,
    pub connectivity: RwLock<HashMap<String, bool>>,
    pub peer_client: PeerClient,
    pub keys: KeyDirectory,
    priv_key: std::path::PathBuf,
    bus: OnceCell<BusConnection>,
    pub metrics: Metrics,
}

pub const RESERVATION_STATE_CONFIRMED: &str = "confirmado";

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeConfig,
        profile: OperatorProfile,
        profile_file: OperatorProfileFile,
        ledger: Ledger,
        points: PointTable,
        keys: KeyDirectory,
        priv_key: std::path::PathBuf,
    ) -> Arc<Self> {
        let mut connectivity = HashMap::new();
        for point in points.owned() {
            connectivity.insert(point, true);
        }
        Arc::new(Self {
            config,
            profile: Mutex::new(profile),
            profile_file,
            ledger: Mutex::new(ledger),
            points,
            reservations: Mutex::new(HashMap::new()),
            connectivity: RwLock::new(connectivity),
            peer_client: PeerClient::new(),
            keys,
            priv_key,
            bus: OnceCell::new(),
            metrics: Metrics::default(),
        })
    }

    pub fn operator_id(&self) -> &str {
        &self.config.operator_id
    }

    pub fn owns_point(&self, point: &str) -> bool {
        self.points.lock_for(point).is_some()
    }

    pub fn set_bus(&self, bus: BusConnection) {
        let _ = self.bus.set(bus);
    }

    /// Publish a reply to the plate's topic; silently skipped while the
    /// bus is not connected yet.
    pub async fn publish_reply(&self, plate: &str, reply: &ClientReply) {
        if let Some(bus) = self.bus.get() {
            match bus.publish(&vg_bus::plate_topic(plate), &reply.to_wire()).await {
                Ok(()) => {
                    self.metrics.bus_out.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(plate, error = %e, "bus publish failed"),
            }
        }
    }

    // ---- ledger commit ----

    /// Build, sign, propagate with unanimous consensus and commit one
    /// transaction; both the HTTP handlers and the bus handlers come
    /// through here. The ledger lock is held while forging the candidate
    /// and again to commit; between the two the tail may move, in which
    /// case the signed candidate is stale and a fresh one is forged.
    pub async fn commit(&self, tx: Transaction) -> Result<String, CommitError> {
        const MAX_ATTEMPTS: usize = 3;
        for _attempt in 0..MAX_ATTEMPTS {
            let mut candidate = {
                let ledger = self.ledger.lock().await;
                let tip = ledger
                    .chain
                    .tip()
                    .ok_or_else(|| CommitError::Internal("chain has no tip".to_string()))?;
                let block = Block::forge(tx.clone(), tip, self.operator_id(), now_timestamp());
                if ledger.chain.is_duplicate(&block) {
                    return Err(CommitError::Duplicate);
                }
                block
            };
            candidate.signature = vg_crypto::sign_hash(&candidate.hash, &self.priv_key)?;

            if let Err(e) = self
                .peer_client
                .propagate_with_consensus(&candidate, &self.config.registry, self.operator_id())
                .await
            {
                self.metrics.consensus_failures.fetch_add(1, Ordering::Relaxed);
                return Err(CommitError::Consensus(e));
            }

            let mut ledger = self.ledger.lock().await;
            let tail_unchanged = ledger
                .chain
                .tip()
                .is_some_and(|tip| tip.hash == candidate.previous_hash);
            if tail_unchanged {
                let hash = candidate.hash.clone();
                ledger.append_and_save(candidate)?;
                info!(index = ledger.chain.len() - 1, hash, "block committed with consensus");
                return Ok(hash);
            }
            warn!(index = candidate.index, "tail moved during propagation, reforging");
        }
        Err(CommitError::Stale)
    }

    // ---- reservations ----

    /// Full reservation path shared by HTTP and the bus. Returns the
    /// committed block hash.
    pub async fn reserve(self: &Arc<Self>, plate: &str, point: &str) -> Result<String, CommitError> {
        let lock = self
            .points
            .lock_for(point)
            .ok_or_else(|| CommitError::NotOwned(point.to_string()))?;
        let _guard = lock.lock().await;

        if !self.points.mark_reserved(point, plate)? {
            return Err(CommitError::Conflict(point.to_string()));
        }

        let tx = Transaction::reservation(plate, point, self.operator_id());
        match self.commit(tx).await {
            Ok(hash) => {
                self.points.set_reservation_hash(point, plate, &hash);
                let mut reservations = self.reservations.lock().await;
                reservations
                    .entry(plate.to_string())
                    .or_default()
                    .insert(point.to_string(), RESERVATION_STATE_CONFIRMED.to_string());
                drop(reservations);
                self.spawn_reservation_timeout(plate.to_string(), point.to_string());
                info!(plate, point, hash, "reservation confirmed");
                Ok(hash)
            }
            Err(e) => {
                // roll the provisional mark back before surfacing the error
                self.release_point_locked(point, plate).await;
                Err(e)
            }
        }
    }

    /// Recharge is terminal for the reservation: after the block commits
    /// the point is released and the vehicle notified.
    pub async fn recharge(
        self: &Arc<Self>,
        plate: &str,
        point: &str,
        amount: f64,
    ) -> Result<String, CommitError> {
        let guard = match self.points.lock_for(point) {
            Some(lock) => Some(lock.lock_owned().await),
            None => None,
        };
        let tx = Transaction::recharge(plate, point, amount, self.operator_id());
        let hash = self.commit(tx).await?;
        if guard.is_some() {
            self.release_point_locked(point, plate).await;
            self.publish_reply(
                plate,
                &ClientReply::PointReleased {
                    point: point.to_string(),
                    reason: "Ponto liberado apos recarga".to_string(),
                },
            )
            .await;
        }
        info!(plate, point, amount, hash, "recharge recorded, point released");
        Ok(hash)
    }

    /// Payment settles a prior recharge; when it targets this operator
    /// the balance is updated and the profile persisted.
    pub async fn payment(
        &self,
        plate: &str,
        point: &str,
        amount: f64,
        target_operator: &str,
    ) -> Result<String, CommitError> {
        let tx = Transaction::payment(plate, point, amount, target_operator);
        let hash = self.commit(tx).await?;
        if target_operator == self.operator_id() {
            let mut profile = self.profile.lock().await;
            profile.balance += amount;
            self.profile_file.save(&profile)?;
            info!(plate, amount, balance = profile.balance, "payment settled");
        }
        Ok(hash)
    }

    /// Cancel any of `points` currently held by the plate; returns how
    /// many were released.
    pub async fn cancel(self: &Arc<Self>, plate: &str, points: &[String]) -> usize {
        let mut canceled = 0;
        for point in points {
            let Some(lock) = self.points.lock_for(point) else { continue };
            let _guard = lock.lock().await;
            let held = {
                let reservations = self.reservations.lock().await;
                reservations
                    .get(plate)
                    .is_some_and(|m| m.contains_key(point))
            } || self.points.holder_of(point).as_deref() == Some(plate);
            if held {
                self.release_point_locked(point, plate).await;
                canceled += 1;
                info!(plate, point, "reservation canceled");
            }
        }
        canceled
    }

    /// Release both the control record and the in-memory table. Caller
    /// holds the per-point lock.
    pub async fn release_point_locked(&self, point: &str, plate: &str) {
        self.points.release(point, plate);
        let mut reservations = self.reservations.lock().await;
        if let Some(points) = reservations.get_mut(plate) {
            points.remove(point);
            if points.is_empty() {
                reservations.remove(plate);
            }
        }
    }

    fn spawn_reservation_timeout(self: &Arc<Self>, plate: String, point: String) {
        let node = Arc::clone(self);
        let ttl = Duration::from_secs(node.config.reservation_ttl_secs);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(lock) = node.points.lock_for(&point) else { return };
            let _guard = lock.lock().await;
            let still_held = {
                let reservations = node.reservations.lock().await;
                reservations
                    .get(&plate)
                    .is_some_and(|m| m.contains_key(&point))
            };
            if still_held {
                node.release_point_locked(&point, &plate).await;
                warn!(plate, point, "reservation expired by timeout");
                node.publish_reply(
                    &plate,
                    &ClientReply::ReservationExpired {
                        point: point.clone(),
                        reason: "Reserva expirou por timeout".to_string(),
                    },
                )
                .await;
            }
        });
    }

    // ---- connectivity ----

    pub fn is_point_online(&self, point: &str) -> bool {
        self.connectivity
            .read()
            .ok()
            .and_then(|map| map.get(point).copied())
            .unwrap_or(false)
    }

    pub fn connectivity_snapshot(&self) -> HashMap<String, bool> {
        self.connectivity
            .read()
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    /// Apply a connectivity transition (monitor or STATUS_UPDATE). Going
    /// offline cancels every reservation held on the point.
    pub async fn apply_point_state(self: &Arc<Self>, point: &str, online: bool) {
        let previous = {
            let Ok(mut map) = self.connectivity.write() else { return };
            map.insert(point.to_string(), online)
        };
        if previous == Some(online) {
            return;
        }
        if online {
            info!(point, "point back online");
            return;
        }
        warn!(point, "point offline");
        self.cancel_reservations_on_offline_point(point).await;
    }

    async fn cancel_reservations_on_offline_point(self: &Arc<Self>, point: &str) {
        let Some(lock) = self.points.lock_for(point) else { return };
        let _guard = lock.lock().await;
        let Some(plate) = self.points.holder_of(point) else { return };
        self.release_point_locked(point, &plate).await;
        self.publish_reply(
            &plate,
            &ClientReply::ReservationCanceled {
                point: point.to_string(),
                reason: "Ponto offline".to_string(),
            },
        )
        .await;
        info!(plate, point, "reservation canceled, point offline");
    }

    /// 30-second sweep: drop reservations lingering on offline points.
    pub async fn run_monitor(self: Arc<Self>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.monitor_interval_secs));
        loop {
            tick.tick().await;
            for point in self.points.owned() {
                if !self.is_point_online(&point) {
                    self.cancel_reservations_on_offline_point(&point).await;
                }
            }
        }
    }
}

// ============================
// Ingest sink
// ============================

/// Chain side of the serial ingest pipeline: dedupe, validate, then
/// append and persist, all under the ledger lock.
pub struct NodeSink {
    node: Arc<Node>,
}

impl NodeSink {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl BlockSink for NodeSink {
    async fn accept(&self, block: Block) -> IngestOutcome {
        let mut ledger = self.node.ledger.lock().await;
        let outcome = evaluate_ingest(&ledger.chain, &block, &self.node.keys);
        match &outcome {
            IngestOutcome::Accepted => {
                if let Err(e) = ledger.append_and_save(block) {
                    warn!(error = %e, "persist ingested block failed");
                    return outcome;
                }
                self.node.metrics.blocks_accepted.fetch_add(1, Ordering::Relaxed);
            }
            IngestOutcome::Duplicate => {
                self.node.metrics.blocks_duplicate.fetch_add(1, Ordering::Relaxed);
            }
            IngestOutcome::Rejected(_) => {
                self.node.metrics.blocks_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }
}
