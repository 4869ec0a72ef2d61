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

//! On-disk state of one operator: the chain file, the point-control file
//! and the operator profile. Every save is a pretty-printed JSON
//! whole-file replace through a temp file in the same directory.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use vg_types::Chain;

/// Disk status string of a held reservation; a free point simply has no
/// record.
pub const RESERVED_STATUS: &str = "RESERVADO";

#[derive(Debug)]
pub enum StoreError {
    NotFound(PathBuf),
    Empty(PathBuf),
    Parse { path: PathBuf, detail: String },
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(p) => write!(f, "file not found: {}", p.display()),
            Self::Empty(p) => write!(f, "file empty: {}", p.display()),
            Self::Parse { path, detail } => write!(f, "parse {}: {detail}", path.display()),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, data)?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let raw = match std::fs::read(path) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(StoreError::Io(e)),
    };
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(StoreError::Empty(path.to_path_buf()));
    }
    serde_json::from_slice(&raw).map_err(|e| StoreError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    write_atomic(path, &data)
}

// ============================
// Chain file
// ============================

pub struct ChainFile {
    path: PathBuf,
}

impl ChainFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the chain. An absent file and an empty one are distinct
    /// failures; a chain with zero blocks counts as empty.
    pub fn load(&self) -> Result<Chain, StoreError> {
        let chain: Chain = read_json(&self.path)?;
        if chain.is_empty() {
            return Err(StoreError::Empty(self.path.clone()));
        }
        Ok(chain)
    }

    pub fn save(&self, chain: &Chain) -> Result<(), StoreError> {
        save_json(&self.path, chain)
    }

    /// Load, seeding a fresh genesis chain when the file is absent or
    /// empty. Parse failures propagate; the caller decides whether a
    /// peer repair is possible.
    pub fn load_or_seed(&self) -> Result<Chain, StoreError> {
        match self.load() {
            Ok(chain) => Ok(chain),
            Err(StoreError::NotFound(_)) | Err(StoreError::Empty(_)) => {
                let chain = Chain::seeded();
                self.save(&chain)?;
                Ok(chain)
            }
            Err(e) => Err(e),
        }
    }
}

// ============================
// Point control file
// ============================

/// One held reservation, authoritative under the owning per-point lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointRecord {
    #[serde(rename = "placa")]
    pub plate: String,
    #[serde(rename = "timestamp_reserva")]
    pub reserved_at: String,
    pub status: String,
    #[serde(rename = "hash_reserva")]
    pub reservation_hash: String,
}

impl PointRecord {
    pub fn reserved(plate: &str, reserved_at: String) -> Self {
        Self {
            plate: plate.to_string(),
            reserved_at,
            status: RESERVED_STATUS.to_string(),
            reservation_hash: String::new(),
        }
    }
}

pub struct PointControlFile {
    path: PathBuf,
}

impl PointControlFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// An absent file means no reservations yet.
    pub fn load(&self) -> Result<HashMap<String, PointRecord>, StoreError> {
        match read_json(&self.path) {
            Ok(map) => Ok(map),
            Err(StoreError::NotFound(_)) | Err(StoreError::Empty(_)) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, records: &HashMap<String, PointRecord>) -> Result<(), StoreError> {
        save_json(&self.path, records)
    }
}

// ============================
// Operator profile
// ============================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorProfile {
    pub id: String,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(default)]
    pub api: String,
    #[serde(rename = "saldo_atual", default)]
    pub balance: f64,
    #[serde(rename = "placas", default)]
    pub plates: HashMap<String, bool>,
    #[serde(rename = "pontos", default)]
    pub points: Vec<String>,
}

pub struct OperatorProfileFile {
    path: PathBuf,
}

impl OperatorProfileFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<OperatorProfile, StoreError> {
        read_json(&self.path)
    }

    pub fn save(&self, profile: &OperatorProfile) -> Result<(), StoreError> {
        save_json(&self.path, profile)
    }
}

/// Conventional per-operator file locations under a data directory.
pub struct DataLayout {
    pub dir: PathBuf,
}

impl DataLayout {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn chain_file(&self, operator_id: &str) -> ChainFile {
        ChainFile::new(self.dir.join(format!("chain_{operator_id}.json")))
    }

    pub fn point_control_file(&self, operator_id: &str) -> PointControlFile {
        PointControlFile::new(self.dir.join(format!("controle_pontos_{operator_id}.json")))
    }

    pub fn profile_file(&self, operator_id: &str) -> OperatorProfileFile {
        OperatorProfileFile::new(self.dir.join(format!("empresa_{operator_id}.json")))
    }

    pub fn private_key(&self, operator_id: &str) -> PathBuf {
        self.dir.join(format!("empresa_{operator_id}_private.pem"))
    }

    pub fn public_key(&self, operator_id: &str) -> PathBuf {
        self.dir.join(format!("empresa_{operator_id}_public.pem"))
    }
}
