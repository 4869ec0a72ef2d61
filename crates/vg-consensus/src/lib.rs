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

//! Validation rules shared by the ingest pipeline, the write path and the
//! sync engine: signature-inclusive block validation, full-chain
//! validation and the strictly-longer adoption rule.

use core::fmt;
use std::path::{Path, PathBuf};
use vg_types::{Block, BlockError, Chain};

/// Resolves an author id to its public key file. Key files follow the
/// fixed federation layout `<dir>/empresa_<id>_public.pem`, shared among
/// operators of one deployment.
#[derive(Clone, Debug)]
pub struct KeyDirectory {
    dir: PathBuf,
}

impl KeyDirectory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn public_key_path(&self, author: &str) -> PathBuf {
        self.dir.join(format!("empresa_{author}_public.pem"))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ValidationError {
    Structure(BlockError),
    Signature { author: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structure(e) => write!(f, "structure: {e}"),
            Self::Signature { author } => write!(f, "signature by {author} invalid"),
        }
    }
}

impl std::error::Error for ValidationError {}
impl From<BlockError> for ValidationError {
    fn from(e: BlockError) -> Self {
        Self::Structure(e)
    }
}

/// Full validation of a non-genesis block against its predecessor:
/// structural link plus an RSA signature by the block's author.
pub fn validate_block(
    block: &Block,
    predecessor: &Block,
    keys: &KeyDirectory,
) -> Result<(), ValidationError> {
    block.validate_against(predecessor)?;
    let pub_path = keys.public_key_path(&block.author);
    if !vg_crypto::verify_hash(&block.hash, &block.signature, &pub_path) {
        return Err(ValidationError::Signature {
            author: block.author.clone(),
        });
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChainInvalid {
    pub index: u64,
    pub reason: ValidationError,
}

impl fmt::Display for ChainInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block index [{}]: {}", self.index, self.reason)
    }
}

impl std::error::Error for ChainInvalid {}

/// Walk the whole chain pairwise. Genesis is assumed valid and carries no
/// signature.
pub fn validate_full_chain(chain: &Chain, keys: &KeyDirectory) -> Result<(), ChainInvalid> {
    for pair in chain.blocks.windows(2) {
        let [predecessor, block] = pair else { continue };
        validate_block(block, predecessor, keys).map_err(|reason| ChainInvalid {
            index: block.index,
            reason,
        })?;
    }
    Ok(())
}

/// Outcome of offering one candidate block to the serial ingest pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
    Rejected(ChainInvalid),
}

/// Ingest decision for a candidate against the current chain. Duplicate
/// index or hash wins over validation; fork resolution is not done here
/// (a block colliding with the tail's index is a duplicate) but by the
/// sync engine's adoption rule.
pub fn evaluate_ingest(chain: &Chain, block: &Block, keys: &KeyDirectory) -> IngestOutcome {
    if chain.is_duplicate(block) {
        return IngestOutcome::Duplicate;
    }
    let Some(tip) = chain.tip() else {
        return IngestOutcome::Rejected(ChainInvalid {
            index: block.index,
            reason: ValidationError::Structure(BlockError::PreviousHashMismatch),
        });
    };
    match validate_block(block, tip, keys) {
        Ok(()) => IngestOutcome::Accepted,
        Err(reason) => IngestOutcome::Rejected(ChainInvalid {
            index: block.index,
            reason,
        }),
    }
}

/// Adoption rule used by startup sync and `/sincronizar`: a remote chain
/// replaces the local one iff it is strictly longer and fully valid.
pub fn should_adopt(local: &Chain, remote: &Chain, keys: &KeyDirectory) -> bool {
    remote.len() > local.len() && validate_full_chain(remote, keys).is_ok()
}

/// Equal-length chains whose tails carry the same hash are already in
/// sync; nothing to pull.
pub fn tails_match(local: &Chain, remote: &Chain) -> bool {
    match (local.tip(), remote.tip()) {
        (Some(a), Some(b)) => local.len() == remote.len() && a.hash == b.hash,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vg_types::Transaction;

    struct Fixture {
        _dir: TempDir,
        keys: KeyDirectory,
        priv_001: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let keys = KeyDirectory::new(dir.path().to_path_buf());
        let priv_001 = dir.path().join("empresa_001_private.pem");
        vg_crypto::generate_keypair(&priv_001, &keys.public_key_path("001")).expect("keygen");
        Fixture {
            _dir: dir,
            keys,
            priv_001,
        }
    }

    fn signed_block(fx: &Fixture, chain: &Chain, tx: Transaction) -> Block {
        let tip = chain.tip().expect("tip");
        let mut block = Block::forge(tx, tip, "001", "10:00:00 01/06/2025".to_string());
        block.signature = vg_crypto::sign_hash(&block.hash, &fx.priv_001).expect("sign");
        block
    }

    #[test]
    fn signed_chain_validates() {
        let fx = fixture();
        let mut chain = Chain::seeded();
        let b1 = signed_block(&fx, &chain, Transaction::reservation("ABC1234", "Salvador", "001"));
        chain.blocks.push(b1);
        let b2 = signed_block(&fx, &chain, Transaction::recharge("ABC1234", "Salvador", 42.5, "001"));
        chain.blocks.push(b2);

        assert!(validate_full_chain(&chain, &fx.keys).is_ok());
    }

    #[test]
    fn tampered_block_reported_with_index() {
        let fx = fixture();
        let mut chain = Chain::seeded();
        for point in ["Salvador", "Aracaju"] {
            let b = signed_block(&fx, &chain, Transaction::reservation("ABC1234", point, "001"));
            chain.blocks.push(b);
        }
        if let Some(b) = chain.blocks.get_mut(2) {
            b.hash = "00".repeat(32);
        }

        let err = validate_full_chain(&chain, &fx.keys).expect_err("invalid");
        assert_eq!(err.index, 2);
    }

    #[test]
    fn foreign_signature_rejected() {
        let fx = fixture();
        let mut chain = Chain::seeded();
        let mut b = signed_block(&fx, &chain, Transaction::reservation("ABC1234", "Salvador", "001"));
        // signed by 001 but claiming another author whose key differs
        let other_priv = fx.keys.dir().join("empresa_002_private.pem");
        vg_crypto::generate_keypair(&other_priv, &fx.keys.public_key_path("002")).expect("keygen");
        b.author = "002".to_string();
        b.hash = b.compute_hash();
        chain.blocks.push(b.clone());

        let err = validate_full_chain(&chain, &fx.keys).expect_err("invalid");
        assert_eq!(
            err.reason,
            ValidationError::Signature { author: "002".to_string() }
        );
    }

    #[test]
    fn ingest_dedupes_then_validates() {
        let fx = fixture();
        let mut chain = Chain::seeded();
        let b1 = signed_block(&fx, &chain, Transaction::reservation("ABC1234", "Salvador", "001"));

        assert_eq!(evaluate_ingest(&chain, &b1, &fx.keys), IngestOutcome::Accepted);
        chain.blocks.push(b1.clone());
        assert_eq!(evaluate_ingest(&chain, &b1, &fx.keys), IngestOutcome::Duplicate);

        // stale candidate built against the old tail collides on index
        let mut stale = b1.clone();
        stale.tx.plate = "XYZ9999".to_string();
        stale.hash = stale.compute_hash();
        stale.signature = vg_crypto::sign_hash(&stale.hash, &fx.priv_001).expect("sign");
        assert_eq!(evaluate_ingest(&chain, &stale, &fx.keys), IngestOutcome::Duplicate);

        let unsigned = Block::forge(
            Transaction::reservation("XYZ9999", "Aracaju", "001"),
            chain.tip().expect("tip"),
            "001",
            "10:00:01 01/06/2025".to_string(),
        );
        assert!(matches!(
            evaluate_ingest(&chain, &unsigned, &fx.keys),
            IngestOutcome::Rejected(_)
        ));
    }

    #[test]
    fn adoption_needs_strictly_longer_and_valid() {
        let fx = fixture();
        let mut local = Chain::seeded();
        let mut remote = Chain::seeded();
        assert!(!should_adopt(&local, &remote, &fx.keys));
        assert!(tails_match(&local, &remote));

        let b = signed_block(&fx, &remote, Transaction::reservation("ABC1234", "Salvador", "001"));
        remote.blocks.push(b);
        assert!(should_adopt(&local, &remote, &fx.keys));
        assert!(!tails_match(&local, &remote));

        // equal length, diverged tail: not adopted here (no fork choice)
        let b2 = signed_block(&fx, &local, Transaction::reservation("XYZ9999", "Salvador", "001"));
        local.blocks.push(b2);
        assert!(!should_adopt(&local, &remote, &fx.keys));

        // longer but invalid: refused
        let mut forged = remote.clone();
        let bad = Block::forge(
            Transaction::reservation("XYZ9999", "Aracaju", "001"),
            forged.tip().expect("tip"),
            "001",
            "10:00:02 01/06/2025".to_string(),
        );
        forged.blocks.push(bad);
        assert!(!should_adopt(&local, &forged, &fx.keys));
    }
}
