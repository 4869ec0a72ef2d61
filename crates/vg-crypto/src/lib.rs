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

//! Signature infrastructure for the operator federation: SHA-256 digests
//! and RSA-2048 PKCS#1 v1.5 signatures over PEM key files on disk.
//!
//! The signing scheme hashes the ASCII hex form of the block hash (not the
//! canonical block bytes). Every operator on the wire does the same, so it
//! is kept bit-for-bit.

use core::fmt;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const RSA_BITS: usize = 2048;

#[derive(Debug)]
pub enum CryptoError {
    Io(std::io::Error),
    Pem(String),
    Key(String),
    Signature(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "key file io: {e}"),
            Self::Pem(e) => write!(f, "pem encoding: {e}"),
            Self::Key(e) => write!(f, "key material: {e}"),
            Self::Signature(e) => write!(f, "signature: {e}"),
        }
    }
}

impl std::error::Error for CryptoError {}
impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// SHA-256 over raw bytes, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Generate an RSA-2048 keypair and persist both halves as PKCS#1 PEM.
/// The private key file is owner-read-only, the public key world-readable.
/// Callers invoke this once, when the private key file is absent.
pub fn generate_keypair(priv_path: &Path, pub_path: &Path) -> Result<(), CryptoError> {
    let mut rng = rand::thread_rng();
    let private =
        RsaPrivateKey::new(&mut rng, RSA_BITS).map_err(|e| CryptoError::Key(e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let priv_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Pem(e.to_string()))?;
    std::fs::write(priv_path, priv_pem.as_bytes())?;
    set_mode(priv_path, 0o600)?;

    let pub_pem = public
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Pem(e.to_string()))?;
    std::fs::write(pub_path, pub_pem.as_bytes())?;
    set_mode(pub_path, 0o644)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), CryptoError> {
    Ok(())
}

/// Sign a block hash with the operator's private key file.
/// Digest is SHA-256 over the ASCII bytes of the hex hash string; the
/// signature is returned as lowercase hex.
pub fn sign_hash(hash: &str, priv_path: &Path) -> Result<String, CryptoError> {
    let pem = std::fs::read_to_string(priv_path)?;
    let private =
        RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
    let digest = Sha256::digest(hash.as_bytes());
    let sig = private
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::Signature(e.to_string()))?;
    Ok(hex::encode(sig))
}

/// Verify a hex signature over a block hash against a public key file.
/// Any io/parse failure counts as an invalid signature.
pub fn verify_hash(hash: &str, sig_hex: &str, pub_path: &Path) -> bool {
    let pem = match std::fs::read_to_string(pub_path) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let public = match RsaPublicKey::from_pkcs1_pem(&pem) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig = match hex::decode(sig_hex) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let digest = Sha256::digest(hash.as_bytes());
    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &sig)
        .is_ok()
}
