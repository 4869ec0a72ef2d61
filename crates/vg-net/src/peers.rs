// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP client side of the federation: chain pulls, chain pushes, block
//! propagation with unanimous-consensus semantics, and generic JSON
//! helpers reused by the vehicle coordinator.

use crate::{NetError, PeerRegistry, CONSENSUS_TIMEOUT, PEER_TIMEOUT};
use core::fmt;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use vg_types::{Block, Chain};

#[derive(Debug)]
pub struct ConsensusFailure {
    pub peer: String,
    pub detail: String,
}

impl fmt::Display for ConsensusFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}: {}", self.peer, self.detail)
    }
}

impl std::error::Error for ConsensusFailure {}

#[derive(Clone)]
pub struct PeerClient {
    client: Client<HttpConnector>,
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn request_raw(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        deadline: Duration,
    ) -> Result<(StatusCode, Vec<u8>), NetError> {
        let mut builder = Request::builder().method(method).uri(url);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| NetError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(deadline, self.client.request(request))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| NetError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = tokio::time::timeout(deadline, hyper::body::to_bytes(response.into_body()))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| NetError::Transport(e.to_string()))?;
        Ok((status, bytes.to_vec()))
    }

    /// GET a JSON document; any non-2xx is an error.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, NetError> {
        let (status, bytes) = self.request_raw(Method::GET, url, None, PEER_TIMEOUT).await?;
        if !status.is_success() {
            return Err(NetError::Status(status.as_u16()));
        }
        serde_json::from_slice(&bytes).map_err(|e| NetError::Decode(e.to_string()))
    }

    /// POST a JSON body, returning status and raw response bytes without
    /// judging the status; callers map codes to their own semantics.
    pub async fn post_json<B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<(StatusCode, Vec<u8>), NetError> {
        let raw = serde_json::to_vec(body).map_err(|e| NetError::Decode(e.to_string()))?;
        self.request_raw(Method::POST, url, Some(raw), PEER_TIMEOUT)
            .await
    }

    /// Full chain of one peer.
    pub async fn fetch_chain(&self, base_url: &str) -> Result<Chain, NetError> {
        self.get_json(&format!("{base_url}/blockchain")).await
    }

    /// Liveness probe used by the startup barrier.
    pub async fn is_healthy(&self, base_url: &str) -> bool {
        matches!(
            self.request_raw(
                Method::GET,
                &format!("{base_url}/blockchain"),
                None,
                PEER_TIMEOUT
            )
            .await,
            Ok((status, _)) if status.is_success()
        )
    }

    /// Offer the local chain to a peer (`/sincronizar`); the peer adopts
    /// it only if strictly longer and valid.
    pub async fn push_chain(&self, base_url: &str, chain: &Chain) -> Result<StatusCode, NetError> {
        let raw = serde_json::to_vec(chain).map_err(|e| NetError::Decode(e.to_string()))?;
        let (status, _) = self
            .request_raw(
                Method::POST,
                &format!("{base_url}/sincronizar"),
                Some(raw),
                PEER_TIMEOUT,
            )
            .await?;
        Ok(status)
    }

    async fn offer_block(&self, base_url: &str, block: &Block) -> Result<StatusCode, NetError> {
        let raw = serde_json::to_vec(block).map_err(|e| NetError::Decode(e.to_string()))?;
        let (status, _) = self
            .request_raw(
                Method::POST,
                &format!("{base_url}/bloco"),
                Some(raw),
                CONSENSUS_TIMEOUT,
            )
            .await?;
        Ok(status)
    }

    /// Broadcast a candidate block and require unanimous acceptance.
    /// The first transport error or non-accepting status aborts the round
    /// and fails the write; only then may the originator commit locally.
    pub async fn propagate_with_consensus(
        &self,
        block: &Block,
        registry: &PeerRegistry,
        self_id: &str,
    ) -> Result<(), ConsensusFailure> {
        for (peer_id, base_url) in registry.others(self_id) {
            match self.offer_block(base_url, block).await {
                Ok(status) if status == StatusCode::OK || status == StatusCode::ACCEPTED => {
                    info!(peer = peer_id, index = block.index, "peer accepted block");
                }
                Ok(status) => {
                    warn!(peer = peer_id, %status, index = block.index, "peer rejected block");
                    return Err(ConsensusFailure {
                        peer: peer_id.to_string(),
                        detail: format!("status {status}"),
                    });
                }
                Err(e) => {
                    warn!(peer = peer_id, error = %e, index = block.index, "peer unreachable");
                    return Err(ConsensusFailure {
                        peer: peer_id.to_string(),
                        detail: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

}
