// SPDX-License-Identifier: AGPL-3.0-only

//! Startup synchronisation: wait until every peer answers, self-repair a
//! corrupted local chain from the first peer with a fully valid one, then
//! run best-effort catch-up rounds adopting strictly longer valid chains.

use crate::node::Node;
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use vg_consensus::{should_adopt, tails_match, validate_full_chain};

const BARRIER_POLL: Duration = Duration::from_secs(1);
const ROUND_SLEEP: Duration = Duration::from_secs(10);
const MAX_ROUNDS: usize = 3;

/// Block until every other operator answers its read endpoint.
pub async fn wait_for_peers(node: &Arc<Node>) {
    loop {
        let mut all_up = true;
        for (peer_id, base_url) in node.config.registry.others(node.operator_id()) {
            if !node.peer_client.is_healthy(base_url).await {
                info!(peer = peer_id, "peer not available yet, retrying");
                all_up = false;
                break;
            }
        }
        if all_up {
            info!("all peers available");
            return;
        }
        tokio::time::sleep(BARRIER_POLL).await;
    }
}

/// Validate the local chain; on corruption adopt the first fully valid
/// peer chain. Failing that, the node must not serve writes.
pub async fn ensure_valid_chain(node: &Arc<Node>) -> Result<()> {
    {
        let ledger = node.ledger.lock().await;
        match validate_full_chain(&ledger.chain, &node.keys) {
            Ok(()) => return Ok(()),
            Err(e) => warn!(%e, "local chain corrupted, trying peer repair"),
        }
    }

    for (peer_id, base_url) in node.config.registry.others(node.operator_id()) {
        info!(peer = peer_id, "fetching chain for repair");
        let remote = match node.peer_client.fetch_chain(base_url).await {
            Ok(chain) => chain,
            Err(e) => {
                warn!(peer = peer_id, error = %e, "repair fetch failed");
                continue;
            }
        };
        if let Err(e) = validate_full_chain(&remote, &node.keys) {
            warn!(peer = peer_id, %e, "peer chain invalid, skipping");
            continue;
        }
        let mut ledger = node.ledger.lock().await;
        ledger.replace_and_save(remote)?;
        info!(peer = peer_id, len = ledger.chain.len(), "chain repaired from peer");
        return Ok(());
    }
    bail!("local chain invalid and no peer offered a valid replacement");
}

/// Up to three catch-up rounds; a round that adopts something ends the
/// loop early. Equal-length chains with matching tails are already in
/// sync.
pub async fn catch_up(node: &Arc<Node>) {
    info!("synchronising chain with peers");
    for round in 1..=MAX_ROUNDS {
        let mut adopted = false;
        for (peer_id, base_url) in node.config.registry.others(node.operator_id()) {
            let remote = match node.peer_client.fetch_chain(base_url).await {
                Ok(chain) => chain,
                Err(e) => {
                    warn!(peer = peer_id, error = %e, "sync fetch failed");
                    continue;
                }
            };
            let push_back = {
                let mut ledger = node.ledger.lock().await;
                if tails_match(&ledger.chain, &remote) {
                    continue;
                }
                if should_adopt(&ledger.chain, &remote, &node.keys) {
                    match ledger.replace_and_save(remote) {
                        Ok(()) => {
                            info!(peer = peer_id, len = ledger.chain.len(), "chain adopted from peer");
                            adopted = true;
                        }
                        Err(e) => warn!(peer = peer_id, error = %e, "persist adopted chain failed"),
                    }
                    None
                } else if remote.len() < ledger.chain.len() {
                    // the peer lags; offer it our chain over /sincronizar
                    Some(ledger.chain.clone())
                } else {
                    None
                }
            };
            if let Some(local) = push_back {
                match node.peer_client.push_chain(base_url, &local).await {
                    Ok(status) => info!(peer = peer_id, %status, "offered chain to lagging peer"),
                    Err(e) => warn!(peer = peer_id, error = %e, "chain offer failed"),
                }
            }
        }
        if adopted {
            break;
        }
        if round < MAX_ROUNDS {
            tokio::time::sleep(ROUND_SLEEP).await;
        }
    }
    info!("chain synchronisation finished");
}

/// Full startup sequence, run in the background once the API is bound.
/// An unrepairable chain is fatal for the process.
pub async fn startup(node: Arc<Node>) {
    wait_for_peers(&node).await;
    if let Err(e) = ensure_valid_chain(&node).await {
        error!(%e, "chain unrecoverable");
        std::process::exit(1);
    }
    catch_up(&node).await;
}
