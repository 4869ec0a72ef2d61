// SPDX-License-Identifier: AGPL-3.0-only

//! Serial ingest of peer blocks. Producers (the `/bloco` handler and the
//! bus) enqueue into a bounded channel and block when it is full; exactly
//! one consumer drains it, so chain appends from the network are totally
//! ordered. A rejected block is logged and dropped, never an error for
//! the loop.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vg_consensus::IngestOutcome;
use vg_types::Block;

/// Bounded buffer size; producers awaiting a full buffer is the intended
/// back-pressure.
pub const INGEST_CAPACITY: usize = 100;

/// The node side of the pipeline: dedupe, validate against the current
/// tail, and on success append + persist, all under the ledger lock.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn accept(&self, block: Block) -> IngestOutcome;
}

#[derive(Clone)]
pub struct IngestService {
    tx: mpsc::Sender<Block>,
}

impl IngestService {
    /// Enqueue a candidate block; waits while the buffer is full and
    /// fails only when the consumer is gone.
    pub async fn enqueue(&self, block: Block) -> Result<(), crate::NetError> {
        self.tx
            .send(block)
            .await
            .map_err(|_| crate::NetError::Transport("ingest consumer gone".to_string()))
    }
}

/// Start the single consumer; the returned handle lives as long as the
/// process.
pub fn spawn_ingest(sink: Arc<dyn BlockSink>) -> (IngestService, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Block>(INGEST_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(block) = rx.recv().await {
            let index = block.index;
            let author = block.author.clone();
            match sink.accept(block).await {
                IngestOutcome::Accepted => {
                    info!(author, index, "block ACCEPTED");
                }
                IngestOutcome::Duplicate => {
                    warn!(author, index, "block rejected as duplicate");
                }
                IngestOutcome::Rejected(reason) => {
                    warn!(author, index, %reason, "block REJECTED");
                }
            }
        }
    });
    (IngestService { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::Mutex;
    use vg_consensus::{evaluate_ingest, KeyDirectory};
    use vg_types::{Chain, Transaction};

    struct ChainSink {
        chain: Mutex<Chain>,
        keys: KeyDirectory,
        seen: Mutex<Vec<(u64, &'static str)>>,
    }

    #[async_trait]
    impl BlockSink for ChainSink {
        async fn accept(&self, block: Block) -> IngestOutcome {
            let mut chain = self.chain.lock().await;
            let outcome = evaluate_ingest(&chain, &block, &self.keys);
            if outcome == IngestOutcome::Accepted {
                chain.blocks.push(block.clone());
            }
            let tag = match &outcome {
                IngestOutcome::Accepted => "accepted",
                IngestOutcome::Duplicate => "duplicate",
                IngestOutcome::Rejected(_) => "rejected",
            };
            self.seen.lock().await.push((block.index, tag));
            outcome
        }
    }

    #[tokio::test]
    async fn serial_consumer_appends_in_order_and_dedupes() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let keys = KeyDirectory::new(dir.path().to_path_buf());
        let priv_path: PathBuf = dir.path().join("empresa_001_private.pem");
        vg_crypto::generate_keypair(&priv_path, &keys.public_key_path("001")).expect("keygen");

        let mut chain = Chain::seeded();
        let mut blocks = Vec::new();
        for point in ["Salvador", "Aracaju", "Maceio"] {
            let tip = chain.tip().expect("tip").clone();
            let mut b = Block::forge(
                Transaction::reservation("ABC1234", point, "001"),
                &tip,
                "001",
                "10:00:00 01/06/2025".to_string(),
            );
            b.signature = vg_crypto::sign_hash(&b.hash, &priv_path).expect("sign");
            chain.blocks.push(b.clone());
            blocks.push(b);
        }

        let sink = Arc::new(ChainSink {
            chain: Mutex::new(Chain::seeded()),
            keys,
            seen: Mutex::new(Vec::new()),
        });
        let (service, handle) = spawn_ingest(sink.clone());

        for b in &blocks {
            service.enqueue(b.clone()).await.expect("enqueue");
        }
        // replay of the first block must be flagged as duplicate
        if let Some(first) = blocks.first() {
            service.enqueue(first.clone()).await.expect("enqueue");
        }
        drop(service);
        handle.await.expect("consumer");

        assert_eq!(sink.chain.lock().await.len(), 4);
        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last(), Some(&(1, "duplicate")));
    }
}
