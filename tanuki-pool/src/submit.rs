//! Block assembly and submission.
//!
//! A winning share becomes a full block: header, transaction count, the
//! reconstructed coinbase (witness form when the template commits to
//! witnesses) and the template transactions. Every candidate is recorded
//! as a pending submission before the first `submitblock` attempt, so a
//! crash or node outage between discovery and acceptance can never lose a
//! block; the replayer retries pending records until the node takes them.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::error::Result;
use crate::job::Job;
use crate::rpc::NodeClient;
use crate::store::{
    FoundBlockLog, FoundBlockRecord, PendingSubmission, SubmissionStore, SubmissionStatus,
};
use crate::tracing::prelude::*;
use crate::validate::BlockCandidate;

/// Seam over the node RPC, for replay tests.
#[async_trait]
pub trait BlockSubmitRpc: Send + Sync + 'static {
    /// `None` means accepted; a string is the node's rejection reason.
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>>;
}

#[async_trait]
impl BlockSubmitRpc for NodeClient {
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>> {
        NodeClient::submit_block(self, block_hex).await
    }
}

/// Serialize the full block for `submitblock`.
pub fn assemble_block_hex(job: &Job, candidate: &BlockCandidate) -> Result<String> {
    let coinbase = job.coinbase.block_serialization(&candidate.extranonce)?;

    let mut block = Vec::with_capacity(
        80 + 9
            + coinbase.len()
            + job.template.transactions.iter().map(|tx| tx.raw.len()).sum::<usize>(),
    );
    block.extend_from_slice(&candidate.header);
    block.extend(codec::varint_encode(
        1 + job.template.transactions.len() as u64,
    ));
    block.extend_from_slice(&coinbase);
    for tx in &job.template.transactions {
        block.extend_from_slice(&tx.raw);
    }
    Ok(hex::encode(block))
}

/// A rejection string the node uses for blocks it already has; the
/// submission still achieved its purpose.
fn accepted(result: &Option<String>) -> bool {
    match result {
        None => true,
        Some(reason) => reason.starts_with("duplicate"),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Interval between replay scans.
const REPLAY_INTERVAL: Duration = Duration::from_secs(5);

/// Submits found blocks and replays pending submissions.
pub struct Submitter<R: BlockSubmitRpc> {
    rpc: Arc<R>,
    store: Arc<SubmissionStore>,
    found_log: FoundBlockLog,
    rpc_url: String,
    payout_addr: Option<String>,
}

impl<R: BlockSubmitRpc> Submitter<R> {
    pub fn new(
        rpc: Arc<R>,
        store: Arc<SubmissionStore>,
        found_log: FoundBlockLog,
        rpc_url: String,
        payout_addr: Option<String>,
    ) -> Self {
        Self {
            rpc,
            store,
            found_log,
            rpc_url,
            payout_addr,
        }
    }

    /// Submit a freshly found block.
    ///
    /// The pending record is persisted before the RPC call; on success the
    /// record flips to submitted and the found-blocks log gains an entry.
    pub async fn submit_found(
        &self,
        job: &Job,
        candidate: &BlockCandidate,
        worker: &str,
    ) -> Result<()> {
        let block_hex = assemble_block_hex(job, candidate)?;
        let record = PendingSubmission {
            timestamp: unix_now(),
            height: job.template.height,
            hash: candidate.hash_hex.clone(),
            worker: worker.to_string(),
            block_hex,
            rpc_error: None,
            rpc_url: Some(self.rpc_url.clone()),
            payout_addr: self.payout_addr.clone(),
            status: SubmissionStatus::Pending,
        };
        self.store.upsert(record.clone())?;

        info!(
            height = record.height,
            hash = %record.hash,
            worker = %record.worker,
            "BLOCK FOUND, submitting"
        );

        if self.attempt(record).await? {
            self.found_log.append(&FoundBlockRecord {
                created_at: unix_now(),
                payload: json!({
                    "height": job.template.height,
                    "hash": candidate.hash_hex,
                    "worker": worker,
                    "coinbase_value": job.template.coinbase_value,
                }),
            })?;
        }
        Ok(())
    }

    /// One submitblock attempt for a record; updates the store.
    async fn attempt(&self, mut record: PendingSubmission) -> Result<bool> {
        match self.rpc.submit_block(&record.block_hex).await {
            Ok(result) if accepted(&result) => {
                if let Some(reason) = &result {
                    debug!(hash = %record.hash, reason = %reason, "Node already had block");
                }
                record.status = SubmissionStatus::Submitted;
                record.rpc_error = None;
                self.store.upsert(record)?;
                Ok(true)
            }
            Ok(None) => {
                record.status = SubmissionStatus::Submitted;
                record.rpc_error = None;
                self.store.upsert(record)?;
                Ok(true)
            }
            Ok(Some(reason)) => {
                error!(hash = %record.hash, reason = %reason, "Node rejected block");
                record.rpc_error = Some(reason);
                self.store.upsert(record)?;
                Ok(false)
            }
            Err(e) => {
                warn!(hash = %record.hash, error = %e, "submitblock failed, will replay");
                record.rpc_error = Some(e.to_string());
                self.store.upsert(record)?;
                Ok(false)
            }
        }
    }

    /// One replay pass over the pending records. Returns attempts made.
    pub async fn replay_pending(&self, cancel: &CancellationToken) -> usize {
        let pending = self.store.pending();
        let mut attempts = 0;
        for record in pending {
            if cancel.is_cancelled() {
                break;
            }
            debug!(hash = %record.hash, height = record.height, "Replaying pending submission");
            attempts += 1;
            if let Err(e) = self.attempt(record).await {
                warn!(error = %e, "Replay attempt failed to persist");
            }
        }
        attempts
    }

    /// Background replayer; scans every five seconds until cancelled.
    pub async fn run_replayer(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Replayer stopping.");
                    return;
                }
                _ = tokio::time::sleep(REPLAY_INTERVAL) => {
                    self.replay_pending(&cancel).await;
                }
            }
        }
    }
}
