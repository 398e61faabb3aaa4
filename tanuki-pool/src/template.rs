//! Block template feed.
//!
//! Polls the node for `getblocktemplate` on a timer and on every ZMQ
//! `hashblock` wakeup, publishing the latest accepted template through a
//! watch channel. A second, slower poll of `getblockchaininfo` feeds the
//! sync snapshot used for health reporting. Transient RPC failures keep the
//! last good template; the job broadcaster consults [`SyncSnapshot::health`]
//! and withholds work while the feed is unhealthy.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::hash_types::{BlockHash, Txid};
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use zeromq::{Socket, SocketRecv};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::rpc::{GetBlockTemplate, NodeClient};
use crate::tracing::prelude::*;

/// A validated block template, immutable once accepted.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub height: i64,
    pub version: i32,
    pub prev_hash: BlockHash,
    pub curtime: u64,
    pub mintime: u64,
    pub bits: CompactTarget,
    pub coinbase_value: u64,
    pub transactions: Vec<TemplateTx>,
    /// Full witness-commitment scriptPubKey, when the template commits to
    /// segwit transactions
    pub witness_commitment: Option<Vec<u8>>,
    /// Concatenated coinbaseaux flags
    pub aux_flags: Option<Vec<u8>>,
}

/// A non-coinbase transaction carried by the template.
#[derive(Debug, Clone)]
pub struct TemplateTx {
    pub raw: Vec<u8>,
    pub txid: Txid,
}

impl BlockTemplate {
    /// Validate and convert the raw RPC result.
    pub fn from_rpc(raw: GetBlockTemplate) -> Result<Self> {
        let prev_hash = BlockHash::from_str(&raw.previous_block_hash)
            .map_err(|e| Error::Protocol(format!("previousblockhash: {e}")))?;

        let bits_raw = u32::from_str_radix(&raw.bits, 16)
            .map_err(|e| Error::Protocol(format!("bits {}: {e}", raw.bits)))?;

        let transactions = raw
            .transactions
            .into_iter()
            .map(|tx| {
                Ok(TemplateTx {
                    raw: hex::decode(&tx.data)
                        .map_err(|e| Error::Protocol(format!("transaction data: {e}")))?,
                    txid: Txid::from_str(&tx.txid)
                        .map_err(|e| Error::Protocol(format!("txid {}: {e}", tx.txid)))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let witness_commitment = raw
            .default_witness_commitment
            .map(|commitment| {
                hex::decode(&commitment)
                    .map_err(|e| Error::Protocol(format!("witness commitment: {e}")))
            })
            .transpose()?;

        let aux_flags = if raw.coinbase_aux.is_empty() {
            None
        } else {
            let mut flags = Vec::new();
            for value in raw.coinbase_aux.values() {
                flags.extend(
                    hex::decode(value)
                        .map_err(|e| Error::Protocol(format!("coinbaseaux: {e}")))?,
                );
            }
            Some(flags)
        };

        if raw.height <= 0 {
            return Err(Error::Protocol(format!("template height {}", raw.height)));
        }

        Ok(Self {
            height: raw.height,
            version: raw.version,
            prev_hash,
            curtime: raw.current_time,
            mintime: raw.min_time,
            bits: CompactTarget::from_consensus(bits_raw),
            coinbase_value: raw.coinbase_value,
            transactions,
            witness_commitment,
            aux_flags,
        })
    }

    /// Little-endian txids of the non-coinbase transactions, in block order.
    pub fn txids_le(&self) -> Vec<[u8; 32]> {
        self.transactions
            .iter()
            .map(|tx| tx.txid.to_byte_array())
            .collect()
    }
}

/// Node sync state for health reporting.
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    pub blocks: i64,
    pub headers: i64,
    pub initial_block_download: bool,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
    pub has_template: bool,
}

/// Feed health, consulted by the job broadcaster before notifying miners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// No template has been accepted yet
    NoTemplate,
    /// The node is still in initial block download
    Syncing,
    /// Polling has failed repeatedly
    FeedError(String),
}

/// Consecutive failures before the feed reports unhealthy. A single missed
/// poll keeps serving the last template.
const UNHEALTHY_AFTER: u32 = 3;

impl SyncSnapshot {
    pub fn health(&self) -> Health {
        if self.consecutive_errors >= UNHEALTHY_AFTER {
            return Health::FeedError(
                self.last_error.clone().unwrap_or_else(|| "unknown".into()),
            );
        }
        if !self.has_template {
            return Health::NoTemplate;
        }
        if self.initial_block_download {
            return Health::Syncing;
        }
        Health::Healthy
    }
}

/// Background task keeping the latest template and sync snapshot current.
pub struct TemplateFeed {
    client: Arc<NodeClient>,
    config: NodeConfig,
    template_tx: watch::Sender<Option<Arc<BlockTemplate>>>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    wake_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl TemplateFeed {
    #[allow(clippy::type_complexity)]
    pub fn new(
        client: Arc<NodeClient>,
        config: NodeConfig,
        cancel: CancellationToken,
    ) -> (
        Self,
        watch::Receiver<Option<Arc<BlockTemplate>>>,
        watch::Receiver<SyncSnapshot>,
        mpsc::Sender<()>,
    ) {
        let (template_tx, template_rx) = watch::channel(None);
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::default());
        let (wake_tx, wake_rx) = mpsc::channel(1);
        (
            Self {
                client,
                config,
                template_tx,
                snapshot_tx,
                wake_rx,
                cancel,
            },
            template_rx,
            snapshot_rx,
            wake_tx,
        )
    }

    pub async fn run(mut self) {
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.template_poll_secs));
        let mut info = tokio::time::interval(Duration::from_secs(self.config.chain_info_poll_secs));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_key: Option<(BlockHash, Vec<Txid>)> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Template feed stopping.");
                    return;
                }
                _ = poll.tick() => {
                    self.refresh_template(&mut last_key).await;
                }
                Some(()) = self.wake_rx.recv() => {
                    // Coalesce any wakeups that raced in while we slept.
                    while self.wake_rx.try_recv().is_ok() {}
                    debug!("hashblock wakeup, refreshing template");
                    self.refresh_template(&mut last_key).await;
                    poll.reset();
                }
                _ = info.tick() => {
                    self.refresh_chain_info().await;
                }
            }
        }
    }

    async fn refresh_template(&mut self, last_key: &mut Option<(BlockHash, Vec<Txid>)>) {
        let started = Instant::now();
        match self.client.get_block_template().await {
            Ok(raw) => match BlockTemplate::from_rpc(raw) {
                Ok(template) => {
                    self.snapshot_tx.send_modify(|snap| {
                        snap.last_error = None;
                        snap.consecutive_errors = 0;
                        snap.has_template = true;
                    });

                    let key = (
                        template.prev_hash,
                        template.transactions.iter().map(|tx| tx.txid).collect(),
                    );
                    if last_key.as_ref() == Some(&key) {
                        return;
                    }
                    *last_key = Some(key);

                    debug!(
                        height = template.height,
                        txs = template.transactions.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "New block template"
                    );
                    self.template_tx.send_replace(Some(Arc::new(template)));
                }
                Err(e) => self.note_error(e.to_string()),
            },
            Err(e) => self.note_error(e.to_string()),
        }
    }

    async fn refresh_chain_info(&mut self) {
        match self.client.get_blockchain_info().await {
            Ok(chain_info) => {
                self.snapshot_tx.send_modify(|snap| {
                    snap.blocks = chain_info.blocks;
                    snap.headers = chain_info.headers;
                    snap.initial_block_download = chain_info.initial_block_download;
                });
            }
            Err(e) => {
                warn!(error = %e, "getblockchaininfo failed");
            }
        }
    }

    fn note_error(&mut self, message: String) {
        warn!(error = %message, "Template refresh failed");
        self.snapshot_tx.send_modify(|snap| {
            snap.last_error = Some(message);
            snap.consecutive_errors = snap.consecutive_errors.saturating_add(1);
        });
    }
}

/// ZMQ `hashblock` subscriber.
///
/// Every message triggers an immediate template refresh through `wake_tx`.
/// The socket reconnects with a short backoff on any error.
pub async fn zmq_hashblock_task(
    endpoint: String,
    wake_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut socket = zeromq::SubSocket::new();
        let connected = async {
            socket.connect(&endpoint).await?;
            socket.subscribe("hashblock").await?;
            Ok::<_, zeromq::ZmqError>(())
        };

        match connected.await {
            Ok(()) => {
                info!(endpoint = %endpoint, "Subscribed to hashblock notifications");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        received = socket.recv() => match received {
                            Ok(_) => {
                                // A full channel already has a refresh queued.
                                let _ = wake_tx.try_send(());
                            }
                            Err(e) => {
                                warn!(error = %e, "ZMQ receive failed, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "ZMQ connect failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}
