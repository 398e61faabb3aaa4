//! TCP accept loop, connection registry and job broadcaster.
//!
//! The accept loop gates new sockets through the reconnect guard, the
//! accept limiter and the connection cap; refused sockets are closed
//! without a Stratum error. The broadcaster watches the template feed and
//! pushes one job per accepted template to every registered connection,
//! setting `clean_jobs` whenever the previous-block hash moved. It
//! iterates a snapshot of the registry, never holding the lock across
//! channel sends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitcoin::BlockHash;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::banlist::ReconnectGuard;
use crate::limiter::AcceptLimiter;
use crate::stratum::connection::{ConnDeps, ConnectionHandle, JobUpdate, MinerConn};
use crate::submit::BlockSubmitRpc;
use crate::template::{BlockTemplate, Health, SyncSnapshot};
use crate::tracing::prelude::*;

/// Live connections, keyed by connection id.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    inner: RwLock<HashMap<u64, ConnectionHandle>>,
}

impl Registry {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, handle: ConnectionHandle) {
        self.inner.write().insert(handle.id, handle);
    }

    pub fn remove(&self, id: u64) {
        self.inner.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out the handles so broadcast never sends under the lock.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.inner.read().values().cloned().collect()
    }
}

/// The Stratum server: accept loop plus broadcaster, sharing one registry.
pub struct StratumServer<R: BlockSubmitRpc> {
    deps: ConnDeps<R>,
    registry: Arc<Registry>,
    limiter: Mutex<AcceptLimiter>,
    reconnect: ReconnectGuard,
    cancel: CancellationToken,
}

impl<R: BlockSubmitRpc> StratumServer<R> {
    pub fn new(deps: ConnDeps<R>, cancel: CancellationToken) -> Arc<Self> {
        let config = &deps.config;
        Arc::new(Self {
            registry: Arc::new(Registry::default()),
            limiter: Mutex::new(AcceptLimiter::new(
                &config.accept,
                config.stratum.max_conns,
                Instant::now(),
            )),
            reconnect: ReconnectGuard::new(&config.bans),
            cancel,
            deps,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept miners until cancelled.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        info!(
            listen = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            max_conns = self.deps.config.stratum.max_conns,
            "Stratum listening"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Accept loop stopping.");
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            // Resource-exhaustion refusals close the socket with no
            // Stratum error: the client never completed a handshake.
            let now = Instant::now();
            if !self.reconnect.allow(peer.ip(), now) {
                trace!(peer = %peer, "Refusing reconnect-banned IP");
                continue;
            }
            if !self.limiter.lock().try_acquire(now) {
                trace!(peer = %peer, "Accept rate exceeded");
                continue;
            }
            if self.registry.len() >= self.deps.config.stratum.max_conns {
                trace!(peer = %peer, "Connection cap reached");
                continue;
            }

            let _ = socket.set_nodelay(true);
            let (read_half, write_half) = socket.into_split();
            let id = self.registry.next_id();
            let (conn, handle) = MinerConn::new(
                id,
                read_half,
                write_half,
                peer,
                self.deps.clone(),
                &self.cancel,
            );
            self.registry.insert(handle);
            debug!(peer = %peer, id, conns = self.registry.len(), "Miner connected");

            let registry = self.registry.clone();
            tokio::spawn(async move {
                conn.run().await;
                registry.remove(id);
            });
        }
    }

    /// Turn accepted templates into jobs and fan them out.
    pub async fn run_broadcaster(
        self: Arc<Self>,
        mut template_rx: watch::Receiver<Option<Arc<BlockTemplate>>>,
        snapshot_rx: watch::Receiver<SyncSnapshot>,
    ) {
        let mut last_prev: Option<BlockHash> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Broadcaster stopping.");
                    return;
                }
                changed = template_rx.changed() => {
                    if changed.is_err() {
                        warn!("Template feed dropped, broadcaster stopping");
                        return;
                    }
                }
            }

            let Some(template) = template_rx.borrow_and_update().clone() else {
                continue;
            };

            let health = snapshot_rx.borrow().health();
            if health != Health::Healthy {
                warn!(health = ?health, "Withholding notifies, feed unhealthy");
                continue;
            }

            let clean = last_prev != Some(template.prev_hash);
            last_prev = Some(template.prev_hash);

            let job = match self.deps.jobs.build_job(template) {
                Ok(job) => job,
                Err(e) => {
                    error!(error = %e, "Job construction failed");
                    continue;
                }
            };

            let handles = self.registry.snapshot();
            debug!(
                job_id = %job.id,
                height = job.template.height,
                clean,
                conns = handles.len(),
                "Broadcasting job"
            );
            for handle in handles {
                handle.push_job(JobUpdate {
                    job: job.clone(),
                    clean,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bitcoin::Network;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    use crate::banlist::BanList;
    use crate::config::Config;
    use crate::job::JobManager;
    use crate::rpc::GetBlockTemplate;
    use crate::store::{FoundBlockLog, SubmissionStore};
    use crate::submit::Submitter;

    struct NullRpc;

    #[async_trait::async_trait]
    impl BlockSubmitRpc for NullRpc {
        async fn submit_block(&self, _block_hex: &str) -> crate::error::Result<Option<String>> {
            Ok(None)
        }
    }

    fn test_config() -> Config {
        let mut config = Config {
            network: Network::Regtest,
            ..Config::default()
        };
        config.payout.payout_address =
            Some("bcrt1q0tw7t5tlv5qdxspmwxzv4xrree3exfedwffmy7".into());
        config
    }

    fn make_deps(config: Config, dir: &std::path::Path) -> ConnDeps<NullRpc> {
        let config = Arc::new(config);
        ConnDeps {
            jobs: Arc::new(JobManager::new(&config).unwrap()),
            bans: Arc::new(BanList::load(dir.join("bans.bin")).unwrap()),
            submitter: Arc::new(Submitter::new(
                Arc::new(NullRpc),
                Arc::new(SubmissionStore::load(dir.join("subs.bin")).unwrap()),
                FoundBlockLog::new(dir.join("blocks.bin")),
                "http://localhost".into(),
                None,
            )),
            config,
        }
    }

    fn test_template() -> Arc<BlockTemplate> {
        let raw: GetBlockTemplate = serde_json::from_str(
            r#"{
                "version": 536870912,
                "previousblockhash": "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
                "transactions": [],
                "coinbaseaux": {},
                "coinbasevalue": 5000000000,
                "mintime": 1700000000,
                "curtime": 1700000600,
                "bits": "207fffff",
                "height": 1
            }"#,
        )
        .unwrap();
        Arc::new(BlockTemplate::from_rpc(raw).unwrap())
    }

    fn healthy_snapshot() -> SyncSnapshot {
        SyncSnapshot {
            has_template: true,
            ..SyncSnapshot::default()
        }
    }

    #[tokio::test]
    async fn accepted_socket_completes_subscribe() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let server = StratumServer::new(make_deps(test_config(), dir.path()), cancel.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().run_listener(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert!(response["result"][1].is_string(), "{response}");

        cancel.cancel();
    }

    #[tokio::test]
    async fn connection_cap_closes_socket_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.stratum.max_conns = 0;
        let cancel = CancellationToken::new();
        let server = StratumServer::new(make_deps(config, dir.path()), cancel.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().run_listener(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        // The server drops the socket immediately; EOF, no Stratum error.
        let n = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn broadcaster_sets_clean_on_prev_hash_change() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let deps = make_deps(test_config(), dir.path());
        let server = StratumServer::new(deps, cancel.clone());

        let (template_tx, template_rx) = watch::channel(None);
        let (_snapshot_tx, snapshot_rx) = watch::channel(healthy_snapshot());
        tokio::spawn(server.clone().run_broadcaster(template_rx, snapshot_rx));

        // Hook a probe connection into the registry.
        let (probe_handle, mut job_rx) =
            ConnectionHandle::detached(server.registry().next_id(), "127.0.0.1:5555".parse().unwrap());
        server.registry().insert(probe_handle);

        template_tx.send_replace(Some(test_template()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The job update landed in the connection's queue with clean=true.
        let update = job_rx.try_recv().expect("job update queued");
        assert!(update.clean, "first template is a clean job");

        // Same prev hash again: not clean.
        template_tx.send_replace(Some(test_template()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let update = job_rx.try_recv().expect("second update");
        assert!(!update.clean);

        cancel.cancel();
    }

    #[tokio::test]
    async fn broadcaster_withholds_when_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let server = StratumServer::new(make_deps(test_config(), dir.path()), cancel.clone());

        let (template_tx, template_rx) = watch::channel(None);
        let (_snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot {
            has_template: true,
            consecutive_errors: 5,
            last_error: Some("node down".into()),
            ..SyncSnapshot::default()
        });
        tokio::spawn(server.clone().run_broadcaster(template_rx, snapshot_rx));

        template_tx.send_replace(Some(test_template()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(
            server.deps.jobs.current_job().is_none(),
            "no job may be built while the feed is unhealthy"
        );
        cancel.cancel();
    }

    #[test]
    fn registry_snapshot_and_removal() {
        let registry = Registry::default();
        let id = registry.next_id();
        let (handle, _job_rx) = ConnectionHandle::detached(id, "127.0.0.1:5555".parse().unwrap());

        registry.insert(handle);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot().len(), 1);
        registry.remove(id);
        assert!(registry.is_empty());
    }
}
