//! Pool daemon.
//!
//! Startup order matters: configuration and payout validation are fatal
//! before any listener opens; after that, every background task hangs off
//! one cancellation token and a task tracker, and SIGINT/SIGTERM drain the
//! lot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use tanuki_pool::banlist::BanList;
use tanuki_pool::config::Config;
use tanuki_pool::error::{Error, Result};
use tanuki_pool::job::JobManager;
use tanuki_pool::rpc::NodeClient;
use tanuki_pool::store::{FoundBlockLog, SubmissionStore};
use tanuki_pool::stratum::connection::ConnDeps;
use tanuki_pool::stratum::server::StratumServer;
use tanuki_pool::submit::Submitter;
use tanuki_pool::template::{zmq_hashblock_task, TemplateFeed};
use tanuki_pool::tracing::{self, prelude::*};

fn load_config() -> Result<Config> {
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| Error::Config("usage: tanuki-poold <config.json>".into()))?;
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("{path}: {e}")))?;
    let config: Config = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("{path}: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Best-effort payout check against the node. A wrong address is fatal; an
/// unreachable node is not, the feed will keep retrying it.
async fn check_payout_address(client: &NodeClient, config: &Config) -> Result<()> {
    let Some(address) = config.payout.payout_address.as_deref() else {
        return Err(Error::Config("payout_address is required".into()));
    };
    match client.validate_address(address).await {
        Ok(result) if !result.is_valid => Err(Error::Config(format!(
            "node rejects payout address {address}"
        ))),
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "Could not reach node for payout validation, continuing");
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let client = Arc::new(NodeClient::new(&config.node, config.network)?);
    check_payout_address(&client, &config).await?;

    let jobs = Arc::new(JobManager::new(&config)?);
    let bans = Arc::new(
        BanList::load(config.data_dir.join("banlist.dat")).context("loading ban list")?,
    );
    let store = Arc::new(
        SubmissionStore::load(config.data_dir.join("submissions.dat"))
            .context("loading pending submissions")?,
    );
    let found_log = FoundBlockLog::new(config.data_dir.join("found_blocks.dat"));
    let submitter = Arc::new(Submitter::new(
        client.clone(),
        store,
        found_log,
        config.node.rpc_url.clone(),
        config.payout.payout_address.clone(),
    ));

    // Bind last among the fallible steps: a fatal misconfiguration must
    // exit before the listener ever opens.
    let listener = TcpListener::bind(config.stratum.listen.as_str())
        .await
        .with_context(|| format!("binding {}", config.stratum.listen))?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (feed, template_rx, snapshot_rx, wake_tx) =
        TemplateFeed::new(client.clone(), config.node.clone(), running.clone());
    tracker.spawn(feed.run());

    if let Some(endpoint) = config.node.zmq_hashblock.clone() {
        tracker.spawn(zmq_hashblock_task(endpoint, wake_tx, running.clone()));
    }

    tracker.spawn(submitter.clone().run_replayer(running.clone()));

    let deps = ConnDeps {
        config: Arc::new(config),
        jobs,
        bans: bans.clone(),
        submitter,
    };
    let server = StratumServer::new(deps, running.clone());
    tracker.spawn(server.clone().run_listener(listener));
    tracker.spawn(server.run_broadcaster(template_rx, snapshot_rx));

    // Periodic ban-list persistence; a final pass runs at shutdown.
    tracker.spawn({
        let bans = bans.clone();
        let cancel = running.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        if let Err(e) = bans.persist() {
                            warn!(error = %e, "Ban list persist failed");
                        }
                    }
                }
            }
        }
    });

    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    tracker.wait().await;

    if let Err(e) = bans.persist() {
        warn!(error = %e, "Final ban list persist failed");
    }
    info!("Exiting.");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing::init_journald_or_stdout();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}
