//! Per-socket Stratum state machine.
//!
//! Each connection runs two tasks: a writer draining an mpsc channel onto
//! the socket, and this state machine consuming parsed requests, job
//! updates from the broadcaster and the shutdown token. All writes funnel
//! through the channel, so a `mining.set_difficulty` queued before a
//! `mining.notify` is observed in that order by the miner.
//!
//! The state machine owns everything per-connection: version-rolling
//! negotiation, VarDiff, the two hashrate EMAs, duplicate-share
//! fingerprints and the invalid-submission ban counter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::banlist::BanList;
use crate::codec;
use crate::config::Config;
use crate::job::{Job, JobManager};
use crate::stratum::messages::{
    notification, response_err, response_ok, ParseError, RawRequest, Reject, Request,
    StratumCode, SubmitParams, MAX_LINE_LENGTH,
};
use crate::stratum::vardiff::Vardiff;
use crate::submit::{BlockSubmitRpc, Submitter};
use crate::tracing::prelude::*;
use crate::types::HashrateEma;
use crate::validate::{validate_share, ShareContext};

/// Why a connection ended; close is idempotent and reason-tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    ProtocolError,
    SubscribeTimeout,
    Banned,
    Shutdown,
}

/// Work pushed at a connection by the job broadcaster.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job: Arc<Job>,
    pub clean: bool,
}

/// Registry-facing handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub peer: SocketAddr,
    job_tx: mpsc::Sender<JobUpdate>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Queue a job update; a saturated connection just misses this notify
    /// and catches up on the next one.
    pub fn push_job(&self, update: JobUpdate) {
        if self.job_tx.try_send(update).is_err() {
            trace!(peer = %self.peer, "Connection missed a job update");
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Handle wired to a bare channel, for registry and broadcast tests.
    #[cfg(test)]
    pub(crate) fn detached(id: u64, peer: SocketAddr) -> (Self, mpsc::Receiver<JobUpdate>) {
        let (job_tx, job_rx) = mpsc::channel(8);
        (
            Self {
                id,
                peer,
                job_tx,
                cancel: CancellationToken::new(),
            },
            job_rx,
        )
    }
}

/// Shared collaborators handed to every connection.
pub struct ConnDeps<R: BlockSubmitRpc> {
    pub config: Arc<Config>,
    pub jobs: Arc<JobManager>,
    pub bans: Arc<BanList>,
    pub submitter: Arc<Submitter<R>>,
}

impl<R: BlockSubmitRpc> Clone for ConnDeps<R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            jobs: self.jobs.clone(),
            bans: self.bans.clone(),
            submitter: self.submitter.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Subscribed,
    Authorized,
}

/// Version-rolling negotiation state (BIP320 via mining.configure).
#[derive(Debug, Clone)]
pub struct VersionRolling {
    pool_mask: u32,
    miner_mask: u32,
    effective: u32,
    min_bits: u32,
    active: bool,
}

impl VersionRolling {
    pub fn new(pool_mask: u32) -> Self {
        Self {
            pool_mask,
            miner_mask: 0,
            effective: 0,
            min_bits: 0,
            active: false,
        }
    }

    /// Apply a miner's mask request; returns (effective mask, active).
    pub fn configure(&mut self, miner_mask: u32, requested_min_bits: u32) -> (u32, bool) {
        self.miner_mask = miner_mask;
        self.recompute(requested_min_bits)
    }

    /// Narrow the pool-side mask, e.g. from configuration reload.
    pub fn narrow_pool_mask(&mut self, pool_mask: u32) -> (u32, bool) {
        self.pool_mask = pool_mask;
        self.recompute(self.min_bits)
    }

    fn recompute(&mut self, requested_min_bits: u32) -> (u32, bool) {
        self.effective = self.pool_mask & self.miner_mask;
        self.active = self.effective != 0;
        self.min_bits = requested_min_bits.min(self.effective.count_ones());
        (self.effective, self.active)
    }

    /// The negotiated mask, when rolling is active.
    pub fn mask(&self) -> Option<u32> {
        self.active.then_some(self.effective)
    }

    pub fn min_bits(&self) -> u32 {
        self.min_bits
    }
}

/// Sliding window of invalid submissions.
#[derive(Debug)]
struct InvalidWindow {
    count: u32,
    window_start: Instant,
}

impl InvalidWindow {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn note(&mut self, window: Duration, now: Instant) -> u32 {
        if now.duration_since(self.window_start) > window {
            self.count = 0;
            self.window_start = now;
        }
        self.count = self.count.saturating_add(1);
        self.count
    }
}

/// Status-reporting counters; VarDiff never touches these.
#[derive(Debug)]
struct StatusWindow {
    window_start: Instant,
    accepted: u64,
    submitted: u64,
    sum_difficulty: f64,
}

impl StatusWindow {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            accepted: 0,
            submitted: 0,
            sum_difficulty: 0.0,
        }
    }
}

type Fingerprint = (Vec<u8>, u32, u32, Option<u32>);

/// Bounded per-job duplicate-share fingerprints.
#[derive(Debug)]
struct SeenShares {
    per_job: HashMap<String, HashSet<Fingerprint>>,
    cap_per_job: usize,
}

impl SeenShares {
    fn new(cap_per_job: usize) -> Self {
        Self {
            per_job: HashMap::new(),
            cap_per_job,
        }
    }

    /// Returns false when the fingerprint was already seen for this job.
    fn insert(&mut self, job_id: &str, fingerprint: Fingerprint) -> bool {
        let set = self.per_job.entry(job_id.to_string()).or_default();
        if set.contains(&fingerprint) {
            return false;
        }
        if set.len() < self.cap_per_job {
            set.insert(fingerprint);
        }
        true
    }

    /// Drop fingerprints for jobs no longer retained.
    fn retain_jobs<F: Fn(&str) -> bool>(&mut self, live: F) {
        self.per_job.retain(|job_id, _| live(job_id));
    }
}

/// One miner connection. Generic over the socket halves so tests can run
/// the full state machine over in-memory pipes.
pub struct MinerConn<R, S: BlockSubmitRpc> {
    deps: ConnDeps<S>,
    peer: SocketAddr,
    cancel: CancellationToken,
    reader: FramedRead<R, LinesCodec>,
    writer_tx: mpsc::Sender<Value>,
    writer_task: tokio::task::JoinHandle<()>,
    job_rx: mpsc::Receiver<JobUpdate>,

    state: State,
    subscription_id: String,
    extranonce1: Option<Vec<u8>>,
    worker: Option<String>,
    user_agent: Option<String>,
    difficulty: f64,
    /// Difficulty in force when each retained job was notified
    job_difficulties: VecDeque<(String, f64)>,
    version: VersionRolling,
    vardiff: Vardiff,
    ema_display: HashrateEma,
    ema_control: HashrateEma,
    status: StatusWindow,
    invalid: InvalidWindow,
    seen: SeenShares,
    notify_sent_at: Option<Instant>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_subscription_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl<R, S> MinerConn<R, S>
where
    R: AsyncRead + Unpin,
    S: BlockSubmitRpc,
{
    /// Set up a connection over the given socket halves.
    ///
    /// Returns the connection and its registry handle. The writer task
    /// starts immediately; the state machine runs in [`MinerConn::run`].
    pub fn new<W: AsyncWrite + Unpin + Send + 'static>(
        id: u64,
        reader: R,
        writer: W,
        peer: SocketAddr,
        deps: ConnDeps<S>,
        parent_cancel: &CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let cancel = parent_cancel.child_token();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Value>(64);
        let (job_tx, job_rx) = mpsc::channel::<JobUpdate>(8);

        let writer_cancel = cancel.clone();
        let writer_task = tokio::spawn(async move {
            let mut framed = FramedWrite::new(writer, LinesCodec::new());
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    message = writer_rx.recv() => {
                        let Some(message) = message else { break };
                        if framed.send(message.to_string()).await.is_err() {
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });

        let now = Instant::now();
        let config = &deps.config;
        let tau = Duration::from_secs(config.stratum.hashrate_tau_secs);
        let control_tau = Duration::from_secs((config.stratum.hashrate_tau_secs / 6).max(1));

        let conn = Self {
            peer,
            cancel: cancel.clone(),
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer_tx,
            writer_task,
            job_rx,
            state: State::Connected,
            subscription_id: random_subscription_id(),
            extranonce1: None,
            worker: None,
            user_agent: None,
            difficulty: config.stratum.start_diff,
            job_difficulties: VecDeque::new(),
            version: VersionRolling::new(config.stratum.version_mask),
            vardiff: Vardiff::new(&config.vardiff, &config.stratum, now),
            ema_display: HashrateEma::new(tau),
            ema_control: HashrateEma::new(control_tau),
            status: StatusWindow::new(now),
            invalid: InvalidWindow::new(now),
            seen: SeenShares::new(config.stratum.max_seen_shares_per_job),
            notify_sent_at: None,
            deps,
        };

        let handle = ConnectionHandle {
            id,
            peer,
            job_tx,
            cancel,
        };
        (conn, handle)
    }

    /// Drive the connection to completion.
    pub async fn run(mut self) -> CloseReason {
        let subscribe_deadline =
            tokio::time::Instant::now() + self.deps.config.subscribe_timeout();

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break CloseReason::Shutdown,

                _ = tokio::time::sleep_until(subscribe_deadline),
                    if self.state == State::Connected =>
                {
                    debug!(peer = %self.peer, "No subscribe before timeout");
                    break CloseReason::SubscribeTimeout;
                }

                update = self.job_rx.recv() => {
                    if let Some(update) = update {
                        self.handle_job_update(update).await;
                    }
                }

                line = self.reader.next() => {
                    match line {
                        None => break CloseReason::PeerClosed,
                        Some(Err(e)) => {
                            debug!(peer = %self.peer, error = %e, "Read failed");
                            break CloseReason::ReadError;
                        }
                        Some(Ok(line)) => {
                            match self.handle_line(&line).await {
                                Some(reason) => break reason,
                                None => {}
                            }
                        }
                    }
                }
            }
        };

        self.shutdown(reason).await;
        reason
    }

    async fn shutdown(&mut self, reason: CloseReason) {
        if let Some(extranonce1) = self.extranonce1.take() {
            self.deps.jobs.release_extranonce1(&extranonce1);
        }
        self.cancel.cancel();
        self.writer_task.abort();
        info!(
            peer = %self.peer,
            worker = self.worker.as_deref().unwrap_or("-"),
            reason = ?reason,
            accepted = self.status.accepted,
            submitted = self.status.submitted,
            "Connection closed"
        );
    }

    async fn send(&self, message: Value) {
        // A closed writer means the connection is already going down; the
        // main loop will observe the cancellation.
        let _ = self.writer_tx.send(message).await;
    }

    /// Handle one request line. `Some(reason)` terminates the connection.
    async fn handle_line(&mut self, line: &str) -> Option<CloseReason> {
        let raw: RawRequest = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Malformed request line");
                return Some(CloseReason::ProtocolError);
            }
        };
        let id = raw.id.clone();

        let request = match Request::parse(&raw) {
            Ok(request) => request,
            Err(ParseError { method, detail }) => {
                debug!(peer = %self.peer, method = %method, detail = %detail, "Bad params");
                self.send(response_err(
                    &id,
                    &Reject::with_detail(StratumCode::Other, detail),
                ))
                .await;
                return Some(CloseReason::ProtocolError);
            }
        };

        match request {
            Request::Configure(params) => {
                self.handle_configure(&id, params.version_rolling, params.mask, params.min_bit_count)
                    .await;
                None
            }
            Request::Subscribe {
                user_agent,
                session_id: _,
            } => self.handle_subscribe(&id, user_agent).await,
            Request::Authorize { username, password: _ } => {
                self.handle_authorize(&id, &username).await
            }
            Request::SuggestDifficulty(difficulty) => {
                self.handle_suggest_difficulty(&id, difficulty).await;
                None
            }
            Request::Submit(submit) => self.handle_submit(&id, submit).await,
            Request::Unknown(method) => {
                debug!(peer = %self.peer, method = %method, "Unknown method");
                self.send(response_err(
                    &id,
                    &Reject::with_detail(StratumCode::Other, format!("unknown method {method}")),
                ))
                .await;
                None
            }
        }
    }

    async fn handle_configure(
        &mut self,
        id: &Value,
        version_rolling: bool,
        miner_mask: u32,
        min_bit_count: u32,
    ) {
        if !version_rolling {
            self.send(response_ok(id, json!({}))).await;
            return;
        }

        let (mask, active) = self.version.configure(miner_mask, min_bit_count);
        debug!(
            peer = %self.peer,
            mask = format!("{mask:08x}"),
            active,
            "Version rolling configured"
        );
        self.send(response_ok(
            id,
            json!({
                "version-rolling": active,
                "version-rolling.mask": format!("{mask:08x}"),
            }),
        ))
        .await;
    }

    async fn handle_subscribe(
        &mut self,
        id: &Value,
        user_agent: Option<String>,
    ) -> Option<CloseReason> {
        if self.state != State::Connected {
            self.send(response_err(
                id,
                &Reject::with_detail(StratumCode::Other, "already subscribed"),
            ))
            .await;
            return Some(CloseReason::ProtocolError);
        }

        let extranonce1 = self.deps.jobs.assign_extranonce1();
        let result = json!([
            [
                ["mining.set_difficulty", self.subscription_id],
                ["mining.notify", self.subscription_id],
            ],
            hex::encode(&extranonce1),
            self.deps.jobs.extranonce2_size(),
        ]);

        self.extranonce1 = Some(extranonce1);
        self.user_agent = user_agent;
        self.state = State::Subscribed;
        self.send(response_ok(id, result)).await;
        None
    }

    async fn handle_authorize(&mut self, id: &Value, username: &str) -> Option<CloseReason> {
        if self.state == State::Connected {
            self.send(response_err(id, &Reject::new(StratumCode::NotSubscribed)))
                .await;
            return None;
        }

        if self.deps.bans.is_banned(username) {
            self.send(response_err(
                id,
                &Reject::with_detail(StratumCode::UnauthorizedWorker, "banned"),
            ))
            .await;
            return Some(CloseReason::Banned);
        }

        // Worker names are a payout-style address with an optional rig
        // suffix after a dot.
        let base_address = username.split('.').next().unwrap_or(username);
        if let Err(e) = codec::address_to_script(base_address, self.deps.config.network) {
            debug!(peer = %self.peer, username = %username, error = %e, "Authorize failed");
            self.send(response_err(
                id,
                &Reject::with_detail(StratumCode::UnauthorizedWorker, e.to_string()),
            ))
            .await;
            return None;
        }

        self.worker = Some(username.to_string());
        self.state = State::Authorized;
        self.send(response_ok(id, json!(true))).await;

        info!(
            peer = %self.peer,
            worker = %username,
            user_agent = self.user_agent.as_deref().unwrap_or("-"),
            "Worker authorized"
        );

        self.push_set_difficulty().await;
        if let Some(job) = self.deps.jobs.current_job() {
            self.push_notify(&job, true).await;
        }
        None
    }

    async fn handle_suggest_difficulty(&mut self, id: &Value, suggested: f64) {
        let clamped = self.vardiff.clamp(suggested);
        debug!(peer = %self.peer, suggested, clamped, "Difficulty suggested");
        self.send(response_ok(id, json!(true))).await;

        if self.deps.config.stratum.lock_suggested_difficulty {
            self.vardiff.lock();
        }
        if clamped != self.difficulty {
            self.difficulty = clamped;
            self.push_set_difficulty().await;
        }
    }

    async fn handle_submit(&mut self, id: &Value, submit: SubmitParams) -> Option<CloseReason> {
        match self.state {
            State::Connected => {
                self.send(response_err(id, &Reject::new(StratumCode::NotSubscribed)))
                    .await;
                return None;
            }
            State::Subscribed => {
                self.send(response_err(
                    id,
                    &Reject::new(StratumCode::UnauthorizedWorker),
                ))
                .await;
                return None;
            }
            State::Authorized => {}
        }

        self.status.submitted += 1;

        let reject = match self.validate_submit(&submit).await {
            Ok(()) => None,
            Err(reject) => Some(reject),
        };

        let Some(reject) = reject else {
            self.send(response_ok(id, json!(true))).await;
            return None;
        };

        debug!(
            peer = %self.peer,
            job_id = %submit.job_id,
            code = reject.code.code(),
            detail = reject.detail.as_deref().unwrap_or(""),
            "Share rejected"
        );
        self.send(response_err(id, &reject)).await;

        if reject.counts_toward_ban() {
            let bans = &self.deps.config.bans;
            let count = self.invalid.note(
                Duration::from_secs(bans.invalid_submissions_window_secs),
                Instant::now(),
            );
            if count >= bans.invalid_submissions_after {
                if let Some(worker) = &self.worker {
                    self.deps.bans.ban(
                        worker,
                        Some(Duration::from_secs(bans.invalid_submissions_duration_secs)),
                        "invalid submissions",
                    );
                }
                return Some(CloseReason::Banned);
            }
        }
        None
    }

    /// The share lifecycle for one submit: resolve, dedup, validate,
    /// account, and hand winners to the submitter.
    async fn validate_submit(&mut self, submit: &SubmitParams) -> Result<(), Reject> {
        let job = self
            .deps
            .jobs
            .job_by_id(&submit.job_id)
            .ok_or_else(|| Reject::new(StratumCode::JobNotFound))?;

        let fingerprint = (
            submit.extranonce2.clone(),
            submit.ntime,
            submit.nonce,
            submit.version_bits,
        );
        if !self.seen.insert(&job.id, fingerprint) {
            return Err(Reject::new(StratumCode::DuplicateShare));
        }

        let assigned = self
            .job_difficulties
            .iter()
            .find(|(job_id, _)| *job_id == job.id)
            .map(|(_, difficulty)| *difficulty)
            .unwrap_or(self.difficulty);

        let extranonce1 = self
            .extranonce1
            .as_deref()
            .ok_or_else(|| Reject::new(StratumCode::NotSubscribed))?;

        let ctx = ShareContext {
            job: &job,
            extranonce1,
            assigned_difficulty: assigned,
            version_mask: self.version.mask(),
            now_unix: unix_now(),
            ntime_forward_slack_secs: self.deps.config.stratum.ntime_forward_slack_secs,
        };
        let share = validate_share(&ctx, submit)?;

        let now = Instant::now();
        self.status.accepted += 1;
        self.status.sum_difficulty += assigned;
        self.ema_display.record(assigned, now);
        self.ema_control.record(assigned, now);
        self.vardiff.record_accepted();

        trace!(
            peer = %self.peer,
            job_id = %job.id,
            difficulty = assigned,
            hash_difficulty = share.hash_difficulty,
            "Share accepted"
        );

        if let Some(candidate) = share.block {
            let submitter = self.deps.submitter.clone();
            let worker = self.worker.clone().unwrap_or_default();
            let job = job.clone();
            // Submission can wait on a 30 s RPC timeout; do not stall the
            // read loop behind it.
            tokio::spawn(async move {
                if let Err(e) = submitter.submit_found(&job, &candidate, &worker).await {
                    error!(error = %e, "Block submission failed");
                }
            });
        }

        if let Some(next) = self.vardiff.maybe_adjust(self.difficulty, now) {
            self.difficulty = next;
            self.push_set_difficulty().await;
        }

        Ok(())
    }

    async fn handle_job_update(&mut self, update: JobUpdate) {
        if self.state != State::Authorized {
            return;
        }

        // Give VarDiff a chance to close an idle window before new work.
        if let Some(next) = self.vardiff.maybe_adjust(self.difficulty, Instant::now()) {
            self.difficulty = next;
            self.push_set_difficulty().await;
        }

        self.maybe_roll_status_window();
        self.push_notify(&update.job, update.clean).await;
    }

    async fn push_set_difficulty(&mut self) {
        self.send(notification(
            "mining.set_difficulty",
            json!([self.difficulty]),
        ))
        .await;
    }

    async fn push_notify(&mut self, job: &Arc<Job>, clean: bool) {
        self.job_difficulties.push_back((job.id.clone(), self.difficulty));
        while self.job_difficulties.len() > 16 {
            self.job_difficulties.pop_front();
        }
        let jobs = &self.deps.jobs;
        self.seen.retain_jobs(|job_id| jobs.job_by_id(job_id).is_some());

        self.send(notification("mining.notify", job.notify_params(clean)))
            .await;
        self.notify_sent_at = Some(Instant::now());
    }

    fn maybe_roll_status_window(&mut self) {
        let window = Duration::from_secs(self.deps.config.stratum.status_window_secs);
        let now = Instant::now();
        if now.duration_since(self.status.window_start) < window {
            return;
        }

        let hashrate = self
            .ema_display
            .decayed(now)
            .map(|rate| rate.to_string())
            .unwrap_or_else(|| "warming up".into());
        let notify_age_secs = self
            .notify_sent_at
            .map(|sent| now.duration_since(sent).as_secs())
            .unwrap_or(0);
        info!(
            peer = %self.peer,
            worker = self.worker.as_deref().unwrap_or("-"),
            accepted = self.status.accepted,
            submitted = self.status.submitted,
            sum_difficulty = self.status.sum_difficulty,
            hashrate = %hashrate,
            difficulty = self.difficulty,
            notify_age_secs,
            "Status window"
        );
        self.status = StatusWindow::new(now);
    }
}
