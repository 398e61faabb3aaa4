//! Job construction, retention and extranonce1 allocation.
//!
//! A job is an immutable snapshot of one block template, pre-chewed for
//! Stratum: split coinbase, merkle branches for the coinbase at position 0,
//! and the notify parameters. The manager keeps the current job plus a
//! short ring of recent ones so in-flight shares survive a template change;
//! anything older rejects as stale.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitcoin::ScriptBuf;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde_json::{json, Value};

use crate::codec;
use crate::coinbase::{CoinbaseBuilder, CoinbaseParts};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::template::BlockTemplate;
use crate::tracing::prelude::*;

/// Base-58 style alphabet for job ids; excludes 0, O, I and l.
const JOB_ID_ALPHABET: &[u8; 58] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn encode_job_id(mut n: u64) -> String {
    if n == 0 {
        return "1".into();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(JOB_ID_ALPHABET[(n % 58) as usize]);
        n /= 58;
    }
    digits.reverse();
    String::from_utf8(digits).expect("alphabet is ASCII")
}

/// One broadcastable unit of work. Immutable.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub created_at: Instant,
    pub template: Arc<BlockTemplate>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub coinbase: CoinbaseParts,
    pub extranonce2_size: usize,
    pub template_extranonce2_size: usize,
}

impl Job {
    /// Parameters for `mining.notify`.
    ///
    /// The previous-block hash goes out in big-endian display order;
    /// branches are little-endian hex, the order miners fold them in.
    pub fn notify_params(&self, clean: bool) -> Value {
        let branches: Vec<String> = self
            .merkle_branches
            .iter()
            .map(hex::encode)
            .collect();
        json!([
            self.id,
            self.template.prev_hash.to_string(),
            hex::encode(&self.coinbase.part1),
            hex::encode(&self.coinbase.part2),
            branches,
            format!("{:08x}", self.template.version),
            format!("{:08x}", self.template.bits.to_consensus()),
            format!("{:08x}", self.template.curtime),
            clean,
        ])
    }
}

#[derive(Debug, Default)]
struct JobRing {
    recent: VecDeque<Arc<Job>>,
}

/// Builds jobs from templates and retains the recent ones.
pub struct JobManager {
    counter: AtomicU64,
    ring: RwLock<JobRing>,
    extranonce1: Mutex<HashSet<Vec<u8>>>,
    payout_script: ScriptBuf,
    fee: Option<(ScriptBuf, f64)>,
    donation: Option<(ScriptBuf, f64)>,
    extranonce1_size: usize,
    extranonce2_size: usize,
    template_extranonce2_size: usize,
    max_recent_jobs: usize,
    max_scriptsig_bytes: usize,
    coinbase_message: Option<String>,
    pool_tag: Option<String>,
    script_time: u32,
}

impl JobManager {
    pub fn new(config: &Config) -> Result<Self> {
        let payout_address = config
            .payout
            .payout_address
            .as_deref()
            .ok_or_else(|| Error::Config("payout_address is required".into()))?;
        let payout_script = codec::address_to_script(payout_address, config.network)?;

        let fee = match (&config.payout.fee_address, config.payout.fee_percent) {
            (Some(addr), pct) if pct > 0.0 => {
                Some((codec::address_to_script(addr, config.network)?, pct))
            }
            _ => None,
        };
        let donation = match (&config.payout.donation_address, config.payout.donation_percent) {
            (Some(addr), pct) if pct > 0.0 => {
                Some((codec::address_to_script(addr, config.network)?, pct))
            }
            _ => None,
        };

        Ok(Self {
            counter: AtomicU64::new(0),
            ring: RwLock::new(JobRing::default()),
            extranonce1: Mutex::new(HashSet::new()),
            payout_script,
            fee,
            donation,
            extranonce1_size: config.stratum.extranonce1_size,
            extranonce2_size: config.stratum.extranonce2_size,
            template_extranonce2_size: config.stratum.template_extranonce2_size,
            max_recent_jobs: config.stratum.max_recent_jobs.max(1),
            max_scriptsig_bytes: config.stratum.coinbase_scriptsig_max_bytes,
            coinbase_message: config.payout.coinbase_message.clone(),
            pool_tag: config.payout.pool_tag.clone(),
            script_time: config.payout.script_time,
        })
    }

    /// Next monotonic job id, rendered in the compact alphabet. Never
    /// reused for the lifetime of the process.
    pub fn next_job_id(&self) -> String {
        encode_job_id(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Size of the extranonce1 assigned to each connection.
    pub fn extranonce1_size(&self) -> usize {
        self.extranonce1_size
    }

    /// Size of the extranonce2 advertised to miners.
    pub fn extranonce2_size(&self) -> usize {
        self.extranonce2_size
    }

    /// Build a job from the template and install it as current.
    pub fn build_job(&self, template: Arc<BlockTemplate>) -> Result<Arc<Job>> {
        let mut builder = CoinbaseBuilder::new(
            template.height,
            template.coinbase_value,
            self.payout_script.clone(),
        )
        .extranonce_sizes(
            self.extranonce1_size,
            self.extranonce2_size,
            self.template_extranonce2_size,
        )
        .max_scriptsig_bytes(self.max_scriptsig_bytes)
        .script_time(self.script_time);

        if let Some((script, pct)) = &self.fee {
            builder = builder.fee(script.clone(), *pct);
        }
        if let Some((script, pct)) = &self.donation {
            builder = builder.donation(script.clone(), *pct);
        }
        if let Some(commitment) = &template.witness_commitment {
            builder = builder.witness_commitment(commitment.clone());
        }
        if let Some(flags) = &template.aux_flags {
            builder = builder.aux_flags(flags.clone());
        }
        if let Some(message) = &self.coinbase_message {
            builder = builder.message(message.clone());
        }
        if let Some(tag) = &self.pool_tag {
            builder = builder.pool_tag(tag.clone());
        }

        let coinbase = builder.build()?;
        let merkle_branches = codec::merkle_branches(&template.txids_le());

        let job = Arc::new(Job {
            id: self.next_job_id(),
            created_at: Instant::now(),
            template,
            merkle_branches,
            coinbase,
            extranonce2_size: self.extranonce2_size,
            template_extranonce2_size: self.template_extranonce2_size,
        });

        let mut ring = self.ring.write();
        ring.recent.push_back(job.clone());
        while ring.recent.len() > self.max_recent_jobs {
            let evicted = ring.recent.pop_front();
            if let Some(evicted) = evicted {
                trace!(job_id = %evicted.id, "Evicting retained job");
            }
        }

        Ok(job)
    }

    /// The active job, if any template has arrived.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.ring.read().recent.back().cloned()
    }

    /// Look up a retained job; `None` means the share is stale.
    pub fn job_by_id(&self, id: &str) -> Option<Arc<Job>> {
        self.ring
            .read()
            .recent
            .iter()
            .rev()
            .find(|job| job.id == id)
            .cloned()
    }

    /// Allocate a fresh extranonce1, unique across live connections.
    pub fn assign_extranonce1(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut allocated = self.extranonce1.lock();
        loop {
            let mut bytes = vec![0u8; self.extranonce1_size];
            rng.fill_bytes(&mut bytes);
            if allocated.insert(bytes.clone()) {
                return bytes;
            }
        }
    }

    /// Return an extranonce1 to the pool when its connection closes.
    pub fn release_extranonce1(&self, extranonce1: &[u8]) {
        self.extranonce1.lock().remove(extranonce1);
    }
}
