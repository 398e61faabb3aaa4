//! Share validation.
//!
//! Reconstructs the exact block header a miner hashed from its submit
//! parameters, then checks the proof of work against both the
//! per-connection share target and the network target. The caller (the
//! connection state machine) resolves the job, tracks duplicates and maps
//! rejections onto the wire.

use bitcoin::pow::Target;

use crate::codec;
use crate::job::Job;
use crate::stratum::messages::{Reject, StratumCode, SubmitParams};
use crate::types::Difficulty;

/// An accepted share.
#[derive(Debug, Clone)]
pub struct ValidShare {
    /// Header hash, little-endian byte order
    pub hash_le: [u8; 32],
    /// Difficulty the hash actually met
    pub hash_difficulty: f64,
    /// Set when the hash also meets the network target
    pub block: Option<BlockCandidate>,
}

/// A share that solves the block. Everything the submitter needs to
/// serialize the full block.
#[derive(Debug, Clone)]
pub struct BlockCandidate {
    pub header: [u8; 80],
    /// `extranonce1 ‖ extranonce2`, for coinbase reconstruction
    pub extranonce: Vec<u8>,
    /// Block hash in display (big-endian) hex
    pub hash_hex: String,
}

/// Per-submit validation context.
#[derive(Debug)]
pub struct ShareContext<'a> {
    pub job: &'a Job,
    pub extranonce1: &'a [u8],
    pub assigned_difficulty: f64,
    /// Effective version-rolling mask, when negotiated
    pub version_mask: Option<u32>,
    pub now_unix: u64,
    pub ntime_forward_slack_secs: u64,
}

/// Validate one submit against its job.
pub fn validate_share(ctx: &ShareContext, submit: &SubmitParams) -> Result<ValidShare, Reject> {
    let job = ctx.job;
    let template = &job.template;

    if submit.extranonce2.len() != job.extranonce2_size {
        return Err(Reject::with_detail(
            StratumCode::Other,
            format!(
                "extranonce2 {} bytes, expected {}",
                submit.extranonce2.len(),
                job.extranonce2_size
            ),
        ));
    }

    let ntime = submit.ntime as u64;
    let ntime_max = template.curtime.max(ctx.now_unix) + ctx.ntime_forward_slack_secs;
    if ntime < template.mintime || ntime > ntime_max {
        return Err(Reject::with_detail(
            StratumCode::Other,
            format!("ntime {ntime} outside [{}, {ntime_max}]", template.mintime),
        ));
    }

    let version = match (submit.version_bits, ctx.version_mask) {
        (None, _) => template.version,
        (Some(_), None) => {
            return Err(Reject::with_detail(
                StratumCode::Other,
                "version rolling not negotiated",
            ));
        }
        (Some(bits), Some(mask)) => {
            if bits & !mask != 0 {
                return Err(Reject::with_detail(
                    StratumCode::Other,
                    format!("version bits {bits:08x} outside mask {mask:08x}"),
                ));
            }
            (template.version as u32 & !mask | (bits & mask)) as i32
        }
    };

    let mut extranonce =
        Vec::with_capacity(ctx.extranonce1.len() + submit.extranonce2.len());
    extranonce.extend_from_slice(ctx.extranonce1);
    extranonce.extend_from_slice(&submit.extranonce2);

    let txid = job
        .coinbase
        .txid_le(&extranonce)
        .map_err(|e| Reject::with_detail(StratumCode::Other, e.to_string()))?;
    let merkle_root = codec::merkle_root_from_branches(txid, &job.merkle_branches);

    let header = build_header(
        version,
        &template.prev_hash,
        &merkle_root,
        submit.ntime,
        template.bits.to_consensus(),
        submit.nonce,
    );

    let hash_le = codec::double_sha256(&header);
    let hash_target = Target::from_le_bytes(hash_le);

    let share_target = Difficulty::from_f64(ctx.assigned_difficulty).to_target();
    if hash_target > share_target {
        return Err(Reject::new(StratumCode::LowDifficulty));
    }

    let network_target = Target::from_compact(template.bits);
    let block = (hash_target <= network_target).then(|| {
        let mut hash_be = hash_le;
        hash_be.reverse();
        BlockCandidate {
            header,
            extranonce: extranonce.clone(),
            hash_hex: hex::encode(hash_be),
        }
    });

    Ok(ValidShare {
        hash_le,
        hash_difficulty: codec::difficulty_from_hash(&hash_le),
        block,
    })
}

fn build_header(
    version: i32,
    prev_hash: &bitcoin::BlockHash,
    merkle_root_le: &[u8; 32],
    ntime: u32,
    bits: u32,
    nonce: u32,
) -> [u8; 80] {
    use bitcoin::hashes::Hash;

    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version.to_le_bytes());
    header[4..36].copy_from_slice(prev_hash.as_byte_array());
    header[36..68].copy_from_slice(merkle_root_le);
    header[68..72].copy_from_slice(&ntime.to_le_bytes());
    header[72..76].copy_from_slice(&bits.to_le_bytes());
    header[76..80].copy_from_slice(&nonce.to_le_bytes());
    header
}
