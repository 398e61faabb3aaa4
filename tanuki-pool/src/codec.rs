//! Bitcoin wire primitives used across the job pipeline.
//!
//! Pure, deterministic helpers: compact-size integers, script pushes,
//! double-SHA256, merkle branch math, address-to-script conversion and
//! target arithmetic. Everything here is side-effect free; the heavy
//! lifting for transaction and block types stays in the `bitcoin` crate,
//! these functions cover the byte-level pieces Stratum needs to hand out
//! (coinbase halves, branch lists, 80-byte headers).

use std::str::FromStr;

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::{Address, Network, ScriptBuf};

use crate::error::{Error, Result};

/// Encode a compact-size unsigned integer (Bitcoin "varint").
pub fn varint_encode(n: u64) -> Vec<u8> {
    match n {
        0..=0xfc => vec![n as u8],
        0xfd..=0xffff => {
            let mut v = vec![0xfd];
            v.extend_from_slice(&(n as u16).to_le_bytes());
            v
        }
        0x10000..=0xffff_ffff => {
            let mut v = vec![0xfe];
            v.extend_from_slice(&(n as u32).to_le_bytes());
            v
        }
        _ => {
            let mut v = vec![0xff];
            v.extend_from_slice(&n.to_le_bytes());
            v
        }
    }
}

/// Double-SHA256 of `data`.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Minimal script-number push, as required by BIP34 for the coinbase height.
///
/// Encodes `value` as a CScriptNum (little-endian, sign bit in the top byte)
/// and prefixes the direct push opcode. Only positive values are meaningful
/// here; zero encodes as an empty push.
pub fn script_int_push(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![0x00];
    }

    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut bytes = Vec::with_capacity(5);
    while abs > 0 {
        bytes.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    // A set high bit would flip the sign on decode, so pad with an
    // explicit sign byte.
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = bytes.last_mut().unwrap();
        *last |= 0x80;
    }

    let mut push = Vec::with_capacity(1 + bytes.len());
    push.push(bytes.len() as u8);
    push.extend_from_slice(&bytes);
    push
}

/// Raw data push: direct push below 76 bytes, OP_PUSHDATA1 up to 255.
///
/// Coinbase scriptSigs are capped at 100 bytes so longer pushes never occur.
pub fn data_push(data: &[u8]) -> Vec<u8> {
    let mut push = Vec::with_capacity(2 + data.len());
    if data.len() < 76 {
        push.push(data.len() as u8);
    } else {
        push.push(0x4c); // OP_PUSHDATA1
        push.push(data.len() as u8);
    }
    push.extend_from_slice(data);
    push
}

/// Convert a Bitcoin address string to its scriptPubKey, validating the
/// network. Supports legacy P2PKH/P2SH and bech32 P2WPKH/P2WSH (plus
/// taproot, which parses the same way).
pub fn address_to_script(address: &str, network: Network) -> Result<ScriptBuf> {
    let parsed = Address::from_str(address)
        .map_err(|e| Error::Address(format!("{address}: {e}")))?;
    let checked = parsed
        .require_network(network)
        .map_err(|e| Error::Address(format!("{address}: {e}")))?;
    Ok(checked.script_pubkey())
}

/// Expand compact difficulty bits into a full 256-bit target.
pub fn compact_to_target(bits: u32) -> Target {
    Target::from_compact(CompactTarget::from_consensus(bits))
}

/// Difficulty represented by a block hash.
///
/// The hash (little-endian byte order, as produced by double-SHA256 of the
/// header) is interpreted as the target it met; the result is
/// `diff1_target / hash` as a float. A zero hash saturates to infinity.
pub fn difficulty_from_hash(hash_le: &[u8; 32]) -> f64 {
    if hash_le.iter().all(|&b| b == 0) {
        return f64::INFINITY;
    }
    Target::from_le_bytes(*hash_le).difficulty_float()
}

/// Merkle branches for the coinbase at position 0.
///
/// `txids` are the non-coinbase transaction ids in block order, little-endian
/// byte order. The returned branches let a miner recompute the root from only
/// the coinbase hash: at each tree level the first node after the (unknown)
/// coinbase chain is emitted, then the level is folded pairwise.
pub fn merkle_branches(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branches = Vec::new();
    // The coinbase slot is tracked as None; its value is never needed to
    // compute the siblings along its path.
    let mut level: Vec<Option<[u8; 32]>> =
        std::iter::once(None).chain(txids.iter().copied().map(Some)).collect();

    while level.len() > 1 {
        branches.push(level[1].expect("sibling of coinbase path is always known"));

        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }

        level = level
            .chunks(2)
            .map(|pair| match (pair[0], pair[1]) {
                (Some(a), Some(b)) => {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(&a);
                    buf[32..].copy_from_slice(&b);
                    Some(double_sha256(&buf))
                }
                // The pair containing the coinbase folds to the next
                // unknown slot.
                _ => None,
            })
            .collect();
    }

    branches
}

/// Fold a leaf hash up through precomputed merkle branches.
///
/// With no branches the root is the leaf itself (a one-transaction block).
pub fn merkle_root_from_branches(leaf: [u8; 32], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut root = leaf;
    let mut buf = [0u8; 64];
    for branch in branches {
        buf[..32].copy_from_slice(&root);
        buf[32..].copy_from_slice(branch);
        root = double_sha256(&buf);
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, &[0x00]; "zero")]
    #[test_case(1, &[0x01]; "one")]
    #[test_case(0xfc, &[0xfc]; "single byte max")]
    #[test_case(0xfd, &[0xfd, 0xfd, 0x00]; "two byte min")]
    #[test_case(0xffff, &[0xfd, 0xff, 0xff]; "two byte max")]
    #[test_case(0x10000, &[0xfe, 0x00, 0x00, 0x01, 0x00]; "four byte min")]
    fn varint_known_encodings(n: u64, expected: &[u8]) {
        assert_eq!(varint_encode(n), expected);
    }

    #[test]
    fn varint_eight_byte() {
        let v = varint_encode(0x1_0000_0000);
        assert_eq!(v[0], 0xff);
        assert_eq!(v.len(), 9);
    }

    #[test]
    fn double_sha256_empty_vector() {
        // Known digest of the empty string.
        assert_eq!(
            hex::encode(double_sha256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test_case(1, &[0x01, 0x01]; "height one")]
    #[test_case(16, &[0x01, 0x10]; "height sixteen")]
    #[test_case(127, &[0x01, 0x7f]; "single byte boundary")]
    #[test_case(128, &[0x02, 0x80, 0x00]; "sign padding")]
    #[test_case(840_000, &[0x03, 0x40, 0xd1, 0x0c]; "mainnet scale height")]
    fn script_int_push_minimal(value: i64, expected: &[u8]) {
        assert_eq!(script_int_push(value), expected);
    }

    #[test]
    fn data_push_direct_and_pushdata1() {
        let short = data_push(&[0xab; 75]);
        assert_eq!(short[0], 75);
        assert_eq!(short.len(), 76);

        let long = data_push(&[0xab; 76]);
        assert_eq!(&long[..2], &[0x4c, 76]);
        assert_eq!(long.len(), 78);
    }

    #[test]
    fn address_to_script_p2pkh() {
        // The well-known genesis payout address.
        let script =
            address_to_script("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", Network::Bitcoin).unwrap();
        assert!(script.is_p2pkh());
    }

    #[test]
    fn address_to_script_bech32() {
        let script = address_to_script(
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4",
            Network::Bitcoin,
        )
        .unwrap();
        assert!(script.is_p2wpkh());
    }

    #[test]
    fn address_to_script_rejects_wrong_network() {
        let err = address_to_script("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", Network::Regtest);
        assert!(matches!(err, Err(Error::Address(_))));
    }

    #[test]
    fn address_to_script_rejects_garbage() {
        assert!(address_to_script("not-an-address", Network::Bitcoin).is_err());
    }

    #[test]
    fn compact_to_target_diff1() {
        assert_eq!(compact_to_target(0x1d00ffff), Target::MAX);
    }

    #[test]
    fn difficulty_from_diff1_hash_is_one() {
        // A hash exactly equal to the difficulty-1 target has difficulty 1.
        let hash = Target::MAX.to_le_bytes();
        let diff = difficulty_from_hash(&hash);
        assert!((diff - 1.0).abs() < 1e-6, "got {diff}");
    }

    #[test]
    fn difficulty_from_zero_hash_saturates() {
        assert!(difficulty_from_hash(&[0u8; 32]).is_infinite());
    }

    #[test]
    fn merkle_single_transaction_root_is_leaf() {
        let leaf = [7u8; 32];
        assert!(merkle_branches(&[]).is_empty());
        assert_eq!(merkle_root_from_branches(leaf, &[]), leaf);
    }

    #[test]
    fn merkle_two_leaves() {
        let coinbase = [1u8; 32];
        let other = [2u8; 32];
        let branches = merkle_branches(&[other]);
        assert_eq!(branches, vec![other]);

        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&coinbase);
        buf[32..].copy_from_slice(&other);
        assert_eq!(
            merkle_root_from_branches(coinbase, &branches),
            double_sha256(&buf)
        );
    }

    /// The folded root must match a full bottom-up merkle computation for
    /// any transaction count, including the odd-leaf duplication rule.
    #[test_case(2; "three leaves total")]
    #[test_case(3; "four leaves total")]
    #[test_case(6; "seven leaves total")]
    #[test_case(12; "thirteen leaves total")]
    fn merkle_fold_matches_full_tree(n_txids: usize) {
        let coinbase = [0xccu8; 32];
        let txids: Vec<[u8; 32]> = (0..n_txids).map(|i| [i as u8 + 1; 32]).collect();

        let branches = merkle_branches(&txids);
        let folded = merkle_root_from_branches(coinbase, &branches);

        // Reference: classic pairwise tree over all leaves.
        let mut level: Vec<[u8; 32]> =
            std::iter::once(coinbase).chain(txids.iter().copied()).collect();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().unwrap());
            }
            level = level
                .chunks(2)
                .map(|p| {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(&p[0]);
                    buf[32..].copy_from_slice(&p[1]);
                    double_sha256(&buf)
                })
                .collect();
        }

        assert_eq!(folded, level[0]);
    }
}
