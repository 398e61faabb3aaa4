//! Coinbase construction.
//!
//! Builds the two coinbase halves handed to miners over Stratum. The
//! scriptSig carries, in order: the BIP34 height push, the optional opaque
//! script-time push, the template's coinbaseaux flags, the extranonce
//! region (a single data push sized `extranonce1 + template_extranonce2`),
//! then the pool message and tag pushes. Part 1 ends at the extranonce
//! push opcode; miners splice `extranonce1 ‖ extranonce2` between the
//! halves. Part 2 opens with the reserved bytes the miner never rolls
//! (`template_extranonce2 − extranonce2` zeros), so the advertised sizes
//! concatenate byte-exactly.
//!
//! The serialization miners hash is non-witness; the block submission path
//! asks for the witness form, which adds the segwit marker and the 32-byte
//! reserved witness item whenever the template commits to witnesses.

use bitcoin::ScriptBuf;

use crate::codec;
use crate::error::{Error, Result};

const TX_VERSION: u32 = 2;
const WITNESS_COMMITMENT_LEN: usize = 38;
const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Inputs to coinbase construction for one job.
#[derive(Debug, Clone)]
pub struct CoinbaseBuilder {
    height: i64,
    value: u64,
    worker_script: ScriptBuf,
    fee: Option<(ScriptBuf, f64)>,
    donation: Option<(ScriptBuf, f64)>,
    witness_commitment: Option<Vec<u8>>,
    aux_flags: Option<Vec<u8>>,
    message: Option<String>,
    pool_tag: Option<String>,
    script_time: u32,
    extranonce1_size: usize,
    extranonce2_size: usize,
    template_extranonce2_size: usize,
    max_scriptsig_bytes: usize,
}

impl CoinbaseBuilder {
    pub fn new(height: i64, value: u64, worker_script: ScriptBuf) -> Self {
        Self {
            height,
            value,
            worker_script,
            fee: None,
            donation: None,
            witness_commitment: None,
            aux_flags: None,
            message: None,
            pool_tag: None,
            script_time: 0,
            extranonce1_size: 4,
            extranonce2_size: 4,
            template_extranonce2_size: 8,
            max_scriptsig_bytes: 100,
        }
    }

    pub fn fee(mut self, script: ScriptBuf, percent: f64) -> Self {
        self.fee = Some((script, percent));
        self
    }

    pub fn donation(mut self, script: ScriptBuf, percent: f64) -> Self {
        self.donation = Some((script, percent));
        self
    }

    pub fn witness_commitment(mut self, script: Vec<u8>) -> Self {
        self.witness_commitment = Some(script);
        self
    }

    pub fn aux_flags(mut self, flags: Vec<u8>) -> Self {
        self.aux_flags = Some(flags);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn pool_tag(mut self, tag: impl Into<String>) -> Self {
        self.pool_tag = Some(tag.into());
        self
    }

    pub fn script_time(mut self, script_time: u32) -> Self {
        self.script_time = script_time;
        self
    }

    pub fn extranonce_sizes(
        mut self,
        extranonce1: usize,
        extranonce2: usize,
        template_extranonce2: usize,
    ) -> Self {
        self.extranonce1_size = extranonce1;
        self.extranonce2_size = extranonce2;
        self.template_extranonce2_size = template_extranonce2;
        self
    }

    pub fn max_scriptsig_bytes(mut self, max: usize) -> Self {
        self.max_scriptsig_bytes = max;
        self
    }

    /// Split the reward between fee, donation and worker outputs.
    ///
    /// Percentages are rounded to whole satoshis and clamped to the total;
    /// the worker takes the remainder and must end up with a positive
    /// amount.
    fn split_value(&self) -> Result<(Option<u64>, Option<u64>, u64)> {
        let cut = |percent: f64| -> u64 {
            let raw = (self.value as f64 * percent / 100.0).round();
            (raw.max(0.0) as u64).min(self.value)
        };

        let fee = self.fee.as_ref().map(|(_, pct)| cut(*pct)).filter(|v| *v > 0);
        let donation = self
            .donation
            .as_ref()
            .map(|(_, pct)| cut(*pct))
            .filter(|v| *v > 0);

        let taken = fee.unwrap_or(0) + donation.unwrap_or(0);
        let worker = self
            .value
            .checked_sub(taken)
            .ok_or_else(|| Error::Coinbase("fee and donation exceed reward".into()))?;
        if worker == 0 {
            return Err(Error::Coinbase("worker output would be empty".into()));
        }

        Ok((fee, donation, worker))
    }

    fn script_sig_pieces(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.height <= 0 {
            return Err(Error::Coinbase(format!("height {} not positive", self.height)));
        }
        if self.template_extranonce2_size < self.extranonce2_size {
            return Err(Error::Coinbase(format!(
                "reserved extranonce2 {} smaller than advertised {}",
                self.template_extranonce2_size, self.extranonce2_size
            )));
        }

        let mut prefix = codec::script_int_push(self.height);
        if self.script_time > 0 {
            prefix.extend(codec::data_push(&self.script_time.to_le_bytes()));
        }
        if let Some(flags) = &self.aux_flags {
            prefix.extend_from_slice(flags);
        }

        let extranonce_len = self.extranonce1_size + self.template_extranonce2_size;
        if extranonce_len == 0 || extranonce_len >= 76 {
            return Err(Error::Coinbase(format!(
                "extranonce region {extranonce_len} bytes not pushable"
            )));
        }
        prefix.push(extranonce_len as u8);

        let mut suffix = Vec::new();
        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            suffix.extend(codec::data_push(message.as_bytes()));
        }
        if let Some(tag) = self.pool_tag.as_deref().filter(|t| !t.is_empty()) {
            suffix.extend(codec::data_push(tag.as_bytes()));
        }

        let script_sig_len = prefix.len() + extranonce_len + suffix.len();
        if script_sig_len > self.max_scriptsig_bytes {
            return Err(Error::Coinbase(format!(
                "scriptSig {script_sig_len} bytes exceeds limit {}",
                self.max_scriptsig_bytes
            )));
        }

        Ok((prefix, suffix))
    }

    fn outputs(&self) -> Result<(Vec<u8>, Vec<u64>)> {
        if let Some(commitment) = &self.witness_commitment {
            if commitment.len() != WITNESS_COMMITMENT_LEN
                || commitment[..6] != WITNESS_COMMITMENT_HEADER
            {
                return Err(Error::Coinbase(format!(
                    "witness commitment script malformed ({} bytes)",
                    commitment.len()
                )));
            }
        }

        let (fee, donation, worker) = self.split_value()?;

        let mut encoded = Vec::new();
        let mut values = Vec::new();
        let mut push_output = |value: u64, script: &[u8], out: &mut Vec<u8>| {
            out.extend_from_slice(&value.to_le_bytes());
            out.extend(codec::varint_encode(script.len() as u64));
            out.extend_from_slice(script);
            values.push(value);
        };

        let mut body = Vec::new();
        let mut count = 0u64;
        if let (Some(fee_value), Some((script, _))) = (fee, self.fee.as_ref()) {
            push_output(fee_value, script.as_bytes(), &mut body);
            count += 1;
        }
        if let (Some(donation_value), Some((script, _))) = (donation, self.donation.as_ref()) {
            push_output(donation_value, script.as_bytes(), &mut body);
            count += 1;
        }
        push_output(worker, self.worker_script.as_bytes(), &mut body);
        count += 1;
        if let Some(commitment) = &self.witness_commitment {
            push_output(0, commitment, &mut body);
            count += 1;
        }

        encoded.extend(codec::varint_encode(count));
        encoded.extend(body);
        Ok((encoded, values))
    }

    /// Build the split coinbase.
    pub fn build(&self) -> Result<CoinbaseParts> {
        let (prefix, suffix) = self.script_sig_pieces()?;
        let (outputs, output_values) = self.outputs()?;

        let extranonce_region = self.extranonce1_size + self.template_extranonce2_size;
        let script_len = prefix.len() + extranonce_region + suffix.len();

        let mut part1 = Vec::new();
        part1.extend_from_slice(&TX_VERSION.to_le_bytes());
        part1.push(0x01); // one input
        part1.extend_from_slice(&[0u8; 32]); // null outpoint
        part1.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
        part1.extend(codec::varint_encode(script_len as u64));
        part1.extend_from_slice(&prefix);

        let mut part2 = Vec::new();
        // Reserved extranonce bytes the miner never sees.
        part2.extend(std::iter::repeat(0u8).take(
            self.template_extranonce2_size - self.extranonce2_size,
        ));
        part2.extend_from_slice(&suffix);
        part2.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence
        part2.extend(outputs);
        part2.extend_from_slice(&0u32.to_le_bytes()); // locktime

        Ok(CoinbaseParts {
            part1,
            part2,
            extranonce_len: self.extranonce1_size + self.extranonce2_size,
            has_witness: self.witness_commitment.is_some(),
            output_values,
        })
    }
}

/// A built coinbase, split around the miner-rolled extranonce region.
#[derive(Debug, Clone)]
pub struct CoinbaseParts {
    pub part1: Vec<u8>,
    pub part2: Vec<u8>,
    /// `extranonce1_size + extranonce2_size`, the advertised region
    extranonce_len: usize,
    has_witness: bool,
    /// Output values in serialization order, for accounting
    pub output_values: Vec<u64>,
}

impl CoinbaseParts {
    pub fn extranonce_len(&self) -> usize {
        self.extranonce_len
    }

    /// Non-witness serialization with the miner's extranonce spliced in.
    pub fn assemble(&self, extranonce: &[u8]) -> Result<Vec<u8>> {
        if extranonce.len() != self.extranonce_len {
            return Err(Error::Coinbase(format!(
                "extranonce {} bytes, expected {}",
                extranonce.len(),
                self.extranonce_len
            )));
        }
        let mut tx = Vec::with_capacity(self.part1.len() + extranonce.len() + self.part2.len());
        tx.extend_from_slice(&self.part1);
        tx.extend_from_slice(extranonce);
        tx.extend_from_slice(&self.part2);
        Ok(tx)
    }

    /// Coinbase txid, little-endian byte order.
    pub fn txid_le(&self, extranonce: &[u8]) -> Result<[u8; 32]> {
        Ok(codec::double_sha256(&self.assemble(extranonce)?))
    }

    /// Serialization for block submission: witness form (with the 32-byte
    /// reserved value) when the job committed to witnesses, otherwise the
    /// plain form.
    pub fn block_serialization(&self, extranonce: &[u8]) -> Result<Vec<u8>> {
        let plain = self.assemble(extranonce)?;
        if !self.has_witness {
            return Ok(plain);
        }

        let mut tx = Vec::with_capacity(plain.len() + 2 + 2 + 34);
        tx.extend_from_slice(&plain[..4]); // version
        tx.extend_from_slice(&[0x00, 0x01]); // segwit marker + flag
        tx.extend_from_slice(&plain[4..plain.len() - 4]); // inputs + outputs
        tx.push(0x01); // one witness item
        tx.push(0x20);
        tx.extend_from_slice(&[0u8; 32]); // reserved value
        tx.extend_from_slice(&plain[plain.len() - 4..]); // locktime
        Ok(tx)
    }

    /// Total serialized length for any valid extranonce.
    pub fn total_len(&self) -> usize {
        self.part1.len() + self.extranonce_len + self.part2.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::encode::{deserialize, serialize};
    use bitcoin::{Network, Transaction};

    use crate::codec::address_to_script;

    const REGTEST_WORKER: &str = "bcrt1q0tw7t5tlv5qdxspmwxzv4xrree3exfedwffmy7";
    const REGTEST_FEE: &str = "bcrt1qtazhagd98jt839cp5zszajaq3j2e38gherkxtv";
    const REGTEST_DONATION: &str = "bcrt1qgqr5jq5a2qtcf6jcf52d8jeyul4lsp76wwye9n";

    fn worker_script() -> ScriptBuf {
        address_to_script(REGTEST_WORKER, Network::Regtest).unwrap()
    }

    fn builder(value: u64) -> CoinbaseBuilder {
        CoinbaseBuilder::new(1, value, worker_script())
    }

    fn commitment() -> Vec<u8> {
        let mut script = WITNESS_COMMITMENT_HEADER.to_vec();
        script.extend_from_slice(&[0x11; 32]);
        script
    }

    #[test]
    fn single_output_takes_whole_reward() {
        let parts = builder(5_000_000_000).build().unwrap();
        assert_eq!(parts.output_values, vec![5_000_000_000]);
    }

    #[test]
    fn dual_output_fee_split() {
        let fee_script = address_to_script(REGTEST_FEE, Network::Regtest).unwrap();
        let parts = builder(5_000_000_000)
            .fee(fee_script, 2.0)
            .build()
            .unwrap();
        assert_eq!(parts.output_values, vec![100_000_000, 4_900_000_000]);
    }

    #[test]
    fn triple_output_sums_to_reward() {
        let fee_script = address_to_script(REGTEST_FEE, Network::Regtest).unwrap();
        let donation_script = address_to_script(REGTEST_DONATION, Network::Regtest).unwrap();
        let parts = builder(5_000_000_000)
            .fee(fee_script, 1.5)
            .donation(donation_script, 0.5)
            .build()
            .unwrap();
        assert_eq!(parts.output_values.len(), 3);
        assert_eq!(parts.output_values.iter().sum::<u64>(), 5_000_000_000);
    }

    #[test]
    fn full_fee_leaves_no_worker_value() {
        let fee_script = address_to_script(REGTEST_FEE, Network::Regtest).unwrap();
        let err = builder(1000).fee(fee_script, 100.0).build();
        assert!(matches!(err, Err(Error::Coinbase(_))));
    }

    #[test]
    fn nonpositive_height_fails() {
        let err = CoinbaseBuilder::new(0, 1000, worker_script()).build();
        assert!(matches!(err, Err(Error::Coinbase(_))));
    }

    #[test]
    fn parts_lengths_are_consistent() {
        let parts = builder(5_000_000_000)
            .extranonce_sizes(4, 4, 8)
            .message("tanuki")
            .build()
            .unwrap();
        // cb1 + en1 + en2 + cb2 equals the full serialization.
        assert_eq!(parts.extranonce_len(), 8);
        let assembled = parts.assemble(&[0xab; 8]).unwrap();
        assert_eq!(assembled.len(), parts.total_len());
        // Reserved bytes sit at the head of part 2.
        assert_eq!(&parts.part2[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn roundtrips_through_consensus_codec() {
        let parts = builder(5_000_000_000)
            .message("solo mining")
            .pool_tag("/tanuki/")
            .build()
            .unwrap();
        let raw = parts.assemble(&[0x42; 8]).unwrap();

        let tx: Transaction = deserialize(&raw).expect("coinbase deserializes");
        assert!(tx.is_coinbase());
        assert_eq!(serialize(&tx), raw, "round-trip must be byte identical");
        assert_eq!(
            tx.compute_txid().to_string(),
            {
                let mut txid = parts.txid_le(&[0x42; 8]).unwrap();
                txid.reverse();
                hex::encode(txid)
            },
            "txid must match the consensus computation"
        );
    }

    #[test]
    fn witness_serialization_roundtrips() {
        let parts = builder(5_000_000_000)
            .witness_commitment(commitment())
            .build()
            .unwrap();
        let extranonce = [0x42; 8];

        let witness_raw = parts.block_serialization(&extranonce).unwrap();
        let tx: Transaction = deserialize(&witness_raw).expect("witness coinbase deserializes");
        assert_eq!(tx.input[0].witness.len(), 1);
        assert_eq!(tx.input[0].witness.nth(0).unwrap(), [0u8; 32]);
        assert_eq!(serialize(&tx), witness_raw);

        // The witness form must hash to the same txid as the plain form.
        let mut expected = parts.txid_le(&extranonce).unwrap();
        expected.reverse();
        assert_eq!(tx.compute_txid().to_string(), hex::encode(expected));
    }

    #[test]
    fn witness_commitment_output_is_last_and_zero_valued() {
        let parts = builder(5_000_000_000)
            .witness_commitment(commitment())
            .build()
            .unwrap();
        assert_eq!(parts.output_values, vec![5_000_000_000, 0]);
    }

    #[test]
    fn malformed_witness_commitment_fails() {
        let err = builder(1000).witness_commitment(vec![0x6a; 10]).build();
        assert!(matches!(err, Err(Error::Coinbase(_))));
    }

    #[test]
    fn oversized_scriptsig_fails() {
        let err = builder(1000).message("x".repeat(120)).build();
        assert!(matches!(err, Err(Error::Coinbase(_))));
    }

    #[test]
    fn bip34_height_is_first_push() {
        let parts = CoinbaseBuilder::new(840_000, 5_000_000_000, worker_script())
            .build()
            .unwrap();
        let raw = parts.assemble(&[0; 8]).unwrap();
        let tx: Transaction = deserialize(&raw).unwrap();
        let script_sig = &tx.input[0].script_sig;
        // 0x03 40 d1 0c: three-byte push of 840000.
        assert_eq!(&script_sig.as_bytes()[..4], &[0x03, 0x40, 0xd1, 0x0c]);
    }

    #[test]
    fn script_time_pushed_only_when_nonzero() {
        let without = builder(1000).build().unwrap();
        let with = builder(1000).script_time(0x5f5e_0f00).build().unwrap();
        assert_eq!(with.part1.len(), without.part1.len() + 5);
    }

    #[test]
    fn wider_reserved_region_pads_part2() {
        let narrow = builder(1000).extranonce_sizes(4, 4, 4).build().unwrap();
        let wide = builder(1000).extranonce_sizes(4, 4, 8).build().unwrap();
        assert_eq!(wide.part2.len(), narrow.part2.len() + 4);
        // Both advertise the same miner-visible region.
        assert_eq!(narrow.extranonce_len(), wide.extranonce_len());
        // And both serialize to a well-formed transaction.
        let tx: Transaction = deserialize(&wide.assemble(&[1; 8]).unwrap()).unwrap();
        assert!(tx.is_coinbase());
    }
}
