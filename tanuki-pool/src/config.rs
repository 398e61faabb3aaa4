//! Pool configuration.
//!
//! Configuration is deserialized from a JSON document by the daemon (file
//! discovery and format negotiation happen outside this crate); every knob
//! has a default so a minimal config only names the network, the node RPC
//! endpoint and the payout address. [`Config::validate`] performs the fatal
//! startup checks — an invalid config must abort before any listener opens.

use std::path::PathBuf;
use std::time::Duration;

use bitcoin::Network;
use serde::Deserialize;

use crate::codec;
use crate::error::{Error, Result};

/// Top-level configuration for the pool daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chain the pool mines on; fixed at startup.
    pub network: Network,

    /// Node RPC and ZMQ endpoints
    pub node: NodeConfig,

    /// Stratum server and per-connection behavior
    pub stratum: StratumConfig,

    /// Coinbase payout construction
    pub payout: PayoutConfig,

    /// VarDiff controller
    pub vardiff: VardiffConfig,

    /// Ban accounting
    pub bans: BanConfig,

    /// TCP accept rate limits
    pub accept: AcceptConfig,

    /// On-disk state directory (ban list, pending submissions, found blocks)
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            node: NodeConfig::default(),
            stratum: StratumConfig::default(),
            payout: PayoutConfig::default(),
            vardiff: VardiffConfig::default(),
            bans: BanConfig::default(),
            accept: AcceptConfig::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Node RPC endpoint and authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// JSON-RPC URL, e.g. `http://127.0.0.1:8332`
    pub rpc_url: String,

    /// Explicit RPC credentials; when absent, cookie auth is used
    pub rpc_user: Option<String>,
    pub rpc_pass: Option<String>,

    /// Explicit cookie file path; when absent, autodetected from the
    /// standard datadir locations for the configured network
    pub cookie_path: Option<PathBuf>,

    /// Node datadir used for cookie autodetection
    pub datadir: Option<PathBuf>,

    /// ZMQ hashblock endpoint, e.g. `tcp://127.0.0.1:28332`
    pub zmq_hashblock: Option<String>,

    /// Template poll interval
    pub template_poll_secs: u64,

    /// Chain-info poll interval
    pub chain_info_poll_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8332".into(),
            rpc_user: None,
            rpc_pass: None,
            cookie_path: None,
            datadir: None,
            zmq_hashblock: None,
            template_poll_secs: 5,
            chain_info_poll_secs: 15,
        }
    }
}

/// Stratum listener and per-connection protocol parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    /// Listen address for plain TCP
    pub listen: String,

    /// Hard cap on concurrent miner connections
    pub max_conns: usize,

    /// Extranonce1 bytes assigned per connection
    pub extranonce1_size: usize,

    /// Extranonce2 bytes advertised to miners
    pub extranonce2_size: usize,

    /// Extranonce2 bytes reserved inside the coinbase script; must be at
    /// least `extranonce2_size`
    pub template_extranonce2_size: usize,

    /// Difficulty assigned at authorize
    pub start_diff: f64,
    pub min_diff: f64,
    pub max_diff: f64,

    /// Honor mining.suggest_difficulty permanently (VarDiff stops adjusting)
    pub lock_suggested_difficulty: bool,

    /// Version-rolling bits the pool permits (BIP320 range by default)
    pub version_mask: u32,

    /// Seconds a connection may idle before mining.subscribe
    pub subscribe_timeout_secs: u64,

    /// Allowed ntime roll past max(curtime, now)
    pub ntime_forward_slack_secs: u64,

    /// Upper bound on the coinbase scriptSig
    pub coinbase_scriptsig_max_bytes: usize,

    /// Jobs retained for late shares
    pub max_recent_jobs: usize,

    /// Duplicate-share fingerprints remembered per job per connection
    pub max_seen_shares_per_job: usize,

    /// Display hashrate EMA time constant; the control EMA runs at a sixth
    pub hashrate_tau_secs: u64,

    /// Status reporting window
    pub status_window_secs: u64,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3333".into(),
            max_conns: 1024,
            extranonce1_size: 4,
            extranonce2_size: 4,
            template_extranonce2_size: 8,
            start_diff: 1024.0,
            min_diff: 16.0,
            max_diff: 1_099_511_627_776.0, // 2^40
            lock_suggested_difficulty: false,
            version_mask: 0x1fffe000,
            subscribe_timeout_secs: 15,
            ntime_forward_slack_secs: 600,
            coinbase_scriptsig_max_bytes: 100,
            max_recent_jobs: 3,
            max_seen_shares_per_job: 4096,
            hashrate_tau_secs: 600,
            status_window_secs: 300,
        }
    }
}

/// Coinbase output construction.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PayoutConfig {
    /// Address receiving the worker remainder; required
    pub payout_address: Option<String>,

    /// Pool fee output
    pub fee_address: Option<String>,
    pub fee_percent: f64,

    /// Optional donation output
    pub donation_address: Option<String>,
    pub donation_percent: f64,

    /// Free-form message embedded in the coinbase scriptSig
    pub coinbase_message: Option<String>,

    /// Short pool tag appended after the message
    pub pool_tag: Option<String>,

    /// Opaque 4-byte scriptSig push, emitted when non-zero
    pub script_time: u32,
}

/// VarDiff controller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VardiffConfig {
    /// Adjustment window length
    pub adjustment_window_secs: u64,

    /// Target accepted-share rate per connection, shares per minute
    pub target_shares_per_min: f64,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            adjustment_window_secs: 120,
            target_shares_per_min: 20.0,
        }
    }
}

/// Ban thresholds for misbehaving workers and reconnect-abusing IPs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BanConfig {
    pub invalid_submissions_after: u32,
    pub invalid_submissions_window_secs: u64,
    pub invalid_submissions_duration_secs: u64,

    pub reconnect_window_secs: u64,
    pub reconnect_threshold: u32,
    pub reconnect_duration_secs: u64,
    pub reconnect_max_entries: usize,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            invalid_submissions_after: 30,
            invalid_submissions_window_secs: 600,
            invalid_submissions_duration_secs: 3600,
            reconnect_window_secs: 60,
            reconnect_threshold: 20,
            reconnect_duration_secs: 600,
            reconnect_max_entries: 65536,
        }
    }
}

/// Accept-loop token bucket.
///
/// With `auto` enabled (the default) the explicit rates are ignored and the
/// limits derive from `max_conns`: the burst admits `burst_percent` of the
/// fleet within `burst_window_secs`, the startup rate lets every miner
/// reconnect within `reconnect_window_secs`, and after
/// `steady_state_window_secs` the bucket drops to a steady rate sized for
/// `steady_state_reconnect_percent` of the fleet per
/// `steady_state_reconnect_window_secs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcceptConfig {
    pub auto_accept_rate_limits: bool,

    pub max_accepts_per_second: f64,
    pub max_accept_burst: f64,
    pub accept_steady_state_rate: f64,

    pub accept_steady_state_window_secs: u64,
    pub accept_burst_percent: f64,
    pub accept_burst_window_secs: u64,
    pub accept_reconnect_window_secs: u64,
    pub accept_steady_state_reconnect_percent: f64,
    pub accept_steady_state_reconnect_window_secs: u64,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            auto_accept_rate_limits: true,
            max_accepts_per_second: 50.0,
            max_accept_burst: 100.0,
            accept_steady_state_rate: 5.0,
            accept_steady_state_window_secs: 300,
            accept_burst_percent: 25.0,
            accept_burst_window_secs: 10,
            accept_reconnect_window_secs: 60,
            accept_steady_state_reconnect_percent: 10.0,
            accept_steady_state_reconnect_window_secs: 60,
        }
    }
}

impl Config {
    /// Fatal startup validation.
    ///
    /// Errors here must abort the daemon before any listener opens.
    pub fn validate(&self) -> Result<()> {
        let payout = self
            .payout
            .payout_address
            .as_deref()
            .ok_or_else(|| Error::Config("payout_address is required".into()))?;
        codec::address_to_script(payout, self.network)?;

        if let Some(addr) = self.payout.fee_address.as_deref() {
            codec::address_to_script(addr, self.network)?;
        }
        if let Some(addr) = self.payout.donation_address.as_deref() {
            codec::address_to_script(addr, self.network)?;
        }

        for (name, pct) in [
            ("fee_percent", self.payout.fee_percent),
            ("donation_percent", self.payout.donation_percent),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(Error::Config(format!("{name} {pct} out of range")));
            }
        }

        let s = &self.stratum;
        if s.extranonce1_size == 0 || s.extranonce1_size > 8 {
            return Err(Error::Config(format!(
                "extranonce1_size {} out of range 1-8",
                s.extranonce1_size
            )));
        }
        if s.extranonce2_size == 0 || s.extranonce2_size > 8 {
            return Err(Error::Config(format!(
                "extranonce2_size {} out of range 1-8",
                s.extranonce2_size
            )));
        }
        if s.template_extranonce2_size < s.extranonce2_size {
            return Err(Error::Config(format!(
                "template_extranonce2_size {} smaller than extranonce2_size {}",
                s.template_extranonce2_size, s.extranonce2_size
            )));
        }
        if s.min_diff <= 0.0 || s.max_diff < s.min_diff {
            return Err(Error::Config(format!(
                "difficulty bounds [{}, {}] invalid",
                s.min_diff, s.max_diff
            )));
        }
        if !(s.min_diff..=s.max_diff).contains(&s.start_diff) {
            return Err(Error::Config(format!(
                "start_diff {} outside [{}, {}]",
                s.start_diff, s.min_diff, s.max_diff
            )));
        }

        Ok(())
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.stratum.subscribe_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config {
            network: Network::Regtest,
            ..Config::default()
        };
        config.payout.payout_address =
            Some("bcrt1q0tw7t5tlv5qdxspmwxzv4xrree3exfedwffmy7".into());
        config
    }

    #[test]
    fn default_config_fails_without_payout_address() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn payout_address_network_mismatch_is_fatal() {
        let mut config = valid_config();
        config.network = Network::Bitcoin;
        assert!(config.validate().is_err());
    }

    #[test]
    fn template_extranonce2_must_cover_advertised() {
        let mut config = valid_config();
        config.stratum.extranonce2_size = 8;
        config.stratum.template_extranonce2_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn fee_percent_bounds() {
        let mut config = valid_config();
        config.payout.fee_percent = 101.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn start_diff_must_sit_inside_bounds() {
        let mut config = valid_config();
        config.stratum.start_diff = 1.0;
        config.stratum.min_diff = 16.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_json_config_deserializes() {
        let config: Config = serde_json::from_str(
            r#"{
                "network": "regtest",
                "payout": { "payout_address": "bcrt1q0tw7t5tlv5qdxspmwxzv4xrree3exfedwffmy7" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.network, Network::Regtest);
        config.validate().unwrap();
    }
}
