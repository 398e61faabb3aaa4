//! Bitcoin Core JSON-RPC client.
//!
//! A thin async client for the handful of node methods the pool uses:
//! `getblocktemplate`, `getblockchaininfo`, `submitblock` and
//! `validateaddress`. Authentication is HTTP Basic, from explicit
//! credentials or the node's `.cookie` file; the cookie is re-read on every
//! call so a node restart (which rewrites the cookie) heals without pool
//! intervention.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitcoin::Network;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Timeout for light polling calls.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for `submitblock`; a winning block is worth the wait.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum Auth {
    UserPass(String, String),
    Cookie(PathBuf),
}

/// Async JSON-RPC 1.0 client for the node.
#[derive(Debug)]
pub struct NodeClient {
    http: reqwest::Client,
    url: String,
    auth: Auth,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl NodeClient {
    pub fn new(config: &NodeConfig, network: Network) -> Result<Self> {
        let auth = match (&config.rpc_user, &config.rpc_pass) {
            (Some(user), Some(pass)) => Auth::UserPass(user.clone(), pass.clone()),
            _ => {
                let path = config
                    .cookie_path
                    .clone()
                    .unwrap_or_else(|| default_cookie_path(network, config.datadir.as_deref()));
                Auth::Cookie(path)
            }
        };

        Ok(Self {
            http: reqwest::Client::new(),
            url: config.rpc_url.clone(),
            auth,
            next_id: AtomicU64::new(1),
        })
    }

    /// Resolve credentials for this call.
    ///
    /// Cookie read failures surface as errors; the next call retries the
    /// read, so a node that is still starting up is not fatal.
    fn credentials(&self) -> Result<(String, String)> {
        match &self.auth {
            Auth::UserPass(user, pass) => Ok((user.clone(), pass.clone())),
            Auth::Cookie(path) => {
                let line = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cookie file {}: {e}", path.display()))
                })?;
                let line = line.trim();
                let (user, pass) = line.split_once(':').ok_or_else(|| {
                    Error::Config(format!("cookie file {} is malformed", path.display()))
                })?;
                Ok((user.to_string(), pass.to_string()))
            }
        }
    }

    /// Perform a call, returning the raw result value.
    ///
    /// A missing or null `result` comes back as `Value::Null`, which some
    /// methods (notably `submitblock`) use to signal success.
    async fn call_value(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let (user, pass) = self.credentials()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .basic_auth(user, Some(pass))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        let envelope: RpcEnvelope<Value> = response.json().await?;
        if let Some(err) = envelope.error {
            return Err(Error::Node {
                code: err.code,
                message: err.message,
            });
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<T> {
        let value = self.call_value(method, params, timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("{method}: malformed result: {e}")))
    }

    /// `getblocktemplate` with segwit rules, as every post-activation node
    /// requires.
    pub async fn get_block_template(&self) -> Result<GetBlockTemplate> {
        self.call(
            "getblocktemplate",
            json!([{ "rules": ["segwit"] }]),
            POLL_TIMEOUT,
        )
        .await
    }

    pub async fn get_blockchain_info(&self) -> Result<GetBlockchainInfo> {
        self.call("getblockchaininfo", json!([]), POLL_TIMEOUT).await
    }

    /// Submit a serialized block. `None` means the node accepted it; a
    /// string is the node's rejection reason.
    pub async fn submit_block(&self, block_hex: &str) -> Result<Option<String>> {
        let result = self
            .call_value("submitblock", json!([block_hex]), SUBMIT_TIMEOUT)
            .await?;
        match result {
            Value::Null => Ok(None),
            Value::String(reason) => Ok(Some(reason)),
            other => Err(Error::Protocol(format!(
                "submitblock: unexpected result {other}"
            ))),
        }
    }

    pub async fn validate_address(&self, address: &str) -> Result<ValidateAddress> {
        self.call("validateaddress", json!([address]), POLL_TIMEOUT)
            .await
    }
}

/// Result of `getblocktemplate`, limited to the fields the pool consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockTemplate {
    pub version: i32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    pub transactions: Vec<BlockTemplateTransaction>,
    #[serde(rename = "coinbaseaux", default)]
    pub coinbase_aux: std::collections::BTreeMap<String, String>,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(rename = "mintime")]
    pub min_time: u64,
    #[serde(rename = "curtime")]
    pub current_time: u64,
    pub bits: String,
    pub height: i64,
    #[serde(rename = "default_witness_commitment", default)]
    pub default_witness_commitment: Option<String>,
}

/// A non-coinbase transaction inside a block template.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplateTransaction {
    /// Raw transaction, hex
    pub data: String,
    /// Transaction id (big-endian hex)
    pub txid: String,
}

/// Result of `getblockchaininfo`, limited to health-relevant fields.
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockchainInfo {
    pub chain: String,
    pub blocks: i64,
    pub headers: i64,
    #[serde(rename = "initialblockdownload")]
    pub initial_block_download: bool,
}

/// Result of `validateaddress`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateAddress {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    #[serde(default)]
    pub address: Option<String>,
}

/// The standard cookie location for a network, mirroring the node's datadir
/// layout.
pub fn default_cookie_path(network: Network, datadir: Option<&Path>) -> PathBuf {
    let base = datadir.map(Path::to_path_buf).unwrap_or_else(|| {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join(".bitcoin")
    });
    let subdir = match network {
        Network::Bitcoin => "",
        Network::Testnet => "testnet3",
        Network::Signet => "signet",
        Network::Regtest => "regtest",
        other => {
            warn!(network = %other, "Unknown network, assuming mainnet cookie location");
            ""
        }
    };
    if subdir.is_empty() {
        base.join(".cookie")
    } else {
        base.join(subdir).join(".cookie")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_path_per_network() {
        let datadir = PathBuf::from("/var/lib/bitcoind");
        assert_eq!(
            default_cookie_path(Network::Bitcoin, Some(&datadir)),
            PathBuf::from("/var/lib/bitcoind/.cookie")
        );
        assert_eq!(
            default_cookie_path(Network::Regtest, Some(&datadir)),
            PathBuf::from("/var/lib/bitcoind/regtest/.cookie")
        );
        assert_eq!(
            default_cookie_path(Network::Testnet, Some(&datadir)),
            PathBuf::from("/var/lib/bitcoind/testnet3/.cookie")
        );
        assert_eq!(
            default_cookie_path(Network::Signet, Some(&datadir)),
            PathBuf::from("/var/lib/bitcoind/signet/.cookie")
        );
    }

    #[test]
    fn cookie_credentials_parse() {
        let dir = tempfile::tempdir().unwrap();
        let cookie = dir.path().join(".cookie");
        std::fs::write(&cookie, "__cookie__:s3cret\n").unwrap();

        let config = NodeConfig {
            cookie_path: Some(cookie),
            ..NodeConfig::default()
        };
        let client = NodeClient::new(&config, Network::Regtest).unwrap();
        let (user, pass) = client.credentials().unwrap();
        assert_eq!(user, "__cookie__");
        assert_eq!(pass, "s3cret");
    }

    #[test]
    fn missing_cookie_is_an_error_not_a_panic() {
        let config = NodeConfig {
            cookie_path: Some(PathBuf::from("/nonexistent/.cookie")),
            ..NodeConfig::default()
        };
        let client = NodeClient::new(&config, Network::Regtest).unwrap();
        assert!(client.credentials().is_err());
    }

    #[test]
    fn rpc_error_envelope_deserializes() {
        let envelope: RpcEnvelope<Option<String>> = serde_json::from_str(
            r#"{"result":null,"error":{"code":-32601,"message":"Method not found"},"id":1}"#,
        )
        .unwrap();
        let err = envelope.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
    }

    #[test]
    fn block_template_deserializes() {
        let template: GetBlockTemplate = serde_json::from_str(
            r#"{
                "version": 536870912,
                "rules": ["segwit"],
                "previousblockhash": "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
                "transactions": [{"data": "00", "txid": "aa"}],
                "coinbaseaux": {},
                "coinbasevalue": 5000000000,
                "mintime": 1700000000,
                "curtime": 1700000600,
                "bits": "207fffff",
                "height": 1,
                "default_witness_commitment": "6a24aa21a9ede2f61c3f71d1defd3fa999dfa36953755c690689799962b48bebd836974e8cf9"
            }"#,
        )
        .unwrap();
        assert_eq!(template.height, 1);
        assert_eq!(template.coinbase_value, 5_000_000_000);
        assert_eq!(template.transactions.len(), 1);
        assert!(template.default_witness_commitment.is_some());
    }
}
