//! Common error types for tanuki-pool.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the underlying error types used throughout the crate.
//! Stratum-level share rejections are not represented here; they carry
//! protocol error codes and live in `stratum::messages`.

use thiserror::Error;

/// Main error type for tanuki-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level RPC failures (connection refused, timeout, TLS)
    #[error("RPC transport error: {0}")]
    RpcTransport(#[from] reqwest::Error),

    /// Errors returned by the node inside a JSON-RPC response envelope
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    /// Configuration errors (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Stratum or JSON-RPC protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Address parsing or network mismatch
    #[error("invalid address: {0}")]
    Address(String),

    /// Coinbase or block construction failures
    #[error("coinbase error: {0}")]
    Coinbase(String),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
