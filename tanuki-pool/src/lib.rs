//! Solo Bitcoin mining pool core.
//!
//! A Stratum V1 server that assembles block candidates from a Bitcoin full
//! node, dispatches work to miners, validates returned shares against
//! per-connection difficulty targets and submits winning blocks.
//!
//! The pipeline: [`template::TemplateFeed`] polls the node and publishes
//! block templates; [`job::JobManager`] turns templates into broadcastable
//! jobs; [`stratum::server::StratumServer`] accepts miners and fans jobs
//! out; [`stratum::connection::MinerConn`] runs the per-socket protocol;
//! [`validate`] checks returned shares; [`submit::Submitter`] pushes
//! winning blocks back to the node with durable retry.

pub mod banlist;
pub mod codec;
pub mod coinbase;
pub mod config;
pub mod error;
pub mod job;
pub mod limiter;
pub mod rpc;
pub mod store;
pub mod stratum;
pub mod submit;
pub mod template;
pub mod tracing;
pub mod types;
pub mod validate;

pub use config::Config;
pub use error::{Error, Result};
