//! Stratum v1 server.
//!
//! Line-delimited JSON-RPC over TCP. `messages` defines the typed request
//! variants and response builders, `connection` runs the per-socket state
//! machine, `vardiff` is the per-connection difficulty controller, and
//! `server` owns the accept loop, the connection registry and the job
//! broadcaster.

pub mod connection;
pub mod messages;
pub mod server;
pub mod vardiff;
