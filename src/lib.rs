//! # Caravel
//!
//! A vbucket-aware client for memcached-binary-protocol clusters.
//!
//! Caravel shards a key-value workload across a dynamic pool of backend
//! nodes: every key hashes to a vbucket, every vbucket is owned by one
//! node, and the client multiplexes many in-flight operations over one
//! persistent connection per node. Results come back through a callback
//! table, in per-node issue order, with exactly one callback per
//! request — including the synthetic misses manufactured for quiet
//! batch commands the server answered by staying silent.
//!
//! ## Example
//!
//! ```no_run
//! use caravel::{Callbacks, Client, Result};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let mut client = Client::new("localhost:8091", None, None, "default");
//!     client.connect().await?;
//!     client.set_callbacks(Callbacks {
//!         get: Box::new(|_, error, key, value, _, cas| {
//!             if error.is_success() {
//!                 println!(
//!                     "found {}: {} bytes, cas {cas}",
//!                     String::from_utf8_lossy(key),
//!                     value.len()
//!                 );
//!             } else {
//!                 println!("missing {}", String::from_utf8_lossy(key));
//!             }
//!         }),
//!         ..Default::default()
//!     });
//!     client.mget(&[b"one", b"two", b"three"])?;
//!     client.execute().await
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/caravel/0.1.0")]
#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_lifetimes,
    unused_qualifications
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::too_many_arguments // encoders mirror the wire fields one-to-one
)]

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

mod bootstrap;
/// The client instance and its callback surface.
pub mod client;
/// Error types and result aliases.
pub mod error;
mod event;
/// Binary protocol framing: headers, encoders, streaming parser.
pub mod protocol;
mod sasl;
mod server;
/// Key-to-node resolution over the vbucket map.
pub mod vbucket;

// ─────────────────────────────────────────────────────────────────────────────
// Common Re-exports
// ─────────────────────────────────────────────────────────────────────────────

pub use client::{Callbacks, Client, TapFilter};
pub use error::{AuthError, ConfigError, Error, ErrorCode, ProtocolError, Result};
pub use protocol::StoreOperation;
pub use vbucket::VbucketConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Crate version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default REST port for configuration bootstrap.
pub const DEFAULT_CONFIG_PORT: u16 = 8091;

/// Default data port for node connections.
pub const DEFAULT_DATA_PORT: u16 = 11210;

/// Upper bound on a single packet body (20 MiB, the server-side value
/// limit plus framing headroom).
pub const MAX_BODY_SIZE: usize = 20 * 1024 * 1024 + 4096;
