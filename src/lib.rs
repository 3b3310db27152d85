//! Async RESP2/RESP3 client core: request lifecycle and cluster command
//! routing for a single standalone or clustered Valkey/Redis handle.
//!
//! This crate does not generate per-command wrapper methods (`GET`, `SET`,
//! ...); callers build a [`Command`] directly (or a small higher-level crate
//! built on top of this one does) and hand it to [`Client::execute`]. What
//! this crate owns is everything below that: connection lifecycle, slot-aware
//! routing, MOVED/ASK/TRYAGAIN/CLUSTERDOWN recovery, in-flight admission, and
//! pub/sub demultiplexing.
//!
//! # Example
//! ```no_run
//! use resp_cluster_client::{Client, ClientConfig, Command, CommandKind};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ClientConfig::default();
//! config.addresses.push("127.0.0.1:6379".parse()?);
//! let client = Client::new(config).await?;
//!
//! let set = Command::new(CommandKind::SingleKey).arg("SET").arg("k").arg("v");
//! client.execute(set, None).await?;
//!
//! let get = Command::new(CommandKind::SingleKey).arg("GET").arg("k");
//! let value = client.execute(get, None).await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod batch;
pub mod client;
pub mod cmd;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod inflight;
pub mod logging;
pub mod pool;
pub mod pubsub;
pub mod retry;
pub mod router;
pub mod slots;
pub mod stats;
pub mod value;

pub use auth::{AuthProvider, Credentials, SharedAuthProvider, StaticAuthProvider};
pub use backoff::ReconnectBackoff;
pub use batch::{Batch, BatchMode};
pub use client::Client;
pub use cmd::{Command, CommandKind, MultiKeyPattern, ResponsePolicy};
pub use config::{
    ClientConfig, ProtocolVersion, ReadFrom, SubscriptionMode, SubscriptionSpec, TlsConfig,
};
pub use error::{RedisCoreError, RedisCoreResult, RedirectTarget, ServerErrorKind};
pub use logging::{default_logger, LogLevel, Logger, NullLogger, SharedLogger, TracingLogger};
pub use pubsub::{PubSubMessage, Subscription, SubscriptionKind};
pub use retry::{HopTracker, Outcome, RedirectDecision};
pub use router::Route;
pub use slots::{key_slot, SlotMap, SlotRange, SLOT_COUNT};
pub use stats::{ClientStats, NodeCounters, SharedTelemetry, Telemetry};
pub use value::{PushKind, Value};
