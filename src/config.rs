//! `ClientConfig` and the small enumerations it is built from (spec §3).

use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::Credentials;
use crate::backoff::ReconnectBackoff;
use crate::error::{RedisCoreError, RedisCoreResult};

/// RESP protocol version negotiated via `HELLO` on handshake (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    Resp2,
    #[default]
    Resp3,
}

/// Replica-read preference (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFrom {
    #[default]
    Primary,
    PreferReplica,
    AzAffinity,
    AzAffinityAndPrimary,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub insecure: bool,
}

/// Recognized client construction options (spec §3).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addresses: Vec<SocketAddr>,
    pub cluster_mode: bool,
    pub tls: TlsConfig,
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub max_inflight_per_client: usize,
    pub read_from: ReadFrom,
    pub client_az: Option<String>,
    pub database_id: i64,
    pub protocol: ProtocolVersion,
    pub auth: Option<Credentials>,
    pub client_name: Option<String>,
    /// Backoff applied by the connection pool (C5) when (re)dialing a node
    /// after it is observed `Broken`. Kept as a single public field per the
    /// distilled spec's naming, even though internally the retry engine (C7)
    /// derives its own `TRYAGAIN`/`CLUSTERDOWN` backoff from the same shape
    /// rather than sharing mutable state with the pool's instance (see
    /// SPEC_FULL.md §3 and DESIGN.md).
    pub reconnect_backoff: ReconnectBackoff,
    pub lazy_connect: bool,
    pub subscriptions: Vec<SubscriptionSpec>,
    /// Max entries in the process-wide in-flight registry (C3); 0 means use
    /// the crate default.
    pub max_pending_operations: usize,
    /// Cap on MOVED/ASK redirect hops per logical request (spec §4.7).
    pub max_redirect_hops: u32,
    /// Minimum spacing between unforced background topology refreshes
    /// (spec §9 "Background topology refresh").
    pub min_refresh_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMode {
    Exact,
    Pattern,
    Sharded,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub mode: SubscriptionMode,
    pub channel: Vec<u8>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addresses: Vec::new(),
            cluster_mode: false,
            tls: TlsConfig::default(),
            request_timeout: Duration::from_millis(250),
            connection_timeout: Duration::from_millis(2_000),
            max_inflight_per_client: 0,
            read_from: ReadFrom::default(),
            client_az: None,
            database_id: 0,
            protocol: ProtocolVersion::default(),
            auth: None,
            client_name: None,
            reconnect_backoff: ReconnectBackoff::default(),
            lazy_connect: true,
            subscriptions: Vec::new(),
            max_pending_operations: 0,
            max_redirect_hops: 5,
            min_refresh_interval: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> RedisCoreResult<()> {
        if self.addresses.is_empty() {
            return Err(RedisCoreError::config("at least one address is required"));
        }
        if matches!(self.read_from, ReadFrom::AzAffinity | ReadFrom::AzAffinityAndPrimary)
            && self.client_az.is_none()
        {
            // Not fatal (spec §4.6: degrade to PreferReplica and warn), but
            // the router needs to know this decision was made intentionally
            // rather than silently reinterpreting the enum, so validation
            // succeeds and the router logs the degradation at construction
            // time instead.
        }
        if self.database_id < 0 {
            return Err(RedisCoreError::config("database_id must be non-negative"));
        }
        Ok(())
    }

    pub fn effective_max_pending_operations(&self) -> usize {
        if self.max_pending_operations == 0 {
            1 << 20
        } else {
            self.max_pending_operations
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_addresses() {
        let cfg = ClientConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let mut cfg = ClientConfig::default();
        cfg.addresses.push("127.0.0.1:6379".parse().unwrap());
        assert!(cfg.validate().is_ok());
    }
}
