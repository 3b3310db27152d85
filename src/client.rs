//! Public handle (C9): the façade callers actually hold — `execute`,
//! `execute_batch`, `subscribe`, `publish`, `close`, plus the two exposed
//! interfaces the distilled spec lists only in §6's table, `update_password`
//! and `get_stats` (spec §4.9/§6).
//!
//! `Client` is the one place every other component is wired together: C6
//! (router) resolves a route against C4 (slot map), C5 (pool) hands back a
//! connection, C7 (retry) decides what to do with a failed attempt, and C3
//! (inflight registry) bounds how many requests this client may have
//! outstanding at once. Background topology refresh (spec §9 "single-
//! flight") and the pub/sub dispatch task (C10) are spawned once at
//! construction and run for the client's lifetime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};

use crate::auth::{AuthProvider, Credentials, SharedAuthProvider, StaticAuthProvider};
use crate::batch::{execute_batch as run_batch, Batch};
use crate::cmd::{Command, CommandKind};
use crate::config::ClientConfig;
use crate::error::{RedisCoreError, RedisCoreResult};
use crate::inflight::InflightRegistry;
use crate::logging::{default_logger, LogLevel, Logger, SharedLogger};
use crate::pool::ConnectionPool;
use crate::pubsub::{PubSubTap, SubscriptionKind, Subscription};
use crate::retry::{self, HopTracker, Outcome};
use crate::router::{Route, Router};
use crate::slots::{parse_cluster_shards, parse_cluster_slots, SlotMap};
use crate::stats::{ClientStats, NodeCounters, StatsCounters};
use crate::value::Value;

/// Bound on consecutive transport-error retries for a single logical request
/// (spec §4.7's "retries on a fresh connection" path), kept separate from
/// [`HopTracker`]'s MOVED/ASK hop budget since a disconnect is not a
/// redirect.
const MAX_DISCONNECT_RETRIES: u32 = 3;

struct TopologyRefresher {
    min_interval: Duration,
    last_refresh: AsyncMutex<Instant>,
    single_flight: Semaphore,
}

impl TopologyRefresher {
    fn new(min_interval: Duration) -> Self {
        TopologyRefresher {
            min_interval,
            last_refresh: AsyncMutex::new(Instant::now() - min_interval - Duration::from_secs(1)),
            single_flight: Semaphore::new(1),
        }
    }
}

/// A single asynchronous handle usable against both a standalone server and
/// a sharded cluster (spec §1). Cheap to clone: every field is an `Arc` or a
/// small `Copy` handle, so cloning a `Client` shares the same pool, slot map,
/// and in-flight accounting rather than duplicating connections.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    pool: Arc<ConnectionPool>,
    slot_map: SlotMap,
    router: Arc<Router>,
    auth: Arc<StaticAuthProvider>,
    logger: SharedLogger,
    inflight: InflightRegistry,
    stats: Arc<StatsCounters>,
    pubsub: Arc<PubSubTap>,
    refresher: Arc<TopologyRefresher>,
    closed: Arc<AtomicBool>,
}

impl Client {
    /// Construct a client from an already-validated [`ClientConfig`] (spec
    /// §3 lifecycle: "`Client` created → lazy or eager connect →
    /// operational"). Eager mode performs the initial topology refresh (for
    /// cluster mode) or a single handshake connect (standalone) before
    /// returning; lazy mode defers both to the first call.
    pub async fn new(config: ClientConfig) -> RedisCoreResult<Self> {
        config.validate()?;
        Self::with_logger(config, default_logger()).await
    }

    pub async fn with_logger(config: ClientConfig, logger: SharedLogger) -> RedisCoreResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let auth = Arc::new(StaticAuthProvider::new(config.auth.clone()));
        let stats = Arc::new(StatsCounters::default());
        let (pubsub, push_tx, push_rx) = PubSubTap::new();
        let pubsub = Arc::new(pubsub);
        pubsub.clone().spawn(push_rx);

        let pool = Arc::new(ConnectionPool::new(
            config.clone(),
            auth.clone() as SharedAuthProvider,
            logger.clone(),
            push_tx,
            stats.clone(),
        ));

        let slot_map = SlotMap::empty();
        let router = Arc::new(Router::new(slot_map.clone(), &config, logger.clone()));

        let client = Client {
            config: config.clone(),
            pool,
            slot_map,
            router,
            auth,
            logger,
            inflight: InflightRegistry::new(
                config.effective_max_pending_operations(),
                config.max_inflight_per_client,
            ),
            stats,
            pubsub,
            refresher: Arc::new(TopologyRefresher::new(config.min_refresh_interval)),
            closed: Arc::new(AtomicBool::new(false)),
        };

        if !config.lazy_connect {
            if config.cluster_mode {
                client.refresh_topology(true).await?;
            } else if let Some(&addr) = config.addresses.first() {
                client.pool.connection_for(addr, false).await?;
            }
        }

        Ok(client)
    }

    /// `execute(command, route?) → future<value | error>` (spec §4.9).
    pub async fn execute(&self, command: Command, route_override: Option<Route>) -> RedisCoreResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RedisCoreError::Closing);
        }

        let guard = self.inflight.register()?;
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let inner = self.execute_inner(command.clone(), route_override);

        let result = if command.blocking {
            inner.await
        } else {
            match tokio::time::timeout(self.config.request_timeout, inner).await {
                Ok(result) => result,
                Err(_) => Err(RedisCoreError::Timeout),
            }
        };

        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        drop(guard);
        result
    }

    async fn execute_inner(&self, command: Command, route_override: Option<Route>) -> RedisCoreResult<Value> {
        let router = &self.router;

        if matches!(command.kind, CommandKind::MultiSlotPattern(_)) {
            let parts = router.split(&command)?;
            if parts.len() > 1 {
                let mut results = Vec::with_capacity(parts.len());
                let mut key_orders = Vec::with_capacity(parts.len());
                for part in parts {
                    let key_order = part.key_order;
                    let route = Route::Slot { slot: part.slot, prefer_replica: false };
                    key_orders.push(key_order);
                    results.push(self.execute_with_redirects(part.command, route).await);
                }
                return crate::router::reassemble_multi_slot(
                    command.effective_response_policy(),
                    &key_orders,
                    results,
                );
            }
        }

        let route = match route_override {
            Some(r) => r,
            None => router.classify(&command)?,
        };

        match route {
            Route::AllPrimaries | Route::AllNodes => {
                let targets = router.fan_out_targets(&route);
                if targets.is_empty() {
                    return Err(RedisCoreError::disconnect("no nodes known for fan-out route"));
                }
                let mut results = Vec::with_capacity(targets.len());
                for addr in targets {
                    results.push(
                        self.execute_with_redirects(command.clone(), Route::Address(addr))
                            .await,
                    );
                }
                crate::router::aggregate(command.effective_response_policy(), results)
            }
            other => self.execute_with_redirects(command, other).await,
        }
    }

    /// Bounded MOVED/ASK redirect loop plus a small disconnect-retry budget
    /// for retry-safe commands (spec §4.7, §9 "Retry loops" — "a small state
    /// machine with an explicit hop counter").
    async fn execute_with_redirects(&self, command: Command, mut route: Route) -> RedisCoreResult<Value> {
        let mut hops = HopTracker::new(self.config.max_redirect_hops, self.config.reconnect_backoff);
        let mut asking = false;
        let mut disconnect_retries = 0u32;

        loop {
            let prefer_replica = matches!(route, Route::Slot { prefer_replica: true, .. });
            let addr = match self.router.resolve(&route, &self.pool.known_addrs()) {
                Ok(addr) => addr,
                Err(err) => return Err(err),
            };

            let conn = match self.pool.connection_for(addr, prefer_replica).await {
                Ok(conn) => conn,
                Err(err) => {
                    if command.retry_safe && disconnect_retries < MAX_DISCONNECT_RETRIES {
                        disconnect_retries += 1;
                        continue;
                    }
                    return Err(err);
                }
            };

            let attempt = if asking {
                match conn.send(retry::asking_command()).await {
                    Ok(_) => conn.send(command.clone()).await,
                    Err(err) => Err(err),
                }
            } else {
                conn.send(command.clone()).await
            };
            asking = false;

            match attempt {
                Ok(value) => return Ok(value),
                Err(RedisCoreError::Disconnect { .. }) if command.retry_safe && disconnect_retries < MAX_DISCONNECT_RETRIES => {
                    disconnect_retries += 1;
                    continue;
                }
                Err(err) => match hops.decide(&err) {
                    Outcome::Redirect(decision) => {
                        self.stats.redirects.fetch_add(1, Ordering::Relaxed);
                        // MOVED is a permanent reassignment: refresh the
                        // topology fire-and-forget rather than awaiting it
                        // (spec §4.7), so this retry proceeds immediately
                        // against the redirected address while the
                        // background refresh catches the slot map up.
                        if matches!(err, RedisCoreError::Request { ref kind, .. } if kind == "MOVED") {
                            self.spawn_background_refresh();
                        }
                        route = decision.route;
                        asking = decision.asking;
                        continue;
                    }
                    Outcome::RetryAfter(delay) => {
                        if matches!(err, RedisCoreError::Request { ref kind, .. } if kind == "CLUSTERDOWN") {
                            self.spawn_background_refresh();
                        }
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    Outcome::Fail(err) => return Err(err),
                },
            }
        }
    }

    fn spawn_background_refresh(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            let _ = client.refresh_topology(false).await;
        });
    }

    /// `execute_batch(batch, raise_on_error, options?) → future<array<value|error> | error>`
    /// (spec §4.9). `raise_on_error = true` collapses the first error in the
    /// result vector into the outer `Err`; `false` returns every per-command
    /// outcome.
    pub async fn execute_batch(
        &self,
        batch: &Batch,
        raise_on_error: bool,
    ) -> RedisCoreResult<Vec<RedisCoreResult<Value>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RedisCoreError::Closing);
        }
        let results = tokio::time::timeout(
            self.config.request_timeout,
            run_batch(batch, &self.router, &self.pool, self.config.cluster_mode),
        )
        .await
        .map_err(|_| RedisCoreError::Timeout)??;

        if raise_on_error {
            if let Some(Err(err)) = results.iter().find(|r| r.is_err()) {
                return Err(err.clone());
            }
        }
        Ok(results)
    }

    /// `subscribe(channels)` (spec §4.9/§4.10): issues the subscribe command
    /// on a pooled connection and returns a local [`Subscription`] handle
    /// that receives every matching push delivery.
    pub async fn subscribe(&self, kind: SubscriptionKind, channel: Vec<u8>) -> RedisCoreResult<Subscription> {
        let verb = match kind {
            SubscriptionKind::Exact => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
            SubscriptionKind::Sharded => "SSUBSCRIBE",
        };
        let addr = self.router.resolve(&Route::Random, &self.pool.known_addrs())?;
        let conn = self.pool.connection_for(addr, false).await?;
        conn.send(Command::new(CommandKind::Admin).arg(verb).arg(channel.clone()))
            .await?;
        Ok(self.pubsub.subscribe(kind, channel))
    }

    /// `publish(...)` (spec §4.9), routed like any other command.
    pub async fn publish(&self, channel: Vec<u8>, payload: Vec<u8>, sharded: bool) -> RedisCoreResult<Value> {
        let verb = if sharded { "SPUBLISH" } else { "PUBLISH" };
        let command = Command::new(CommandKind::Random).arg(verb).arg(channel).arg(payload);
        self.execute(command, None).await
    }

    /// `update_password(new, immediate_auth)` (spec §6). Always updates the
    /// credentials used by future (re)connects; `immediate_auth` additionally
    /// re-authenticates every currently pooled connection with a fresh
    /// `AUTH` so already-established sockets do not wait for a disconnect
    /// before picking up the new password.
    pub async fn update_password(&self, new_password: String, immediate_auth: bool) -> RedisCoreResult<()> {
        self.auth.set_password(new_password.clone());
        if immediate_auth {
            let creds = self.auth.credentials().await?;
            if let Some(creds) = creds {
                for addr in self.pool.known_addrs() {
                    if let Ok(conn) = self.pool.connection_for(addr, false).await {
                        let mut auth_cmd = Command::new(CommandKind::Admin).arg("AUTH");
                        if let Some(username) = creds.username.clone() {
                            auth_cmd = auth_cmd.arg(username);
                        }
                        auth_cmd = auth_cmd.arg(creds.password.clone());
                        if let Err(err) = conn.send(auth_cmd).await {
                            self.logger.log(
                                LogLevel::Warn,
                                "client.update_password",
                                &format!("re-auth of {addr} failed: {err}"),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// `get_stats() → { pending, reconnects, slot_map_version, per_node_counters, ... }`
    /// (spec §6), always populated (SPEC_FULL.md §6).
    pub fn get_stats(&self) -> ClientStats {
        self.stats.slot_map_version.store(self.slot_map.version(), Ordering::Relaxed);
        let per_node: HashMap<String, NodeCounters> = self
            .pool
            .known_addrs()
            .into_iter()
            .map(|addr| (addr.to_string(), NodeCounters::default()))
            .collect();
        self.stats.snapshot(per_node)
    }

    /// `close()` (spec §4.9): transitions to `Draining`, cancels non-blocking
    /// pending completions, tears down the pool, and releases this client's
    /// counters. Subsequent calls to `execute`/`execute_batch` immediately
    /// surface [`RedisCoreError::Closing`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inflight.close();
        self.pool.close_all().await;
    }

    /// Build from `CLUSTER SHARDS` (preferred) or `CLUSTER SLOTS` (fallback)
    /// against the first reachable configured/known address, then publish
    /// atomically (spec §4.4). Single-flight and rate-limited by
    /// `min_refresh_interval` unless `force` (spec §9).
    pub async fn refresh_topology(&self, force: bool) -> RedisCoreResult<()> {
        if !self.config.cluster_mode {
            return Ok(());
        }

        let permit = match self.refresher.single_flight.try_acquire() {
            Ok(permit) => permit,
            Err(_) => return Ok(()), // a refresh is already running; coalesce.
        };

        {
            let mut last = self.refresher.last_refresh.lock().await;
            if !force && last.elapsed() < self.refresher.min_interval {
                return Ok(());
            }
            *last = Instant::now();
        }

        let mut candidates = self.pool.known_addrs();
        candidates.extend(self.config.addresses.iter().copied());
        candidates.dedup();

        let mut last_err = RedisCoreError::disconnect("no address available for topology refresh");
        for addr in candidates {
            let conn = match self.pool.dial_management(addr).await {
                Ok(conn) => conn,
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };

            let shards_reply = conn.send(Command::new(CommandKind::Admin).arg("CLUSTER").arg("SHARDS")).await;
            let ranges = match shards_reply {
                Ok(value) => match parse_cluster_shards(&value) {
                    Ok(ranges) if !ranges.is_empty() => ranges,
                    _ => match conn.send(Command::new(CommandKind::Admin).arg("CLUSTER").arg("SLOTS")).await {
                        Ok(value) => match parse_cluster_slots(&value) {
                            Ok(ranges) => ranges,
                            Err(err) => {
                                last_err = err;
                                continue;
                            }
                        },
                        Err(err) => {
                            last_err = err;
                            continue;
                        }
                    },
                },
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };

            match self.slot_map.publish(ranges) {
                Ok(()) => {
                    self.stats.slot_map_version.store(self.slot_map.version(), Ordering::Relaxed);
                    drop(permit);
                    return Ok(());
                }
                Err(err) => {
                    last_err = err;
                    continue;
                }
            }
        }

        drop(permit);
        Err(last_err)
    }

    pub fn slot_map(&self) -> &SlotMap {
        &self.slot_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standalone_config_rejects_without_addresses() {
        let config = ClientConfig::default();
        assert!(Client::new(config).await.is_err());
    }
}
