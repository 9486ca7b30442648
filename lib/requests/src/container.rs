//! The container: handler registry, request coalescing, the TTL sweep and
//! the pool liveness poller, plus the `rc …` administrative surface.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use spool_core::CacheError;
use spool_core::config::RequestsConfig;
use spool_core::protocols::{FileAttributes, PoolStatusChange};
use spool_router::{PoolMonitor, SelectedPool};

use crate::handler::{HandlerEvent, HandlerInfo, PoolRequestHandler, Registry, RequestState, Waiter};
use crate::protocols::{ClientRequest, workflow_key};
use crate::transport::PoolTransport;

pub struct RequestContainer {
    monitor: Arc<PoolMonitor>,
    transport: Arc<dyn PoolTransport>,
    config: Arc<RwLock<RequestsConfig>>,
    registry: Registry,
    cancel: CancellationToken,
}

impl RequestContainer {
    /// Build the container and start its background tasks: the TTL sweep,
    /// the liveness poller and the pool-status listener. Each runs until
    /// [`RequestContainer::shutdown`].
    pub fn new(
        monitor: Arc<PoolMonitor>,
        transport: Arc<dyn PoolTransport>,
        config: RequestsConfig,
    ) -> Arc<Self> {
        let container = Arc::new(Self {
            monitor,
            transport,
            config: Arc::new(RwLock::new(config)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        });
        container.clone().spawn_sweeper();
        container.clone().spawn_liveness_poller();
        container.clone().spawn_status_listener();
        container
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn config(&self) -> Arc<RwLock<RequestsConfig>> {
        self.config.clone()
    }

    // ------------------------------------------------------------------
    // request intake
    // ------------------------------------------------------------------

    /// Submit a read-selection request and await the workflow's terminal
    /// state. Concurrent requests with the same workflow key share one
    /// handler and one routing decision.
    pub async fn select_read_pool(
        &self,
        request: ClientRequest,
    ) -> Result<SelectedPool, CacheError> {
        let rx = self.submit(request);
        rx.await.map_err(|_| {
            CacheError::Timeout("request expired before a pool was selected".into())
        })?
    }

    /// Enqueue a request, creating the handler if its key is new. The reply
    /// arrives on the returned channel when the handler terminates; an
    /// expired TTL silently drops it instead.
    pub fn submit(
        &self,
        request: ClientRequest,
    ) -> oneshot::Receiver<Result<SelectedPool, CacheError>> {
        let key = workflow_key(&request);
        let (tx, rx) = oneshot::channel();
        let deadline = request.ttl.map(|ttl| Instant::now() + ttl);
        let waiter = Waiter {
            reply: tx,
            deadline,
        };

        let mut registry = self.registry.lock();
        match registry.get_mut(&key) {
            Some(shared) => {
                tracing::debug!("request coalesced onto handler {key}");
                shared.waiters.push(waiter);
            }
            None => {
                tracing::debug!("new handler {key}");
                let mut shared = PoolRequestHandler::spawn(
                    key.clone(),
                    request,
                    self.monitor.clone(),
                    self.transport.clone(),
                    self.config.clone(),
                    self.registry.clone(),
                );
                shared.waiters.push(waiter);
                registry.insert(key, shared);
            }
        }
        rx
    }

    /// Write selection needs no workflow: one synchronous-style decision
    /// against the current cost state.
    pub fn select_write_pool(
        &self,
        attributes: FileAttributes,
        protocol: Option<String>,
        client: Option<IpAddr>,
        link_group: Option<String>,
        preallocated: u64,
    ) -> Result<SelectedPool, CacheError> {
        self.monitor
            .selector(attributes, protocol, client, link_group, HashSet::new())
            .select_write_pool(preallocated)
    }

    // ------------------------------------------------------------------
    // admin operations
    // ------------------------------------------------------------------

    pub fn list_handlers(&self) -> Vec<HandlerInfo> {
        let registry = self.registry.lock();
        let mut infos: Vec<HandlerInfo> =
            registry.values().map(|s| s.info.lock().clone()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Force a retry of one suspended handler, or of all of them.
    pub fn retry(&self, key: Option<&str>) -> Result<usize, CacheError> {
        let registry = self.registry.lock();
        match key {
            Some(key) => {
                let shared = registry.get(key).ok_or_else(|| {
                    CacheError::InvalidArgument(format!("no request '{key}'"))
                })?;
                let _ = shared.tx.send(HandlerEvent::Retry);
                Ok(1)
            }
            None => {
                let mut count = 0;
                for shared in registry.values() {
                    if shared.info.lock().state == RequestState::Suspended {
                        let _ = shared.tx.send(HandlerEvent::Retry);
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    }

    /// Force-terminate a handler with a caller-supplied error code.
    pub fn fail(&self, key: &str, code: u16, message: &str) -> Result<(), CacheError> {
        let registry = self.registry.lock();
        let shared = registry
            .get(key)
            .ok_or_else(|| CacheError::InvalidArgument(format!("no request '{key}'")))?;
        let _ = shared.tx.send(HandlerEvent::Fail {
            code,
            message: message.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // background tasks
    // ------------------------------------------------------------------

    /// Periodically drop waiters whose time-to-live elapsed. The expiry is
    /// silent; other waiters of the same handler are unaffected.
    fn spawn_sweeper(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let period = Duration::from_secs(self.config.read().sweep_interval_secs);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let now = Instant::now();
                let mut dropped = 0usize;
                {
                    let mut registry = self.registry.lock();
                    for shared in registry.values_mut() {
                        shared.waiters.retain(|w| {
                            let keep = !w.expired(now) && !w.reply.is_closed();
                            if !keep {
                                dropped += 1;
                            }
                            keep
                        });
                    }
                }
                if dropped > 0 {
                    tracing::info!("ttl sweep dropped {dropped} expired request message(s)");
                }
            }
        });
    }

    /// Periodically ask every pool with in-flight work whether it still
    /// knows the pnfs id; a negative listing synthesizes a timeout for the
    /// affected handler only.
    fn spawn_liveness_poller(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let period = Duration::from_secs(self.config.read().ping_interval_secs);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                // snapshot under the lock, probe outside it
                let probes: Vec<(String, String, tokio::sync::mpsc::UnboundedSender<HandlerEvent>)> = {
                    let registry = self.registry.lock();
                    registry
                        .values()
                        .filter_map(|shared| {
                            let info = shared.info.lock();
                            let pool = info.current_pool.clone()?;
                            info.state
                                .is_waiting()
                                .then(|| (pool, info.pnfs_id.clone(), shared.tx.clone()))
                        })
                        .collect()
                };
                for (pool, pnfs_id, tx) in probes {
                    let alive = match self.transport.list_transfers(&pool).await {
                        Ok(listing) => listing.contains(&pnfs_id),
                        Err(e) => {
                            tracing::warn!("liveness probe of {pool} failed: {e}");
                            false
                        }
                    };
                    if !alive {
                        tracing::warn!("pool {pool} lost track of {pnfs_id}");
                        let _ = tx.send(HandlerEvent::PingFailure { pool });
                    }
                }
            }
        });
    }

    /// A pool coming up (or back up) retries every suspended handler.
    fn spawn_status_listener(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let mut status_rx = self.monitor.selection_unit().subscribe();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = status_rx.recv() => change,
                };
                match change {
                    Ok(PoolStatusChange::Up { pool } | PoolStatusChange::Restart { pool }) => {
                        let retried = self.retry(None).unwrap_or(0);
                        if retried > 0 {
                            tracing::info!(
                                "pool {pool} available again, retried {retried} suspended request(s)"
                            );
                        }
                    }
                    Ok(PoolStatusChange::Down { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("status listener lagged by {n} notifications");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// The `rc …` administrative commands.
pub struct RequestCommandProcessor {
    container: Arc<RequestContainer>,
}

impl RequestCommandProcessor {
    pub fn new(container: Arc<RequestContainer>) -> Self {
        Self { container }
    }

    pub fn execute(&self, line: &str) -> Result<String, CacheError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["rc", "ls"] => {
                let mut out = String::new();
                for info in self.container.list_handlers() {
                    writeln!(
                        out,
                        "{} state={} pool={} retries={}",
                        info.key,
                        info.state,
                        info.current_pool.as_deref().unwrap_or("-"),
                        info.retries
                    )
                    .ok();
                }
                Ok(out)
            }
            ["rc", "retry", "*"] => {
                let count = self.container.retry(None)?;
                Ok(format!("retried {count} suspended request(s)"))
            }
            ["rc", "retry", key] => {
                self.container.retry(Some(key))?;
                Ok(format!("request '{key}' retried"))
            }
            ["rc", "failed", key, code, message @ ..] => {
                let code: u16 = code.parse().map_err(|_| {
                    CacheError::InvalidArgument(format!("bad error code '{code}'"))
                })?;
                self.container.fail(key, code, &message.join(" "))?;
                Ok(format!("request '{key}' failed with rc={code}"))
            }
            ["rc", "set", "max", "retries", n] => {
                let n: u32 = n.parse().map_err(|_| {
                    CacheError::InvalidArgument(format!("bad retry count '{n}'"))
                })?;
                self.container.config.write().max_retries = n;
                Ok(format!("max retries set to {n}"))
            }
            ["rc", "set", "retry", secs] => {
                let secs: u64 = secs.parse().map_err(|_| {
                    CacheError::InvalidArgument(format!("bad interval '{secs}'"))
                })?;
                self.container.config.write().retry_interval_secs = secs;
                Ok(format!("retry interval set to {secs}s"))
            }
            ["rc", "onerror", word @ ("suspend" | "fail")] => {
                self.container.config.write().suspend_on_error = *word == "suspend";
                Ok(format!("onerror {word}"))
            }
            ["rc", "set", "p2p", "on", "cost", word @ ("on" | "off")] => {
                self.container.config.write().p2p_on_cost = *word == "on";
                Ok(format!("p2p on cost {word}"))
            }
            ["rc", "set", "stage", "on", "cost", word @ ("on" | "off")] => {
                self.container.config.write().stage_on_cost = *word == "on";
                Ok(format!("stage on cost {word}"))
            }
            ["rc", "set", "stage", word @ ("on" | "off")] => {
                self.container.config.write().stage_allowed = *word == "on";
                Ok(format!("stage allowed {word}"))
            }
            ["rc", "set", "p2p", word @ ("on" | "off")] => {
                self.container.config.write().p2p_allowed = *word == "on";
                Ok(format!("p2p allowed {word}"))
            }
            _ => Err(CacheError::InvalidArgument(format!(
                "unknown command '{line}'"
            ))),
        }
    }
}
