//! The per-request workflow state machine.
//!
//! Each distinct workflow key owns one handler task fed by an unbounded
//! mailbox: producers (requesters, pool replies, the liveness poller, admin
//! commands) enqueue events concurrently, exactly one task drains them, so
//! transitions never need locking. Waiting states hold no thread; the
//! outbound request is spawned and its reply re-enters through the mailbox.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use spool_core::config::RequestsConfig;
use spool_core::error::codes;
use spool_core::CacheError;
use spool_router::{PoolMonitor, PoolSelector, SelectedPool};

use crate::protocols::{BillingEvent, ClientRequest, PoolReply};
use crate::transport::PoolTransport;

/// Workflow states. `Out` is terminal; `Suspended` and the two waiting
/// states advance only on external input, everything else advances on its
/// own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Init,
    Pool2Pool,
    Stage,
    WaitingForPool2Pool,
    WaitingForStaging,
    Suspended,
    Out,
}

impl RequestState {
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            RequestState::WaitingForPool2Pool | RequestState::WaitingForStaging
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Init => "init",
            RequestState::Pool2Pool => "pool2pool",
            RequestState::Stage => "stage",
            RequestState::WaitingForPool2Pool => "waiting-for-pool2pool",
            RequestState::WaitingForStaging => "waiting-for-staging",
            RequestState::Suspended => "suspended",
            RequestState::Out => "out",
        };
        f.write_str(s)
    }
}

/// Which outbound operation a pool reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Pool2Pool,
    Stage,
}

/// Mailbox inputs of a handler.
#[derive(Debug)]
pub(crate) enum HandlerEvent {
    Start,
    Retry,
    Fail { code: u16, message: String },
    PoolReply { op: PendingOp, reply: PoolReply },
    PingFailure { pool: String },
}

/// One coalesced requester awaiting the handler's terminal state.
pub(crate) struct Waiter {
    pub reply: oneshot::Sender<Result<SelectedPool, CacheError>>,
    pub deadline: Option<Instant>,
}

impl Waiter {
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Snapshot of a handler for the admin surface and the liveness poller.
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub key: String,
    pub pnfs_id: String,
    pub state: RequestState,
    pub current_pool: Option<String>,
    pub retries: u32,
}

/// The container-side handle of a live handler. Stored in the registry,
/// mutated only under the registry lock.
pub(crate) struct SharedHandler {
    pub tx: mpsc::UnboundedSender<HandlerEvent>,
    pub waiters: Vec<Waiter>,
    pub info: Arc<Mutex<HandlerInfo>>,
}

/// The handler registry, guarded by one container-wide lock distinct from
/// any handler's own execution.
pub(crate) type Registry = Arc<Mutex<HashMap<String, SharedHandler>>>;

pub(crate) struct PoolRequestHandler {
    key: String,
    request: ClientRequest,
    monitor: Arc<PoolMonitor>,
    transport: Arc<dyn PoolTransport>,
    config: Arc<RwLock<RequestsConfig>>,
    registry: Registry,
    info: Arc<Mutex<HandlerInfo>>,
    self_tx: mpsc::UnboundedSender<HandlerEvent>,
    state: RequestState,
    retries: u32,
    /// Overloaded pool that holds the file, remembered across the cost
    /// branches.
    hot_pool: Option<SelectedPool>,
    /// Target of the in-flight outbound operation.
    current_pool: Option<SelectedPool>,
    previous_stage_pool: Option<String>,
}

impl PoolRequestHandler {
    /// Spawn the handler task and hand its container-side handle back. The
    /// caller inserts the handle into the registry under the registry lock.
    pub(crate) fn spawn(
        key: String,
        request: ClientRequest,
        monitor: Arc<PoolMonitor>,
        transport: Arc<dyn PoolTransport>,
        config: Arc<RwLock<RequestsConfig>>,
        registry: Registry,
    ) -> SharedHandler {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = Arc::new(Mutex::new(HandlerInfo {
            key: key.clone(),
            pnfs_id: request.attributes.pnfs_id.to_string(),
            state: RequestState::Init,
            current_pool: None,
            retries: 0,
        }));

        let handler = PoolRequestHandler {
            key,
            request,
            monitor,
            transport,
            config,
            registry,
            info: info.clone(),
            self_tx: tx.clone(),
            state: RequestState::Init,
            retries: 0,
            hot_pool: None,
            current_pool: None,
            previous_stage_pool: None,
        };
        tokio::spawn(handler.run(rx));
        let _ = tx.send(HandlerEvent::Start);

        SharedHandler {
            tx,
            waiters: Vec::new(),
            info,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HandlerEvent>) {
        while let Some(event) = rx.recv().await {
            self.process(event);
            if self.state == RequestState::Out {
                break;
            }
        }
        tracing::debug!("handler {} finished", self.key);
    }

    fn process(&mut self, event: HandlerEvent) {
        tracing::trace!("handler {} in {}: {event:?}", self.key, self.state);
        match event {
            HandlerEvent::Start => self.run_init(),
            HandlerEvent::Retry => match self.state {
                RequestState::Suspended => {
                    tracing::info!("handler {} retried", self.key);
                    self.run_init();
                }
                state => tracing::debug!("retry ignored in state {state}"),
            },
            HandlerEvent::Fail { code, message } => {
                tracing::warn!("handler {} force-failed rc={code}: {message}", self.key);
                self.fail_with(CacheError::from_reply(code, message));
            }
            HandlerEvent::PoolReply { op, reply } => self.on_pool_reply(op, reply),
            HandlerEvent::PingFailure { pool } => self.on_ping_failure(&pool),
        }
    }

    fn set_state(&mut self, state: RequestState) {
        self.state = state;
        let mut info = self.info.lock();
        info.state = state;
        info.current_pool = self.current_pool.as_ref().map(|p| p.name.clone());
        info.retries = self.retries;
    }

    fn selector(&self) -> PoolSelector {
        self.monitor.selector(
            self.request.attributes.clone(),
            self.request.protocol.clone(),
            self.request.client,
            self.request.link_group.clone(),
            self.request.excluded_hosts.clone(),
        )
    }

    fn config(&self) -> RequestsConfig {
        self.config.read().clone()
    }

    /// Whether the stage branch is open for this request.
    fn stageable(&self, config: &RequestsConfig) -> bool {
        config.stage_allowed && self.request.allowed.stage && self.request.attributes.stored
    }

    fn p2p_permitted(&self, config: &RequestsConfig) -> bool {
        config.p2p_allowed && self.request.allowed.p2p
    }

    // ------------------------------------------------------------------
    // transitions
    // ------------------------------------------------------------------

    fn run_init(&mut self) {
        self.set_state(RequestState::Init);
        let selector = self.selector();
        let config = self.config();

        if self.request.force_p2p {
            // replicate specialization: skip the read attempt entirely
            self.try_pool2pool(&selector, true);
            return;
        }

        match selector.select_read_pool() {
            Ok(pool) => self.succeed(pool),
            Err(e @ CacheError::CostExceeded { .. }) => {
                self.hot_pool = selector.online_file_locations().into_iter().next();
                if config.p2p_on_cost && self.p2p_permitted(&config) {
                    self.try_pool2pool(&selector, false);
                } else if config.stage_on_cost && self.stageable(&config) {
                    self.try_stage(&selector);
                } else {
                    self.fail_with(CacheError::CostExceeded {
                        message: format!("cost exceeded, no fallback: {e}"),
                        fallback: false,
                    });
                }
            }
            Err(CacheError::FileNotInCache(id)) => {
                if self.stageable(&config) {
                    self.try_stage(&selector);
                } else {
                    self.error_handler(CacheError::NoPoolOnline(format!(
                        "pool unavailable for {id}"
                    )));
                }
            }
            Err(e @ CacheError::PermissionDenied(_)) => {
                // file online but not read-allowed: a copy elsewhere is
                // preferred over staging another one
                if self.p2p_permitted(&config) {
                    self.try_pool2pool(&selector, false);
                } else if self.stageable(&config) {
                    self.try_stage(&selector);
                } else {
                    self.error_handler(e);
                }
            }
            Err(e) => {
                if self.stageable(&config) {
                    self.try_stage(&selector);
                } else {
                    self.error_handler(e);
                }
            }
        }
    }

    fn try_pool2pool(&mut self, selector: &PoolSelector, force: bool) {
        self.set_state(RequestState::Pool2Pool);
        let config = self.config();
        match selector.select_pool2pool(self.request.pool_group.as_deref(), force) {
            Ok((source, destination)) => self.dispatch_pool2pool(source, destination),
            Err(e @ (CacheError::PermissionDenied(_) | CacheError::FileNotInCache(_))) => {
                if let Some(hot) = self.hot_pool.clone() {
                    // the overloaded pool still beats no pool at all
                    self.succeed(hot);
                } else if self.stageable(&config) {
                    self.try_stage(selector);
                } else {
                    self.error_handler(e);
                }
            }
            Err(
                e @ (CacheError::SourceCostExceeded { .. }
                | CacheError::DestinationCostExceeded { .. }
                | CacheError::CostExceeded { .. }),
            ) => {
                if config.stage_on_cost && self.stageable(&config) {
                    self.try_stage(selector);
                } else if let Some(hot) = self.hot_pool.clone() {
                    self.succeed(hot);
                } else {
                    // must not happen while hot-pool bookkeeping is
                    // consistent
                    self.fail_with(CacheError::Unexpected(format!(
                        "p2p cost exceeded with no hot pool remembered: {e}"
                    )));
                }
            }
            Err(e) => {
                if self.stageable(&config) {
                    self.try_stage(selector);
                } else {
                    self.error_handler(e);
                }
            }
        }
    }

    fn try_stage(&mut self, selector: &PoolSelector) {
        self.set_state(RequestState::Stage);
        match selector.select_stage_pool(self.previous_stage_pool.as_deref()) {
            Ok(pool) => {
                self.previous_stage_pool = Some(pool.name.clone());
                self.dispatch_stage(pool);
            }
            Err(e) => self.error_handler(e),
        }
    }

    fn dispatch_pool2pool(&mut self, source: SelectedPool, destination: SelectedPool) {
        tracing::info!(
            "handler {}: pool-to-pool {} -> {}",
            self.key,
            source.name,
            destination.name
        );
        self.current_pool = Some(destination.clone());
        self.set_state(RequestState::WaitingForPool2Pool);

        let transport = self.transport.clone();
        let attributes = self.request.attributes.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let reply = transport
                .send_pool2pool_request(&source, &destination, &attributes)
                .await
                .unwrap_or_else(|e| PoolReply::failed(codes::TIMEOUT, e.to_string()));
            let _ = tx.send(HandlerEvent::PoolReply {
                op: PendingOp::Pool2Pool,
                reply,
            });
        });
    }

    fn dispatch_stage(&mut self, pool: SelectedPool) {
        tracing::info!("handler {}: staging on {}", self.key, pool.name);
        self.current_pool = Some(pool.clone());
        self.set_state(RequestState::WaitingForStaging);

        let transport = self.transport.clone();
        let attributes = self.request.attributes.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let reply = transport
                .send_stage_request(&pool, &attributes)
                .await
                .unwrap_or_else(|e| PoolReply::failed(codes::TIMEOUT, e.to_string()));
            let _ = tx.send(HandlerEvent::PoolReply {
                op: PendingOp::Stage,
                reply,
            });
        });
    }

    fn on_pool_reply(&mut self, op: PendingOp, reply: PoolReply) {
        let expected = match self.state {
            RequestState::WaitingForPool2Pool => Some(PendingOp::Pool2Pool),
            RequestState::WaitingForStaging => Some(PendingOp::Stage),
            _ => None,
        };
        if expected != Some(op) {
            if self.state == RequestState::Suspended {
                // a late reply for an operation the error handler already
                // wrote off
                tracing::debug!("handler {}: stale {op:?} reply ignored", self.key);
                return;
            }
            self.fail_with(CacheError::Unexpected(format!(
                "unexpected {op:?} reply in state {}",
                self.state
            )));
            return;
        }

        match op {
            PendingOp::Pool2Pool => {
                if reply.is_ok() {
                    let destination = self
                        .current_pool
                        .clone()
                        .expect("waiting state always has a target pool");
                    self.succeed(destination);
                } else {
                    let config = self.config();
                    let selector = self.selector();
                    if self.stageable(&config) {
                        self.try_stage(&selector);
                    } else {
                        self.error_handler(CacheError::from_reply(reply.rc, reply.message));
                    }
                }
            }
            PendingOp::Stage => {
                if reply.is_ok() {
                    let pool = self
                        .current_pool
                        .clone()
                        .expect("waiting state always has a target pool");
                    self.succeed(pool);
                } else if reply.rc == codes::HSM_DELAY {
                    self.suspend(&CacheError::HsmDelay(reply.message));
                } else {
                    self.error_handler(CacheError::from_reply(reply.rc, reply.message));
                }
            }
        }
    }

    fn on_ping_failure(&mut self, pool: &str) {
        let involved = self
            .current_pool
            .as_ref()
            .is_some_and(|p| p.name == pool);
        if self.state.is_waiting() && involved {
            self.error_handler(CacheError::Timeout(format!(
                "pool {pool} no longer knows about {}",
                self.request.attributes.pnfs_id
            )));
        }
    }

    // ------------------------------------------------------------------
    // outcome handling
    // ------------------------------------------------------------------

    /// Retry/suspend policy: while the retry budget lasts, park and come
    /// back automatically; beyond it, suspend if configured, else fail.
    fn error_handler(&mut self, error: CacheError) {
        self.retries += 1;
        let config = self.config();
        tracing::warn!(
            "handler {} error ({}/{} retries): {error}",
            self.key,
            self.retries,
            config.max_retries
        );

        if self.retries <= config.max_retries {
            self.suspend(&error);
            let tx = self.self_tx.clone();
            let delay = Duration::from_secs(config.retry_interval_secs);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(HandlerEvent::Retry);
            });
        } else if config.suspend_on_error {
            self.suspend(&error);
        } else {
            self.fail_with(error);
        }
    }

    fn suspend(&mut self, error: &CacheError) {
        tracing::info!("handler {} suspended: {error}", self.key);
        self.set_state(RequestState::Suspended);
        self.transport.send_billing(BillingEvent::Suspended {
            key: self.key.clone(),
        });
    }

    fn succeed(&mut self, pool: SelectedPool) {
        tracing::info!("handler {} done: pool {}", self.key, pool.name);
        self.transport.send_billing(BillingEvent::Success {
            key: self.key.clone(),
            pool: pool.name.clone(),
        });
        self.terminate(Ok(pool));
    }

    fn fail_with(&mut self, error: CacheError) {
        tracing::warn!("handler {} failed: {error}", self.key);
        self.transport.send_billing(BillingEvent::Failure {
            key: self.key.clone(),
            code: error.code(),
            message: error.to_string(),
        });
        self.terminate(Err(error));
    }

    /// Leave the registry and answer every still-valid waiter. Removal and
    /// waiter collection happen under the registry lock, so a requester
    /// either lands in the answered batch or finds the key free again.
    fn terminate(&mut self, outcome: Result<SelectedPool, CacheError>) {
        self.current_pool = None;
        self.set_state(RequestState::Out);
        let waiters = match self.registry.lock().remove(&self.key) {
            Some(shared) => shared.waiters,
            None => Vec::new(),
        };
        let now = Instant::now();
        for waiter in waiters {
            if waiter.expired(now) {
                // TTL elapsed: the requester is assumed gone, drop silently
                continue;
            }
            let _ = waiter.reply.send(outcome.clone());
        }
    }
}
