//! The outbound messaging seam towards pool processes.
//!
//! The wire envelope and cell framework live outside this crate; the
//! workflow only needs "deliver message X to pool Y and await (or ignore)
//! the reply".

use anyhow::Result;
use async_trait::async_trait;

use spool_core::protocols::FileAttributes;
use spool_router::SelectedPool;

use crate::protocols::{BillingEvent, PoolReply};

#[async_trait]
pub trait PoolTransport: Send + Sync {
    /// Ask `pool` to fetch the file from its archival backend.
    async fn send_stage_request(
        &self,
        pool: &SelectedPool,
        attributes: &FileAttributes,
    ) -> Result<PoolReply>;

    /// Ask the destination pool to pull a replica from the source pool.
    async fn send_pool2pool_request(
        &self,
        source: &SelectedPool,
        destination: &SelectedPool,
        attributes: &FileAttributes,
    ) -> Result<PoolReply>;

    /// Liveness probe: the pool's own listing of active transfers, checked
    /// by the poller for the presence of a pnfs id.
    async fn list_transfers(&self, pool: &str) -> Result<String>;

    /// Fire-and-forget monitoring notification.
    fn send_billing(&self, event: BillingEvent);
}
