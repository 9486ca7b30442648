//! Shared foundation for the spool pool manager: the error taxonomy, the
//! payload types exchanged with pools and gateways, runtime configuration
//! and logging setup.

pub use anyhow::{Context as ErrorContext, Result, anyhow as error, bail as raise};

pub mod config;
pub mod error;
pub mod logging;
pub mod protocols;

pub use config::SpoolConfig;
pub use error::{CacheError, codes};
pub use protocols::{
    Direction, FileAttributes, PnfsId, PoolCostInfo, PoolHeartbeat, PoolMode, PoolStatusChange,
};
