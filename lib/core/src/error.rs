//! Spool error taxonomy.
//!
//! Every failure that can cross the selection / routing / workflow seams is a
//! [`CacheError`] variant carrying a stable numeric code from [`codes`].
//! Consumers (the request container, monitoring sinks) branch on the variant
//! or the code rather than on message text.

use serde::{Deserialize, Serialize};

use crate::protocols::PnfsId;

/// Stable numeric codes for the failure categories.
///
/// The categories must stay distinct; the numbers themselves are local to
/// this deployment and are kept in one place so a renumbering touches
/// nothing else.
pub mod codes {
    /// No link matched the request at all.
    pub const NO_POOL_CONFIGURED: u16 = 101;
    /// Links matched but no candidate pool is online.
    pub const NO_POOL_ONLINE: u16 = 102;
    /// The file has no online replica anywhere.
    pub const FILE_NOT_IN_CACHE: u16 = 103;
    /// The file is online but not in any pool the request may read.
    pub const PERMISSION_DENIED: u16 = 104;
    /// The file exists but only on archival storage.
    pub const FILE_NOT_ONLINE: u16 = 105;
    /// Best candidate exceeded the configured cost cut.
    pub const COST_EXCEEDED: u16 = 110;
    /// Pool-to-pool source side exceeded its cost cut.
    pub const SOURCE_COST_EXCEEDED: u16 = 111;
    /// Pool-to-pool destination side exceeded its cost cut.
    pub const DESTINATION_COST_EXCEEDED: u16 = 112;
    /// Target pool refused for lack of resources (e.g. stage slots).
    pub const MISSING_RESOURCE: u16 = 120;
    /// Archival backend asked us to come back later.
    pub const HSM_DELAY: u16 = 121;
    /// No reply from the target pool, or a liveness probe lost the request.
    pub const TIMEOUT: u16 = 130;
    /// Malformed name, unknown entity, duplicate creation.
    pub const INVALID_ARGUMENT: u16 = 140;
    /// A state machine hit a condition that must not occur.
    pub const UNEXPECTED_SYSTEM_EXCEPTION: u16 = 199;
}

/// Typed failure returned by selection, routing and workflow operations.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum CacheError {
    #[error("file {0} is not in any online pool")]
    FileNotInCache(PnfsId),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("file {0} is not online (archival copy only)")]
    FileNotOnline(PnfsId),

    #[error("no pool configured: {0}")]
    NoPoolConfigured(String),

    #[error("no pool online: {0}")]
    NoPoolOnline(String),

    #[error("cost exceeded: {message}")]
    CostExceeded { message: String, fallback: bool },

    #[error("p2p source cost exceeded: {message}")]
    SourceCostExceeded { message: String, fallback: bool },

    #[error("p2p destination cost exceeded: {message}")]
    DestinationCostExceeded { message: String, fallback: bool },

    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error("hsm delay: {0}")]
    HsmDelay(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected system exception: {0}")]
    Unexpected(String),
}

impl CacheError {
    pub fn code(&self) -> u16 {
        match self {
            CacheError::FileNotInCache(_) => codes::FILE_NOT_IN_CACHE,
            CacheError::PermissionDenied(_) => codes::PERMISSION_DENIED,
            CacheError::FileNotOnline(_) => codes::FILE_NOT_ONLINE,
            CacheError::NoPoolConfigured(_) => codes::NO_POOL_CONFIGURED,
            CacheError::NoPoolOnline(_) => codes::NO_POOL_ONLINE,
            CacheError::CostExceeded { .. } => codes::COST_EXCEEDED,
            CacheError::SourceCostExceeded { .. } => codes::SOURCE_COST_EXCEEDED,
            CacheError::DestinationCostExceeded { .. } => codes::DESTINATION_COST_EXCEEDED,
            CacheError::MissingResource(_) => codes::MISSING_RESOURCE,
            CacheError::HsmDelay(_) => codes::HSM_DELAY,
            CacheError::Timeout(_) => codes::TIMEOUT,
            CacheError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            CacheError::Unexpected(_) => codes::UNEXPECTED_SYSTEM_EXCEPTION,
        }
    }

    /// Whether the caller may retry the selection at the next preference
    /// level. Only cost failures ever permit that.
    pub fn should_fallback(&self) -> bool {
        match self {
            CacheError::CostExceeded { fallback, .. }
            | CacheError::SourceCostExceeded { fallback, .. }
            | CacheError::DestinationCostExceeded { fallback, .. } => *fallback,
            _ => false,
        }
    }

    /// Map a numeric code from a pool reply back into a variant. Unknown
    /// codes collapse into `Unexpected` so the workflow error handler sees
    /// them as fatal-for-this-request.
    pub fn from_reply(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::HSM_DELAY => CacheError::HsmDelay(message),
            codes::MISSING_RESOURCE => CacheError::MissingResource(message),
            codes::TIMEOUT => CacheError::Timeout(message),
            codes::COST_EXCEEDED => CacheError::CostExceeded {
                message,
                fallback: false,
            },
            _ => CacheError::Unexpected(format!("pool replied rc={code}: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            codes::NO_POOL_CONFIGURED,
            codes::NO_POOL_ONLINE,
            codes::FILE_NOT_IN_CACHE,
            codes::PERMISSION_DENIED,
            codes::FILE_NOT_ONLINE,
            codes::COST_EXCEEDED,
            codes::SOURCE_COST_EXCEEDED,
            codes::DESTINATION_COST_EXCEEDED,
            codes::MISSING_RESOURCE,
            codes::HSM_DELAY,
            codes::TIMEOUT,
            codes::INVALID_ARGUMENT,
            codes::UNEXPECTED_SYSTEM_EXCEPTION,
        ];
        let mut sorted = all.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), all.len(), "duplicate error code");
    }

    #[test]
    fn test_fallback_only_on_cost_errors() {
        let e = CacheError::CostExceeded {
            message: "p1".into(),
            fallback: true,
        };
        assert!(e.should_fallback());

        let e = CacheError::CostExceeded {
            message: "p1".into(),
            fallback: false,
        };
        assert!(!e.should_fallback());

        assert!(!CacheError::PermissionDenied("x".into()).should_fallback());
        assert!(!CacheError::Timeout("x".into()).should_fallback());
    }

    #[test]
    fn test_from_reply_roundtrip() {
        let e = CacheError::from_reply(codes::HSM_DELAY, "tape robot busy");
        assert!(matches!(e, CacheError::HsmDelay(_)));
        assert_eq!(e.code(), codes::HSM_DELAY);

        let e = CacheError::from_reply(42, "garbled");
        assert_eq!(e.code(), codes::UNEXPECTED_SYSTEM_EXCEPTION);
    }
}
