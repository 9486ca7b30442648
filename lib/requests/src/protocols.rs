//! Request and reply payloads of the workflow container.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use spool_core::protocols::FileAttributes;

/// Which workflow branches a request permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedStates {
    pub p2p: bool,
    pub stage: bool,
}

impl Default for AllowedStates {
    fn default() -> Self {
        Self {
            p2p: true,
            stage: true,
        }
    }
}

/// An inbound read-pool-selection request. The reply carries the chosen
/// pool binding or a typed failure.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub attributes: FileAttributes,
    /// `<name>/<majorVersion>` of the requesting protocol.
    pub protocol: Option<String>,
    pub client: Option<IpAddr>,
    pub link_group: Option<String>,
    /// Restrict pool-to-pool destinations to this pool group.
    pub pool_group: Option<String>,
    pub excluded_hosts: HashSet<String>,
    pub allowed: AllowedStates,
    /// After this much waiting the request is silently dropped.
    pub ttl: Option<Duration>,
    /// Force the pool-to-pool branch regardless of cost state (the
    /// replicate specialization).
    pub force_p2p: bool,
}

impl ClientRequest {
    pub fn new(attributes: FileAttributes) -> Self {
        Self {
            attributes,
            protocol: None,
            client: None,
            link_group: None,
            pool_group: None,
            excluded_hosts: HashSet::new(),
            allowed: AllowedStates::default(),
            ttl: None,
            force_p2p: false,
        }
    }
}

/// Reply sent back by a pool for a stage or pool-to-pool request. Return
/// code zero is success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolReply {
    pub rc: u16,
    #[serde(default)]
    pub message: String,
}

impl PoolReply {
    pub fn ok() -> Self {
        Self {
            rc: 0,
            message: String::new(),
        }
    }

    pub fn failed(rc: u16, message: impl Into<String>) -> Self {
        Self {
            rc,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.rc == 0
    }
}

/// Fire-and-forget monitoring notification; no reply is expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "event")]
pub enum BillingEvent {
    Success {
        key: String,
        pool: String,
    },
    Failure {
        key: String,
        code: u16,
        message: String,
    },
    Suspended {
        key: String,
    },
}

/// The coalescing key of a workflow:
/// `pnfsid@network-protocol[-p2p][-pg-<group>]`. Requests with equal keys
/// share one handler.
pub fn workflow_key(request: &ClientRequest) -> String {
    let network = request
        .client
        .map(|a| a.to_string())
        .unwrap_or_else(|| "*".to_string());
    let protocol = request.protocol.as_deref().unwrap_or("*");
    let mut key = format!("{}@{network}-{protocol}", request.attributes.pnfs_id);
    if request.force_p2p {
        key.push_str("-p2p");
    }
    if let Some(group) = &request.pool_group {
        key.push_str("-pg-");
        key.push_str(group);
    }
    key
}

#[cfg(test)]
mod tests {
    use spool_core::protocols::PnfsId;

    use super::*;

    fn request() -> ClientRequest {
        ClientRequest::new(FileAttributes {
            pnfs_id: PnfsId::new("000F17"),
            storage_class: "exp:raw".into(),
            hsm: "osm".into(),
            cache_class: None,
            size: 1,
            locations: vec![],
            stored: false,
        })
    }

    #[test]
    fn test_workflow_key_shape() {
        let mut r = request();
        assert_eq!(workflow_key(&r), "000F17@*-*");

        r.client = Some("10.0.0.5".parse().unwrap());
        r.protocol = Some("dcap/3".to_string());
        assert_eq!(workflow_key(&r), "000F17@10.0.0.5-dcap/3");

        r.force_p2p = true;
        r.pool_group = Some("island".to_string());
        assert_eq!(workflow_key(&r), "000F17@10.0.0.5-dcap/3-p2p-pg-island");
    }

    #[test]
    fn test_identical_requests_share_a_key() {
        let a = request();
        let b = request();
        assert_eq!(workflow_key(&a), workflow_key(&b));
    }
}
