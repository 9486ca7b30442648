//! The request container: one asynchronous state machine per distinct
//! workflow key, driving the read / pool-to-pool / stage workflow against
//! the pool monitor, coalescing duplicate requests and surviving slow pools
//! through retries, suspension and liveness probing.

pub mod container;
pub mod handler;
pub mod protocols;
pub mod transport;

pub use container::{RequestCommandProcessor, RequestContainer};
pub use handler::{HandlerInfo, RequestState};
pub use protocols::{AllowedStates, BillingEvent, ClientRequest, PoolReply, workflow_key};
pub use transport::PoolTransport;
