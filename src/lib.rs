//! Connection-pool hash table: reusable connections grouped by remote
//! endpoint, handed out one owner at a time, with bounded waiting when a
//! pool runs dry.

mod errors;
mod key;
mod metrics;
mod node;
mod pool;
mod stats;
mod table;
mod waitq;

pub use errors::Error;
pub use key::Endpoint;
pub use metrics::{EndpointLabels, Metrics};
pub use node::{ConnNode, ConnSnapshot, ConnState};
pub use pool::PoolSnapshot;
pub use stats::{ConnOp, ConnStatsSnapshot};
pub use table::ConnTable;
