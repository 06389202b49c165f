//! The Kademlia routing structure the DHT subsystem keeps its peers in.
//!
//! Only the data structure lives here: the 160-bit id space, the XOR metric,
//! and the bucket tree. Sending ping and find-node RPCs, probing liveness,
//! and walking the network are the DHT subsystem's job; it reports outcomes
//! back via [`RoutingTable::record_response`] and
//! [`RoutingTable::record_failure`].
//!
//! The table is accessed from the DHT subsystem's own task. If it is shared
//! with other tasks it needs external synchronization.

mod node_id;
mod routing;

pub use node_id::{Distance, NodeId};
pub use routing::{AddResult, Bucket, Node, RoutingTable, TableObserver, BUCKET_MAX};
