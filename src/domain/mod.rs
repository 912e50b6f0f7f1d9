//! Domain models for connection-tracking flow aggregation.
//!
//! These types are independent of any event source or writer.

mod counters;
mod flow_key;
mod packet;

pub use counters::Counters;
pub use flow_key::{canonical_addr, FlowKey};
pub use packet::{Direction, Packet};
