//! Flow aggregation.
//!
//! The `FlowTable` accumulates counters per interface and flow key under a
//! single lock; `FlowSnapshot` is the immutable copy handed to writers.

mod snapshot;
mod table;

pub use snapshot::{FlowRecord, FlowSnapshot};
pub use table::FlowTable;

use std::collections::HashMap;

use crate::domain::{Counters, FlowKey};

/// Flows of one interface.
pub type InterfaceFlows = HashMap<FlowKey, Counters>;

/// Interface name to flows of that interface.
pub type FlowMap = HashMap<String, InterfaceFlows>;

/// Deterministic rendering: interfaces sorted by name, flows sorted by key.
pub(crate) fn render_flows(flows: &FlowMap) -> String {
    let mut ifaces: Vec<_> = flows.iter().collect();
    ifaces.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::new();
    for (iface, iface_flows) in ifaces {
        out.push_str(&format!("{iface}:\n"));
        let mut entries: Vec<_> = iface_flows.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (key, counters) in entries {
            out.push_str(&format!("\t{key}; {counters}\n"));
        }
        out.push('\n');
    }
    out
}
