//! Engine counters.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::EngineState;

/// Live counters of one engine, shared with its handle.
#[derive(Debug, Clone)]
pub struct EngineStats {
    inner: Arc<Counters>,
}

#[derive(Debug)]
struct Counters {
    state: AtomicU8,
    packets_applied: AtomicU64,
    flushes_delivered: AtomicU64,
    flushes_dropped: AtomicU64,
    final_delivered: AtomicBool,
}

/// Totals of an engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineReport {
    pub packets_applied: u64,
    /// Periodic snapshots handed off to the delivery queue
    pub flushes_delivered: u64,
    /// Periodic snapshots dropped because the queue was full or closed
    pub flushes_dropped: u64,
    /// Whether the final snapshot was handed off
    pub final_delivered: bool,
}

impl EngineStats {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Counters {
                state: AtomicU8::new(EngineState::Idle.as_u8()),
                packets_applied: AtomicU64::new(0),
                flushes_delivered: AtomicU64::new(0),
                flushes_dropped: AtomicU64::new(0),
                final_delivered: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn packets_applied(&self) -> u64 {
        self.inner.packets_applied.load(Ordering::Relaxed)
    }

    pub(crate) fn record_packet(&self) {
        self.inner.packets_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, delivered: bool) {
        let counter = if delivered {
            &self.inner.flushes_delivered
        } else {
            &self.inner.flushes_dropped
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_final(&self, delivered: bool) {
        self.inner.final_delivered.store(delivered, Ordering::SeqCst);
    }

    pub fn report(&self) -> EngineReport {
        EngineReport {
            packets_applied: self.inner.packets_applied.load(Ordering::Relaxed),
            flushes_delivered: self.inner.flushes_delivered.load(Ordering::Relaxed),
            flushes_dropped: self.inner.flushes_dropped.load(Ordering::Relaxed),
            final_delivered: self.inner.final_delivered.load(Ordering::SeqCst),
        }
    }
}
