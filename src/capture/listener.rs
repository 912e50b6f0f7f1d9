//! Listener threads shared by packet sources.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

/// A running listener: one thread publishing onto a source's stream.
///
/// Stopping clears the running flag; joining the thread is the listener's
/// acknowledgement that it no longer publishes.
pub struct ListenerHandle {
    name: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Spawn a listener thread. The body must return once `running` is false.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(format!("listener-{name}"))
            .spawn(move || body(flag))?;

        Ok(Self {
            name,
            running,
            thread: Some(thread),
        })
    }

    /// Ask the listener to stop without waiting.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the listener and block until its thread has exited.
    pub fn stop(mut self) {
        self.request_stop();
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Listener {} panicked", self.name);
            } else {
                debug!("Listener {} stopped", self.name);
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.request_stop();
        self.join();
    }
}

/// Stop a group of listeners: signal all of them first, then wait for each.
pub fn stop_all(listeners: Vec<ListenerHandle>) {
    for listener in &listeners {
        listener.request_stop();
    }
    for listener in listeners {
        listener.stop();
    }
}

/// Counters describing how well a source is doing.
///
/// Shared between a source's listeners and whoever wants to observe them.
#[derive(Debug, Clone, Default)]
pub struct SourceHealth {
    inner: Arc<HealthCounters>,
}

#[derive(Debug, Default)]
struct HealthCounters {
    published: AtomicU64,
    malformed: AtomicU64,
    oversized: AtomicU64,
    registration_failures: AtomicU64,
    transport_failures: AtomicU64,
}

/// Point-in-time copy of `SourceHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceHealthReport {
    pub published: u64,
    pub malformed: u64,
    /// Events dropped because their length exceeded 65535 bytes
    pub oversized: u64,
    pub registration_failures: u64,
    pub transport_failures: u64,
}

impl SourceHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.inner.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.inner.oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration_failure(&self) {
        self.inner.registration_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_failure(&self) {
        self.inner.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether at least one listener failed to register or lost its transport.
    pub fn is_degraded(&self) -> bool {
        let report = self.report();
        report.registration_failures > 0 || report.transport_failures > 0
    }

    pub fn report(&self) -> SourceHealthReport {
        SourceHealthReport {
            published: self.inner.published.load(Ordering::Relaxed),
            malformed: self.inner.malformed.load(Ordering::Relaxed),
            oversized: self.inner.oversized.load(Ordering::Relaxed),
            registration_failures: self.inner.registration_failures.load(Ordering::Relaxed),
            transport_failures: self.inner.transport_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_stop_waits_for_thread_exit() {
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);
        let handle = ListenerHandle::spawn("test", move |running| {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            exited_flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        handle.stop();
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_all_stops_every_listener() {
        let exits = Arc::new(AtomicUsize::new(0));
        let listeners: Vec<_> = (0..4)
            .map(|i| {
                let exits = Arc::clone(&exits);
                ListenerHandle::spawn(format!("l{i}"), move |running| {
                    while running.load(Ordering::SeqCst) {
                        thread::yield_now();
                    }
                    exits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        stop_all(listeners);
        assert_eq!(exits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_health_counters() {
        let health = SourceHealth::new();
        let shared = health.clone();
        shared.record_published();
        shared.record_published();
        shared.record_malformed();
        shared.record_oversized();
        assert!(!health.is_degraded());
        shared.record_registration_failure();
        assert!(health.is_degraded());
        assert_eq!(
            health.report(),
            SourceHealthReport {
                published: 2,
                malformed: 1,
                oversized: 1,
                registration_failures: 1,
                transport_failures: 0,
            }
        );
    }
}
