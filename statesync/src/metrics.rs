//! Replication counters for the authority
//!
//! Counts are always kept in process. With the `metrics` feature they are
//! additionally exported as prometheus counters.

#[cfg(feature = "metrics")]
use prometheus::{IntCounter, Registry};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub states_sent: u64,
    pub patches_sent: u64,
    pub empty_diffs_suppressed: u64,
    pub dispatches: u64,
    pub dispatch_failures: u64,
}

#[cfg(feature = "metrics")]
struct Exported {
    registry: Registry,
    states_sent: IntCounter,
    patches_sent: IntCounter,
    empty_diffs_suppressed: IntCounter,
    dispatches: IntCounter,
    dispatch_failures: IntCounter,
}

#[cfg(feature = "metrics")]
impl Exported {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            states_sent: counter("statesync_states_sent_total", "Full state broadcasts")?,
            patches_sent: counter("statesync_patches_sent_total", "Patch broadcasts")?,
            empty_diffs_suppressed: counter(
                "statesync_empty_diffs_suppressed_total",
                "State changes that produced an empty diff",
            )?,
            dispatches: counter("statesync_dispatches_total", "Dispatch requests handled")?,
            dispatch_failures: counter(
                "statesync_dispatch_failures_total",
                "Dispatch requests answered with an error",
            )?,
            registry,
        })
    }
}

/// Metrics collector shared by an authority and its handlers.
#[derive(Default)]
pub struct ReplicationMetrics {
    states_sent: AtomicU64,
    patches_sent: AtomicU64,
    empty_diffs_suppressed: AtomicU64,
    dispatches: AtomicU64,
    dispatch_failures: AtomicU64,
    #[cfg(feature = "metrics")]
    exported: Option<Exported>,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        tracing::debug!("Creating replication metrics collector");

        #[cfg(feature = "metrics")]
        {
            let exported = match Exported::new() {
                Ok(exported) => Some(exported),
                Err(error) => {
                    tracing::warn!(%error, "Failed to create prometheus counters");
                    None
                }
            };

            Self {
                exported,
                ..Self::default()
            }
        }

        #[cfg(not(feature = "metrics"))]
        {
            Self::default()
        }
    }

    pub fn record_state_sent(&self) {
        self.states_sent.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(exported) = &self.exported {
                exported.states_sent.inc();
            }
        }
        tracing::trace!("Recorded full state broadcast");
    }

    pub fn record_patch_sent(&self, entries: usize) {
        self.patches_sent.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(exported) = &self.exported {
                exported.patches_sent.inc();
            }
        }
        tracing::trace!(entries, "Recorded patch broadcast");
    }

    pub fn record_empty_diff(&self) {
        self.empty_diffs_suppressed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(exported) = &self.exported {
                exported.empty_diffs_suppressed.inc();
            }
        }
        tracing::trace!("Recorded suppressed empty diff");
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(exported) = &self.exported {
                exported.dispatches.inc();
            }
        }
        tracing::trace!("Recorded dispatch");
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            if let Some(exported) = &self.exported {
                exported.dispatch_failures.inc();
            }
        }
        tracing::trace!("Recorded dispatch failure");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            states_sent: self.states_sent.load(Ordering::Relaxed),
            patches_sent: self.patches_sent.load(Ordering::Relaxed),
            empty_diffs_suppressed: self.empty_diffs_suppressed.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }

    /// Get metrics registry (for Prometheus export)
    #[cfg(feature = "metrics")]
    pub fn registry(&self) -> Option<&Registry> {
        self.exported.as_ref().map(|exported| &exported.registry)
    }
}
