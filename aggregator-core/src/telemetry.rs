//! Lightweight observability helpers built on `tracing`.

use std::time::Instant;

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber, filtered through `RUST_LOG`.
/// Safe to call more than once; later calls are no-ops.
pub fn install_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Measures a section of the pipeline and logs its wall time on drop.
///
/// Bind it to a named variable for the duration of the section; `_timer`
/// works, a bare `_` drops it immediately.
pub struct Stopwatch {
    label: &'static str,
    start: Instant,
}

impl Stopwatch {
    #[must_use]
    pub fn started(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        tracing::info!(label = self.label, elapsed_ms = self.elapsed_ms(), "timing");
    }
}
