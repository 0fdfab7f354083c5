//! Structured logging setup.

use std::sync::OnceLock;

use provinode_core::ScanId;
use tracing_subscriber::EnvFilter;

static CORRELATION_ID: OnceLock<ScanId> = OnceLock::new();

/// Process-wide correlation id stamped on every log event span.
pub fn correlation_id() -> &'static ScanId {
    CORRELATION_ID.get_or_init(ScanId::generate)
}

/// Initializes the tracing subscriber.
///
/// Filter defaults to `info` and honors `RUST_LOG`. Safe to call more
/// than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
    tracing::info!(correlation_id = %correlation_id(), "telemetry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_is_stable_for_the_process() {
        let a = correlation_id().clone();
        let b = correlation_id().clone();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }
}
