//! Metric helpers for `netframing`.
//!
//! This module defines metric names and thin helpers over the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled the helpers compile to nothing.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::{error::FramingError, fault::FaultCode, mode::FramingMode};

/// Name of the gauge tracking connections in their preamble phase.
pub const CONNECTIONS_PENDING: &str = "netframing_connections_pending";
/// Name of the counter tracking classified connections, labelled by mode.
pub const CONNECTIONS_ACCEPTED: &str = "netframing_connections_accepted_total";
/// Name of the counter tracking faults sent to peers, labelled by fault.
pub const FAULTS_SENT: &str = "netframing_faults_sent_total";
/// Name of the counter tracking contained connection errors, labelled by kind.
pub const ERRORS_TOTAL: &str = "netframing_errors_total";
/// Name of the gauge tracking occupied reuse-pool slots.
pub const POOLED_CONNECTIONS: &str = "netframing_pooled_connections";
/// Name of the counter tracking panics in connection tasks.
pub const CONNECTION_PANICS: &str = "netframing_connection_panics_total";

/// Increment the pending connections gauge.
pub fn inc_pending() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_PENDING).increment(1.0);
}

/// Decrement the pending connections gauge.
pub fn dec_pending() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_PENDING).decrement(1.0);
}

/// Record a connection whose mode was decoded.
pub fn inc_accepted(mode: FramingMode) {
    #[cfg(feature = "metrics")]
    counter!(CONNECTIONS_ACCEPTED, "mode" => mode.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = mode;
}

/// Record a fault written to a peer.
pub fn inc_faults(code: FaultCode) {
    #[cfg(feature = "metrics")]
    counter!(FAULTS_SENT, "fault" => code.name()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = code;
}

/// Record a contained per-connection error.
pub fn inc_errors(err: &FramingError) {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL, "kind" => err.kind()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = err;
}

/// Publish the number of occupied reuse-pool slots.
#[cfg_attr(
    feature = "metrics",
    expect(
        clippy::cast_precision_loss,
        reason = "gauge values are f64; pool sizes are small"
    )
)]
pub fn set_pooled_connections(in_use: usize) {
    #[cfg(feature = "metrics")]
    gauge!(POOLED_CONNECTIONS).set(in_use as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = in_use;
}

/// Record a panic caught in a connection task.
pub fn inc_connection_panics() {
    #[cfg(feature = "metrics")]
    counter!(CONNECTION_PANICS).increment(1);
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;

    #[test]
    fn fault_counter_is_labelled_by_name() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            inc_faults(FaultCode::EndpointNotFound);
            inc_faults(FaultCode::EndpointNotFound);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let (key, _, _, value) = snapshot
            .into_iter()
            .find(|(key, ..)| key.key().name() == FAULTS_SENT)
            .expect("fault counter recorded");
        assert!(
            key.key()
                .labels()
                .any(|label| label.key() == "fault" && label.value() == "EndpointNotFound")
        );
        assert_eq!(value, DebugValue::Counter(2));
    }
}
