//! Dispatch metrics.
//!
//! Counters and histograms for claims, contention, transient retries, and
//! status transitions. These complement the structured logging already in
//! place; without an installed recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Claim Metrics
// ============================================================================

/// Rows claimed, labeled by backend.
pub const ROWS_CLAIMED: &str = "sweep_rows_claimed_total";

/// Claim attempts that found nothing eligible.
pub const CLAIMS_EXHAUSTED: &str = "sweep_claims_exhausted_total";

/// Optimistic claim attempts that lost a race.
pub const CLAIM_CONFLICTS: &str = "sweep_claim_conflicts_total";

/// Time spent inside `claim_next`.
pub const CLAIM_DURATION: &str = "sweep_claim_duration_seconds";

// ============================================================================
// Backend Metrics
// ============================================================================

/// Transient backend failures that were retried.
pub const TRANSIENT_RETRIES: &str = "sweep_transient_retries_total";

// ============================================================================
// Status Metrics
// ============================================================================

/// Status transitions recorded, labeled by target status class.
pub const TRANSITIONS: &str = "sweep_status_transitions_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all dispatch metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(ROWS_CLAIMED, "Total rows claimed by this process");
    describe_counter!(CLAIMS_EXHAUSTED, "Claim attempts that found no eligible row");
    describe_counter!(CLAIM_CONFLICTS, "Optimistic claim attempts that lost a race");
    describe_histogram!(CLAIM_DURATION, "Duration of claim attempts in seconds");
    describe_counter!(TRANSIENT_RETRIES, "Transient backend failures retried");
    describe_counter!(TRANSITIONS, "Row status transitions recorded");
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records the outcome of a claim attempt.
pub fn record_claim(backend: &'static str, claimed: bool, duration_secs: f64) {
    if claimed {
        counter!(ROWS_CLAIMED, "backend" => backend).increment(1);
    } else {
        counter!(CLAIMS_EXHAUSTED, "backend" => backend).increment(1);
    }
    histogram!(CLAIM_DURATION, "backend" => backend).record(duration_secs);
}

/// Records an optimistic claim that was overwritten by another worker.
pub fn record_claim_conflict(backend: &'static str) {
    counter!(CLAIM_CONFLICTS, "backend" => backend).increment(1);
}

/// Records a retried transient failure.
pub fn record_transient_retry(operation: &str) {
    counter!(TRANSIENT_RETRIES, "operation" => operation.to_string()).increment(1);
}

/// Records a status transition.
pub fn record_transition(status_class: &'static str) {
    counter!(TRANSITIONS, "status" => status_class).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        register_metrics();
        record_claim("delimited_file", true, 0.01);
        record_claim("sheets", false, 0.2);
        record_claim_conflict("sheets");
        record_transient_retry("sheets.read");
        record_transition("success");
    }
}
