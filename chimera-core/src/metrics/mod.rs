//! Metric descriptions for the client
//!
//! The code records through the `metrics` facade. Nothing is exported unless
//! the embedding application installs a recorder; `init_metrics` only
//! attaches descriptions for whichever recorder that is.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Describe every metric the client records
pub fn init_metrics() {
    // Polling
    describe_counter!("chimera_poll_ticks_total", "Poll ticks that ran a fetch, by domain");
    describe_counter!(
        "chimera_poll_skipped_total",
        "Poll ticks skipped while disconnected, by domain"
    );
    describe_counter!(
        "chimera_poll_failures_total",
        "Poll fetches that failed or timed out, by domain"
    );
    describe_histogram!(
        "chimera_poll_fetch_duration_ms",
        Unit::Milliseconds,
        "Duration of completed poll fetches"
    );
    describe_gauge!("chimera_poll_active", "Number of live poll timers");

    // Event bus
    describe_counter!("chimera_events_published_total", "Events published, by type");
    describe_counter!(
        "chimera_event_handler_faults_total",
        "Event handlers that panicked during delivery"
    );

    // Session and stores
    describe_counter!(
        "chimera_session_invalidations_total",
        "Session invalidations, by reason"
    );
    describe_counter!("chimera_store_resets_total", "Full data store resets");
    describe_counter!(
        "chimera_stale_results_total",
        "Fetch results dropped by the ticket guard, by reason"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        // No recorder installed; descriptions are no-ops but must not panic
        init_metrics();
        init_metrics();
    }
}
