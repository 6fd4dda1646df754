//! Client metrics
//!
//! Emitted through the `metrics` facade; they are no-ops until the host
//! installs a recorder.
//!
//! - `client_requests_total` (counter): label `outcome`
//! - `client_refresh_total` (counter): label `outcome` (`success`, `rejected`)
//! - `client_replays_total` (counter)
//! - `client_teardowns_total` (counter)

/// Record the final outcome of one `send` call.
pub fn record_request(outcome: &'static str) {
    metrics::counter!("client_requests_total", "outcome" => outcome).increment(1);
}

/// Record a settled refresh attempt.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("client_refresh_total", "outcome" => outcome).increment(1);
}

pub fn record_replay() {
    metrics::counter!("client_replays_total").increment(1);
}

pub fn record_teardown() {
    metrics::counter!("client_teardowns_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    /// Isolated recorder so tests don't fight over the global one.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("success");
        record_refresh("rejected");
        record_replay();
        record_teardown();
    }

    #[test]
    fn refresh_counter_carries_outcome_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_refresh("success");
        record_refresh("rejected");

        let output = handle.render();
        assert!(output.contains("client_refresh_total"));
        assert!(output.contains("outcome=\"success\""));
        assert!(output.contains("outcome=\"rejected\""));
    }

    #[test]
    fn replay_and_teardown_counters_render() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_replay();
        record_replay();
        record_teardown();
        record_request("unauthorized");

        let output = handle.render();
        assert!(output.contains("client_replays_total 2"), "got: {output}");
        assert!(output.contains("client_teardowns_total 1"), "got: {output}");
        assert!(output.contains("outcome=\"unauthorized\""));
    }
}
