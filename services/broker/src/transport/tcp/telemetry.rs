// Metrics helpers for the TCP transport adapter.
//
// All helpers are no-ops until a recorder is installed by the binary.
use metrics::{counter, gauge};

pub(crate) fn record_frame_in(role: &'static str) {
    counter!("comet_frames_in_total", "role" => role).increment(1);
}

pub(crate) fn record_frame_out(role: &'static str) {
    counter!("comet_frames_out_total", "role" => role).increment(1);
}

pub(crate) fn record_error(role: &'static str, reason: &'static str) {
    match reason {
        "parse_error" => counter!("comet_parse_errors_total", "role" => role).increment(1),
        "protocol_violation" => {
            counter!("comet_protocol_violations_total", "role" => role).increment(1)
        }
        "dead_peer" => counter!("comet_dead_peers_total").increment(1),
        _ => counter!("comet_connection_errors_total", "role" => role, "reason" => reason)
            .increment(1),
    }
}

pub(crate) fn record_event_received(role: &'static str) {
    counter!("comet_events_received_total", "role" => role).increment(1);
}

pub(crate) fn record_reconnect_attempt() {
    counter!("comet_reconnect_attempts_total").increment(1);
}

pub(crate) fn set_publisher_connections(count: usize) {
    gauge!("comet_publisher_connections").set(count as f64);
}
