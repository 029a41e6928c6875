// Connection-local protocol errors and their reporting.
use comet_transport::ConnectionId;
use comet_wire::{FrameError, ParseError};

use crate::transport::tcp::telemetry;

/// Everything that can go wrong on a single connection. None of these are
/// ever sent to the peer; they are logged, counted and mapped to a
/// disposition by the owning role.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("unparsable payload: {0}")]
    Parse(#[from] ParseError),
    #[error("incomprehensible message with role {role:?}: {reason}")]
    Violation { role: String, reason: &'static str },
    #[error("peer missed {missed} heartbeats")]
    DeadPeer { missed: i64 },
    #[error("peer stopped reading with {queued} frames queued")]
    Stalled { queued: usize },
}

impl ProtocolError {
    pub fn violation(role: impl Into<String>, reason: &'static str) -> Self {
        ProtocolError::Violation {
            role: role.into(),
            reason,
        }
    }
}

pub(crate) fn error_reason(err: &ProtocolError) -> &'static str {
    match err {
        ProtocolError::Frame(FrameError::TooLarge { .. }) => "frame_too_large",
        ProtocolError::Frame(_) => "frame_error",
        ProtocolError::Parse(_) => "parse_error",
        ProtocolError::Violation { .. } => "protocol_violation",
        ProtocolError::DeadPeer { .. } => "dead_peer",
        ProtocolError::Stalled { .. } => "write_stalled",
    }
}

/// Logs and counts an error on behalf of `role`.
pub(crate) fn report(conn: Option<ConnectionId>, role: &'static str, err: &ProtocolError) {
    let reason = error_reason(err);
    telemetry::record_error(role, reason);
    let conn = conn.map(|id| id.to_string()).unwrap_or_default();
    match err {
        ProtocolError::DeadPeer { .. } | ProtocolError::Stalled { .. } => {
            tracing::warn!(conn_id = %conn, role, error = %err, "peer unresponsive; aborting");
        }
        _ => {
            tracing::warn!(conn_id = %conn, role, reason, error = %err, "protocol error");
        }
    }
}
