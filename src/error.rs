//! Error kinds for upgrade-time and registry failures.
//!
//! Everything past the upgrade is recovered locally; these kinds only exist
//! where a caller has to pick an HTTP status or resolve a registry conflict.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    /// Peer id is not 40 lowercase hex characters.
    #[error("invalid peerId")]
    InvalidPeerId,

    /// Auth token configured but missing or wrong.
    #[error("unauthorized")]
    Unauthorized,

    /// A live record already exists for this peer id.
    #[error("peer {0} already registered")]
    DuplicatePeer(String),

    /// Connection cap reached; the new socket is closed with policy-violation.
    #[error("connection limit reached")]
    ConnectionCap,
}

impl SignalError {
    /// HTTP status for upgrade-time refusals.
    pub fn status(&self) -> StatusCode {
        match self {
            SignalError::InvalidPeerId => StatusCode::FORBIDDEN,
            SignalError::Unauthorized => StatusCode::UNAUTHORIZED,
            SignalError::DuplicatePeer(_) | SignalError::ConnectionCap => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_statuses() {
        assert_eq!(SignalError::InvalidPeerId.status(), StatusCode::FORBIDDEN);
        assert_eq!(SignalError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }
}
