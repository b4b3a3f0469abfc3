// Error taxonomy shared by the relay and its clients.
//
// The kinds are a flat set, not a hierarchy: every failure that crosses the
// wire is reduced to one `ErrorKind` plus a human-readable message. The
// relay's internal error enums (`BackendError`, `StoreError`, ...) convert
// into `AmflowError` at the connection boundary, and `AmflowError` converts
// into the `ErrorPayload` that is actually serialized.
//
// Kind names on the wire are the PascalCase variant names
// (`"BadRequest"`, `"TokenRevoked"`, ...). A peer that sends a name this
// crate does not know is mapped to `RuntimeError` rather than rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a failure reported to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Operation invalid in the current connection or session state.
    InvalidStatus,
    /// Caller lacks the required permission.
    PermissionError,
    /// Capability deliberately unsupported by this relay.
    NotImplemented,
    Timeout,
    /// Malformed input, unknown token, or play id mismatch.
    BadRequest,
    /// Uncategorized failure.
    RuntimeError,
    TokenRevoked,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::InvalidStatus,
        ErrorKind::PermissionError,
        ErrorKind::NotImplemented,
        ErrorKind::Timeout,
        ErrorKind::BadRequest,
        ErrorKind::RuntimeError,
        ErrorKind::TokenRevoked,
    ];

    /// Wire name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::InvalidStatus => "InvalidStatus",
            ErrorKind::PermissionError => "PermissionError",
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::TokenRevoked => "TokenRevoked",
        }
    }

    /// Inverse of `name`. Unknown names become `RuntimeError`.
    pub fn from_name(name: &str) -> ErrorKind {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .unwrap_or(ErrorKind::RuntimeError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed failure: kind plus message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct AmflowError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AmflowError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn invalid_status(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidStatus, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeError, message)
    }
}

/// Serialized form of an error as it travels to a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_name(&self.name)
    }
}

impl From<AmflowError> for ErrorPayload {
    fn from(err: AmflowError) -> Self {
        Self {
            name: err.kind.name().to_string(),
            message: err.message,
        }
    }
}

impl From<ErrorPayload> for AmflowError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            kind: payload.kind(),
            message: payload.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip_for_every_kind() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_name(kind.name()), kind);
        }
    }

    #[test]
    fn unknown_name_maps_to_runtime_error() {
        assert_eq!(ErrorKind::from_name("SegFault"), ErrorKind::RuntimeError);
        assert_eq!(ErrorKind::from_name(""), ErrorKind::RuntimeError);
    }

    #[test]
    fn payload_carries_kind_name_and_message() {
        let payload = ErrorPayload::from(AmflowError::bad_request("invalid playId"));
        assert_eq!(payload.name, "BadRequest");
        assert_eq!(payload.message, "invalid playId");

        let back = AmflowError::from(payload);
        assert_eq!(back.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn serde_uses_variant_name() {
        let json = serde_json::to_string(&ErrorKind::TokenRevoked).unwrap();
        assert_eq!(json, r#""TokenRevoked""#);
    }

    #[test]
    fn display_includes_kind() {
        let err = AmflowError::invalid_status("already opened");
        assert_eq!(err.to_string(), "InvalidStatus: already opened");
    }
}
