//! Error types for the signaling core.
//!
//! Inbound problems ([`ProtocolViolation`]) never propagate: the envelope is
//! dropped and logged. Local command problems ([`PreconditionError`]) and
//! collaborator failures surface through [`EndpointError`].

use thiserror::Error;

use crate::api::ApiError;
use crate::envelope::CodecError;
use crate::session::Connectivity;
use crate::topic::TopicError;
use p2ps_transport::TransportError;

// ============================================================================
// Inbound envelope rejection
// ============================================================================

/// Reason an inbound envelope was discarded without effect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// No session is held locally
    #[error("no active session")]
    NoSession,

    /// The local session is already closed
    #[error("session already closed")]
    AlreadyClosed,

    /// Command tag is not handled on this route
    #[error("unexpected command tag '{0}'")]
    UnknownCommand(String),

    /// Payload carried no message type
    #[error("missing message type")]
    MissingType,

    /// A required payload field was absent
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// Message type outside the signaling vocabulary
    #[error("unrecognized message type '{0}'")]
    UnrecognizedType(String),

    /// Sender is the local identity (broker echo)
    #[error("self-echo from '{0}'")]
    SelfEcho(String),

    /// Envelope belongs to another session
    #[error("session mismatch: local '{local}', envelope {got:?}")]
    SessionMismatch { local: String, got: Option<String> },

    /// Sender is not the known peer
    #[error("unexpected sender {got:?}, peer is '{peer}'")]
    ForeignSender { peer: String, got: Option<String> },

    /// Message is not valid in the current phase
    #[error("'{kind}' not accepted while {connectivity:?}")]
    OutOfPhase { kind: String, connectivity: Connectivity },

    /// Message type not handled by this role
    #[error("'{0}' not handled by this role")]
    NotForRole(String),

    /// Payload could not be decoded
    #[error("undecodable payload: {0}")]
    Undecodable(String),
}

// ============================================================================
// Local command rejection
// ============================================================================

/// A local operation was requested without the state it needs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("no active session")]
    NoSession,

    #[error("session is closed")]
    SessionClosed,

    #[error("peer is not ready")]
    PeerNotReady,

    #[error("session is not connected")]
    NotConnected,

    #[error("operation '{0}' is not available to this role")]
    WrongRole(&'static str),

    #[error("no session service configured")]
    NoSessionService,
}

// ============================================================================
// Endpoint errors
// ============================================================================

/// Errors returned by endpoint operations.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("session service error: {0}")]
    Api(#[from] ApiError),

    /// The automated flow finished without reaching `Connected`
    #[error("flow ended while {0:?}")]
    NotConnected(Connectivity),

    /// The session closed while a flow step was pending
    #[error("session closed during flow")]
    Interrupted,

    /// Waited too long for a peer message
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl EndpointError {
    /// Whether the error came from the transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, EndpointError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_converts_into_endpoint_error() {
        let err: EndpointError = PreconditionError::PeerNotReady.into();
        assert!(matches!(err, EndpointError::Precondition(PreconditionError::PeerNotReady)));
        assert_eq!(err.to_string(), "peer is not ready");
    }

    #[test]
    fn test_transport_classification() {
        let err: EndpointError = TransportError::Disconnected.into();
        assert!(err.is_transport());
        assert!(!EndpointError::Interrupted.is_transport());
    }

    #[test]
    fn test_violation_messages() {
        let v = ProtocolViolation::SessionMismatch {
            local: "a".into(),
            got: Some("b".into()),
        };
        assert_eq!(v.to_string(), "session mismatch: local 'a', envelope Some(\"b\")");
    }
}
