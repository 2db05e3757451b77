//! Session state for one signaling negotiation.
//!
//! An endpoint tracks exactly one [`Session`] at a time. The record is owned
//! by the orchestrator and mutated only by the signaling state machine.

use std::fmt;

use serde::Serialize;

// ============================================================================
// Roles and phases
// ============================================================================

/// Endpoint role in a negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The "app": creates sessions and sends the offer
    Initiator,
    /// The "device": receives configuration and answers
    Responder,
}

impl Role {
    /// The role on the other side of the session.
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "app",
            Role::Responder => "device",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the responder has announced it is ready to negotiate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Readiness {
    #[default]
    Unknown,
    WaitingForPeer,
    PeerReady,
}

/// Negotiation/connection phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Connectivity {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl Connectivity {
    pub fn is_closed(self) -> bool {
        self == Connectivity::Closed
    }
}

// ============================================================================
// Session record
// ============================================================================

/// Timestamps (milliseconds since the Unix epoch) recorded for latency
/// measurement. Unset means "not observed".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimestamps {
    pub created: Option<i64>,
    pub ready_sent: Option<i64>,
    pub ready_received: Option<i64>,
    pub offer_sent: Option<i64>,
    pub offer_received: Option<i64>,
    pub candidate_sent: Option<i64>,
    pub connected: Option<i64>,
    /// Sequence and send time of the last keepalive this side sent
    pub last_keepalive_sent: Option<(u64, i64)>,
}

/// The single active negotiation of an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub role: Role,
    pub local_id: String,
    /// Peer identity; learned from the first inbound message when unknown
    pub peer_id: Option<String>,
    pub readiness: Readiness,
    pub connectivity: Connectivity,
    pub timestamps: SessionTimestamps,
    /// This side already sent `bye`
    pub bye_sent: bool,
    /// The automated flow has been triggered for this session
    pub auto_flow_started: bool,
}

impl Session {
    /// Session created by the initiator after the HTTP create call.
    pub fn initiated(id: impl Into<String>, local_id: impl Into<String>, peer_id: Option<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            role: Role::Initiator,
            local_id: local_id.into(),
            peer_id,
            readiness: Readiness::WaitingForPeer,
            connectivity: Connectivity::Negotiating,
            timestamps: SessionTimestamps {
                created: Some(now_ms),
                ..Default::default()
            },
            bye_sent: false,
            auto_flow_started: false,
        }
    }

    /// Session adopted by the responder from a configuration push.
    pub fn adopted(id: impl Into<String>, local_id: impl Into<String>, peer_id: Option<String>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            role: Role::Responder,
            local_id: local_id.into(),
            peer_id,
            readiness: Readiness::Unknown,
            connectivity: Connectivity::Idle,
            timestamps: SessionTimestamps {
                created: Some(now_ms),
                ..Default::default()
            },
            bye_sent: false,
            auto_flow_started: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.connectivity.is_closed()
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity == Connectivity::Connected
    }

    /// Move to `Closed`. Returns `false` if the session was already closed.
    pub fn close(&mut self) -> bool {
        if self.connectivity.is_closed() {
            return false;
        }
        self.connectivity = Connectivity::Closed;
        true
    }
}
