//! Signaling state machine.
//!
//! The machine never touches the transport. Each call takes the session by
//! mutable reference, applies at most one transition and returns a [`Step`]:
//! envelopes to publish and effects for the orchestrator to carry out.
//! Inbound envelopes that fail admission come back as a
//! [`ProtocolViolation`] and leave the session untouched.
//!
//! Both roles share admission, keepalive handling and the commands available
//! to either side; role-specific transitions live in [`initiator`] and
//! [`responder`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::envelope::{ChannelTag, Command, Envelope, Payload, SignalKind};
use crate::errors::{PreconditionError, ProtocolViolation};
use crate::session::{Connectivity, Role, Session};

pub mod initiator;
pub mod responder;

// ============================================================================
// Step output
// ============================================================================

/// Logical channel an envelope travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Per-session signaling topic
    Signal,
    /// Shared keepalive data topic
    Data,
}

/// Envelope to publish.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    pub channel: Channel,
    pub envelope: Envelope,
}

/// Named latency measurements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMetric {
    ReadyDelivery,
    OfferDelivery,
    ReadyToOffer,
    OfferToAnswer,
    CandidateDelivery,
    SessionToConnected,
    KeepaliveDelivery,
    KeepaliveRoundTrip,
}

impl LatencyMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            LatencyMetric::ReadyDelivery => "ready_delivery",
            LatencyMetric::OfferDelivery => "offer_delivery",
            LatencyMetric::ReadyToOffer => "ready_to_offer",
            LatencyMetric::OfferToAnswer => "offer_to_answer",
            LatencyMetric::CandidateDelivery => "candidate_delivery",
            LatencyMetric::SessionToConnected => "session_to_connected",
            LatencyMetric::KeepaliveDelivery => "keepalive_delivery",
            LatencyMetric::KeepaliveRoundTrip => "keepalive_round_trip",
        }
    }
}

impl fmt::Display for LatencyMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LatencySample {
    pub metric: LatencyMetric,
    pub millis: i64,
}

/// Side effects requested by a transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Responder announced readiness / initiator saw it
    PeerReady,
    /// Session reached `Connected`
    Connected,
    /// Start the keepalive scheduler for the session
    StartKeepalive,
    /// Stop the keepalive scheduler and pending flow steps
    StopKeepalive,
    /// Run the automated offer/candidate flow
    RunAutoFlow,
    /// Session moved to `Closed`
    Closed { reason: Option<String> },
    Latency(LatencySample),
}

/// Result of one transition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Step {
    pub outbound: Vec<Outbound>,
    pub effects: Vec<Effect>,
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.effects.is_empty()
    }

    pub fn has_effect(&self, effect: &Effect) -> bool {
        self.effects.contains(effect)
    }

    fn emit(&mut self, channel: Channel, envelope: Envelope) {
        self.outbound.push(Outbound { channel, envelope });
    }

    fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Record `to - from` only when the start time is known.
    fn latency(&mut self, metric: LatencyMetric, from: Option<i64>, to: i64) {
        if let Some(from) = from {
            self.effects.push(Effect::Latency(LatencySample {
                metric,
                millis: to - from,
            }));
        }
    }

    pub fn latencies(&self) -> impl Iterator<Item = &LatencySample> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Latency(s) => Some(s),
            _ => None,
        })
    }
}

// ============================================================================
// Machine
// ============================================================================

/// Transition logic for one endpoint identity.
#[derive(Debug)]
pub struct SignalingMachine {
    role: Role,
    local_id: String,
    auto_flow: bool,
    next_msg: AtomicU64,
}

impl SignalingMachine {
    pub fn new(role: Role, local_id: impl Into<String>) -> Self {
        Self {
            role,
            local_id: local_id.into(),
            auto_flow: false,
            next_msg: AtomicU64::new(1),
        }
    }

    /// Initiator only: trigger the automated flow when the peer turns ready.
    pub fn with_auto_flow(mut self, enabled: bool) -> Self {
        self.auto_flow = enabled;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn auto_flow(&self) -> bool {
        self.auto_flow
    }

    pub(crate) fn envelope(&self, cmd: Command, label: &str, data: Payload, now_ms: i64) -> Envelope {
        let n = self.next_msg.fetch_add(1, Ordering::Relaxed);
        Envelope::new(cmd, now_ms, format!("{label}_{now_ms}_{n}"), data)
    }

    /// Signaling payload from this endpoint to the session's peer.
    pub(crate) fn payload(&self, session: &Session, kind: SignalKind) -> Payload {
        Payload::signal(kind, session.id.clone(), self.local_id.clone(), session.peer_id.clone())
    }

    pub(crate) fn signal(&self, data: Payload, now_ms: i64) -> Envelope {
        let label = data.kind.as_ref().map(SignalKind::as_str).unwrap_or("signal").to_string();
        self.envelope(Command::Signal, &label, data, now_ms)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Apply an inbound envelope received on `channel`.
    pub fn on_envelope(
        &self,
        session: &mut Session,
        channel: Channel,
        envelope: &Envelope,
        now_ms: i64,
    ) -> Result<Step, ProtocolViolation> {
        let kind = self.admit(session, channel, envelope)?;

        let step = match (channel, self.role) {
            (Channel::Data, _) => self.on_keepalive(session, channel, &kind, envelope, now_ms)?,
            (Channel::Signal, Role::Initiator) => initiator::on_signal(self, session, &kind, envelope, now_ms)?,
            (Channel::Signal, Role::Responder) => responder::on_signal(self, session, &kind, envelope, now_ms)?,
        };

        if session.peer_id.is_none() {
            if let Some(from) = envelope.sender() {
                session.peer_id = Some(from.to_string());
            }
        }
        Ok(step)
    }

    /// Admission filter shared by both roles.
    fn admit(&self, session: &Session, channel: Channel, envelope: &Envelope) -> Result<SignalKind, ProtocolViolation> {
        if session.connectivity.is_closed() {
            return Err(ProtocolViolation::AlreadyClosed);
        }

        let kind = match (channel, &envelope.cmd) {
            (Channel::Signal, Command::Signal) => match envelope.kind() {
                None => return Err(ProtocolViolation::MissingType),
                Some(SignalKind::Unrecognized(other)) => {
                    return Err(ProtocolViolation::UnrecognizedType(other.clone()))
                }
                Some(kind) => kind.clone(),
            },
            (Channel::Data, Command::KeepaliveData) => SignalKind::Keepalive,
            (Channel::Data, Command::KeepaliveDataResponse) => SignalKind::KeepaliveResponse,
            (_, other) => return Err(ProtocolViolation::UnknownCommand(other.to_string())),
        };

        if let Some(from) = envelope.sender() {
            if from == self.local_id {
                return Err(ProtocolViolation::SelfEcho(from.to_string()));
            }
        }

        if envelope.session_id() != Some(session.id.as_str()) {
            return Err(ProtocolViolation::SessionMismatch {
                local: session.id.clone(),
                got: envelope.session_id().map(str::to_string),
            });
        }

        if let (Some(peer), Some(from)) = (&session.peer_id, envelope.sender()) {
            if peer != from {
                return Err(ProtocolViolation::ForeignSender {
                    peer: peer.clone(),
                    got: Some(from.to_string()),
                });
            }
        }

        Ok(kind)
    }

    /// Keepalive traffic on either channel: answer on the same channel.
    pub(crate) fn on_keepalive(
        &self,
        session: &mut Session,
        channel: Channel,
        kind: &SignalKind,
        envelope: &Envelope,
        now_ms: i64,
    ) -> Result<Step, ProtocolViolation> {
        if !session.is_connected() {
            return Err(ProtocolViolation::OutOfPhase {
                kind: kind.to_string(),
                connectivity: session.connectivity,
            });
        }

        let mut step = Step::default();
        match kind {
            SignalKind::Keepalive => {
                step.latency(LatencyMetric::KeepaliveDelivery, envelope.sent_at(), now_ms);

                let mut data = self.payload(session, SignalKind::KeepaliveResponse).with_status("alive");
                data.original_sequence = envelope.data.sequence;
                let reply = match channel {
                    Channel::Data => {
                        data.channel = Some(ChannelTag::Data);
                        self.envelope(Command::KeepaliveDataResponse, "p2p_keepalive_response", data, now_ms)
                    }
                    Channel::Signal => {
                        data.channel = Some(ChannelTag::Signal);
                        self.signal(data, now_ms)
                    }
                };
                step.emit(channel, reply);
            }
            SignalKind::KeepaliveResponse => {
                if let (Some((seq, sent)), Some(original)) =
                    (session.timestamps.last_keepalive_sent, envelope.data.original_sequence)
                {
                    if seq == original {
                        step.latency(LatencyMetric::KeepaliveRoundTrip, Some(sent), now_ms);
                    }
                }
            }
            other => return Err(ProtocolViolation::NotForRole(other.to_string())),
        }
        Ok(step)
    }

    // ------------------------------------------------------------------
    // Local commands available to both roles
    // ------------------------------------------------------------------

    /// Send an ICE candidate.
    pub fn candidate(
        &self,
        session: &mut Session,
        candidate: &str,
        sdp_mid: &str,
        m_line_index: u32,
        now_ms: i64,
    ) -> Result<Step, PreconditionError> {
        require_open(session)?;
        let data = self
            .payload(session, SignalKind::Candidate)
            .with_candidate(candidate, sdp_mid, m_line_index);
        session.timestamps.candidate_sent = Some(now_ms);

        let mut step = Step::default();
        step.emit(Channel::Signal, self.signal(data, now_ms));
        Ok(step)
    }

    /// Send one signaling-channel heartbeat.
    pub fn heartbeat(&self, session: &mut Session, sequence: u64, now_ms: i64) -> Result<Step, PreconditionError> {
        require_open(session)?;
        let mut step = Step::default();
        step.emit(Channel::Signal, self.signal_keepalive(session, sequence, now_ms));
        session.timestamps.last_keepalive_sent = Some((sequence, now_ms));
        Ok(step)
    }

    /// One keepalive tick: the same sequence on the data and the signaling
    /// channel. Only valid while connected.
    pub fn keepalive_tick(&self, session: &mut Session, sequence: u64, now_ms: i64) -> Result<Step, PreconditionError> {
        require_open(session)?;
        if !session.is_connected() {
            return Err(PreconditionError::NotConnected);
        }

        let data = self
            .payload(session, SignalKind::Keepalive)
            .with_sequence(sequence, ChannelTag::Data);
        let mut step = Step::default();
        step.emit(
            Channel::Data,
            self.envelope(Command::KeepaliveData, "p2p_keepalive", data, now_ms),
        );
        step.emit(Channel::Signal, self.signal_keepalive(session, sequence, now_ms));
        session.timestamps.last_keepalive_sent = Some((sequence, now_ms));
        Ok(step)
    }

    fn signal_keepalive(&self, session: &Session, sequence: u64, now_ms: i64) -> Envelope {
        let data = self
            .payload(session, SignalKind::Keepalive)
            .with_sequence(sequence, ChannelTag::Signal)
            .with_status("connected");
        self.signal(data, now_ms)
    }

    /// Close the session and tell the peer.
    pub fn bye(&self, session: &mut Session, reason: &str, now_ms: i64) -> Result<Step, PreconditionError> {
        require_open(session)?;
        let data = self.payload(session, SignalKind::Bye).with_reason(reason);

        let mut step = Step::default();
        step.emit(Channel::Signal, self.signal(data, now_ms));
        session.bye_sent = true;
        session.close();
        step.effect(Effect::StopKeepalive);
        step.effect(Effect::Closed {
            reason: Some(reason.to_string()),
        });
        Ok(step)
    }

    fn require_role(&self, role: Role, op: &'static str) -> Result<(), PreconditionError> {
        if self.role != role {
            return Err(PreconditionError::WrongRole(op));
        }
        Ok(())
    }
}

fn require_open(session: &Session) -> Result<(), PreconditionError> {
    if session.connectivity.is_closed() {
        return Err(PreconditionError::SessionClosed);
    }
    Ok(())
}

/// Close on an inbound `bye`; shared by both roles.
fn close_on_bye(session: &mut Session, envelope: &Envelope, step: &mut Step) {
    session.close();
    step.effect(Effect::StopKeepalive);
    step.effect(Effect::Closed {
        reason: envelope.data.reason.clone(),
    });
}

fn out_of_phase(kind: &SignalKind, connectivity: Connectivity) -> ProtocolViolation {
    ProtocolViolation::OutOfPhase {
        kind: kind.to_string(),
        connectivity,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    fn connected_session(role: Role) -> (SignalingMachine, Session) {
        let (local, peer) = match role {
            Role::Initiator => (APP, DEVICE),
            Role::Responder => (DEVICE, APP),
        };
        let machine = SignalingMachine::new(role, local);
        let mut session = match role {
            Role::Initiator => Session::initiated("s1", local, Some(peer.into()), 0),
            Role::Responder => Session::adopted("s1", local, Some(peer.into()), 0),
        };
        session.connectivity = Connectivity::Connected;
        (machine, session)
    }

    fn peer_of(role: Role) -> &'static str {
        match role {
            Role::Initiator => DEVICE,
            Role::Responder => APP,
        }
    }

    #[test]
    fn test_keepalive_tick_emits_both_channels_with_same_sequence() {
        let (m, mut s) = connected_session(Role::Initiator);
        let step = m.keepalive_tick(&mut s, 3, 1_000).unwrap();
        assert_eq!(step.outbound.len(), 2);

        let data = &step.outbound[0];
        assert_eq!(data.channel, Channel::Data);
        assert_eq!(data.envelope.cmd, Command::KeepaliveData);
        assert_eq!(data.envelope.data.sequence, Some(3));
        assert_eq!(data.envelope.data.channel, Some(ChannelTag::Data));

        let signal = &step.outbound[1];
        assert_eq!(signal.channel, Channel::Signal);
        assert_eq!(signal.envelope.kind(), Some(&SignalKind::Keepalive));
        assert_eq!(signal.envelope.data.sequence, Some(3));
        assert_eq!(signal.envelope.data.status.as_deref(), Some("connected"));
        assert_eq!(s.timestamps.last_keepalive_sent, Some((3, 1_000)));
    }

    #[test]
    fn test_keepalive_tick_requires_connected() {
        let (m, mut s) = connected_session(Role::Initiator);
        s.connectivity = Connectivity::Negotiating;
        assert_eq!(m.keepalive_tick(&mut s, 1, 0), Err(PreconditionError::NotConnected));
        s.connectivity = Connectivity::Closed;
        assert_eq!(m.keepalive_tick(&mut s, 1, 0), Err(PreconditionError::SessionClosed));
    }

    #[test]
    fn test_data_keepalive_answered_on_data_channel() {
        let (m, mut s) = connected_session(Role::Responder);
        let mut env = Envelope::new(
            Command::KeepaliveData,
            900,
            "k",
            Payload::signal(SignalKind::Keepalive, "s1", APP, None).with_sequence(7, ChannelTag::Data),
        );
        env.data.kind = None;

        let step = m.on_envelope(&mut s, Channel::Data, &env, 1_000).unwrap();
        assert_eq!(step.outbound.len(), 1);
        let reply = &step.outbound[0];
        assert_eq!(reply.channel, Channel::Data);
        assert_eq!(reply.envelope.cmd, Command::KeepaliveDataResponse);
        assert_eq!(reply.envelope.data.original_sequence, Some(7));
        assert_eq!(reply.envelope.data.status.as_deref(), Some("alive"));
        assert_eq!(
            step.latencies().next(),
            Some(&LatencySample {
                metric: LatencyMetric::KeepaliveDelivery,
                millis: 100
            })
        );
    }

    #[test]
    fn test_signal_keepalive_answered_on_signal_channel() {
        let (m, mut s) = connected_session(Role::Initiator);
        let mut env = inbound(SignalKind::Keepalive, "s1", DEVICE, 0);
        env.data.sequence = Some(2);
        let step = m.on_envelope(&mut s, Channel::Signal, &env, 10).unwrap();
        let reply = &step.outbound[0].envelope;
        assert_eq!(step.outbound[0].channel, Channel::Signal);
        assert_eq!(reply.cmd, Command::Signal);
        assert_eq!(reply.kind(), Some(&SignalKind::KeepaliveResponse));
        assert_eq!(reply.data.channel, Some(ChannelTag::Signal));
        assert_eq!(reply.data.original_sequence, Some(2));
        // ts of 0 means unknown: no delivery sample
        assert_eq!(step.latencies().count(), 0);
    }

    #[test]
    fn test_keepalive_ignored_unless_connected() {
        let (m, mut s) = connected_session(Role::Responder);
        s.connectivity = Connectivity::Negotiating;
        let before = s.clone();
        let env = inbound(SignalKind::Keepalive, "s1", APP, 1);
        assert!(matches!(
            m.on_envelope(&mut s, Channel::Signal, &env, 2),
            Err(ProtocolViolation::OutOfPhase { .. })
        ));
        assert_eq!(s, before);
    }

    #[test]
    fn test_keepalive_round_trip_measured() {
        let (m, mut s) = connected_session(Role::Initiator);
        m.keepalive_tick(&mut s, 4, 1_000).unwrap();
        let mut env = inbound(SignalKind::KeepaliveResponse, "s1", DEVICE, 1_010);
        env.data.original_sequence = Some(4);
        let step = m.on_envelope(&mut s, Channel::Signal, &env, 1_025).unwrap();
        assert!(step.outbound.is_empty());
        assert!(step.has_effect(&Effect::Latency(LatencySample {
            metric: LatencyMetric::KeepaliveRoundTrip,
            millis: 25
        })));
    }

    #[test]
    fn test_bye_closes_and_sets_flag() {
        let (m, mut s) = connected_session(Role::Initiator);
        let step = m.bye(&mut s, "user", 5).unwrap();
        assert_eq!(s.connectivity, Connectivity::Closed);
        assert!(s.bye_sent);
        assert_eq!(step.outbound[0].envelope.data.reason.as_deref(), Some("user"));
        assert!(step.has_effect(&Effect::StopKeepalive));
        assert_eq!(m.bye(&mut s, "again", 6), Err(PreconditionError::SessionClosed));
    }

    #[test]
    fn test_unknown_command_and_type_dropped() {
        let (m, mut s) = connected_session(Role::Responder);
        let mut env = inbound(SignalKind::Offer, "s1", APP, 1);
        env.cmd = Command::Unrecognized("OTHER".into());
        assert_eq!(
            m.on_envelope(&mut s, Channel::Signal, &env, 2),
            Err(ProtocolViolation::UnknownCommand("OTHER".into()))
        );

        let env = inbound(SignalKind::Unrecognized("renegotiate".into()), "s1", APP, 1);
        assert_eq!(
            m.on_envelope(&mut s, Channel::Signal, &env, 2),
            Err(ProtocolViolation::UnrecognizedType("renegotiate".into()))
        );

        let mut env = inbound(SignalKind::Offer, "s1", APP, 1);
        env.data.kind = None;
        assert_eq!(
            m.on_envelope(&mut s, Channel::Signal, &env, 2),
            Err(ProtocolViolation::MissingType)
        );

        // data-channel tags are not accepted on the signaling route
        let mut env = inbound(SignalKind::Keepalive, "s1", APP, 1);
        env.cmd = Command::KeepaliveData;
        assert!(matches!(
            m.on_envelope(&mut s, Channel::Signal, &env, 2),
            Err(ProtocolViolation::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_foreign_sender_dropped() {
        let (m, mut s) = connected_session(Role::Responder);
        let env = inbound(SignalKind::Bye, "s1", "intruder", 1);
        assert!(matches!(
            m.on_envelope(&mut s, Channel::Signal, &env, 2),
            Err(ProtocolViolation::ForeignSender { .. })
        ));
        assert!(s.is_connected());
    }

    fn any_kind() -> impl Strategy<Value = SignalKind> {
        prop_oneof![
            Just(SignalKind::Ready),
            Just(SignalKind::Offer),
            Just(SignalKind::Answer),
            Just(SignalKind::Candidate),
            Just(SignalKind::Connected),
            Just(SignalKind::Bye),
            Just(SignalKind::Keepalive),
            Just(SignalKind::KeepaliveResponse),
        ]
    }

    fn any_role() -> impl Strategy<Value = Role> {
        prop_oneof![Just(Role::Initiator), Just(Role::Responder)]
    }

    fn any_connectivity() -> impl Strategy<Value = Connectivity> {
        prop_oneof![
            Just(Connectivity::Idle),
            Just(Connectivity::Negotiating),
            Just(Connectivity::Connected),
        ]
    }

    proptest! {
        #[test]
        fn prop_foreign_session_never_changes_state(
            role in any_role(),
            kind in any_kind(),
            connectivity in any_connectivity(),
            other_sid in "[a-z0-9]{1,8}",
            channel in prop_oneof![Just(Channel::Signal), Just(Channel::Data)],
        ) {
            prop_assume!(other_sid != "s1");
            let (m, mut s) = connected_session(role);
            s.connectivity = connectivity;
            let before = s.clone();

            let mut env = inbound(kind, &other_sid, peer_of(role), 10);
            if channel == Channel::Data {
                env.cmd = Command::KeepaliveData;
            }
            let result = m.on_envelope(&mut s, channel, &env, 20);
            prop_assert!(matches!(result, Err(ProtocolViolation::SessionMismatch { .. })), "{:?}", result);
            prop_assert_eq!(s, before);
        }

        #[test]
        fn prop_self_echo_always_ignored(
            role in any_role(),
            kind in any_kind(),
            connectivity in any_connectivity(),
        ) {
            let (m, mut s) = connected_session(role);
            s.connectivity = connectivity;
            let before = s.clone();

            let env = inbound(kind, "s1", m.local_id(), 10);
            let result = m.on_envelope(&mut s, Channel::Signal, &env, 20);
            prop_assert!(matches!(result, Err(ProtocolViolation::SelfEcho(_))), "{:?}", result);
            prop_assert_eq!(s, before);
        }
    }
}
