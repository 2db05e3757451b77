//! Responder ("device") transitions.
//!
//! The responder learns about a session from a configuration push, answers it
//! with `ready`, and treats the first ICE candidate after the offer as the
//! connection being up. The last part stands in for a real ICE check.

use serde_json::json;

use super::{close_on_bye, out_of_phase, Channel, Effect, LatencyMetric, SignalingMachine, Step};
use crate::envelope::{Command, Envelope, SignalKind};
use crate::errors::{PreconditionError, ProtocolViolation};
use crate::rtc_config::RtcConfig;
use crate::session::{Connectivity, Readiness, Role, Session};

/// Capabilities advertised in `ready`.
pub fn default_capabilities() -> serde_json::Value {
    json!({
        "video": true,
        "audio": true,
        "maxResolution": "1920x1080",
        "codecs": "H264,H265",
    })
}

pub(super) fn on_signal(
    machine: &SignalingMachine,
    session: &mut Session,
    kind: &SignalKind,
    envelope: &Envelope,
    now_ms: i64,
) -> Result<Step, ProtocolViolation> {
    let mut step = Step::default();
    match kind {
        SignalKind::Offer => match session.connectivity {
            Connectivity::Idle | Connectivity::Negotiating => {
                session.connectivity = Connectivity::Negotiating;
                session.timestamps.offer_received = Some(now_ms);
                step.latency(LatencyMetric::OfferDelivery, envelope.sent_at(), now_ms);
                step.latency(LatencyMetric::ReadyToOffer, session.timestamps.ready_sent, now_ms);
            }
            other => return Err(out_of_phase(kind, other)),
        },
        SignalKind::Candidate => match session.connectivity {
            Connectivity::Negotiating => {
                step.latency(LatencyMetric::CandidateDelivery, envelope.sent_at(), now_ms);
                machine.mark_connected(session, now_ms, &mut step);
                let data = machine.payload(session, SignalKind::Connected);
                step.emit(Channel::Signal, machine.signal(data, now_ms));
            }
            // trickled candidates after the connection is up
            Connectivity::Connected => {
                step.latency(LatencyMetric::CandidateDelivery, envelope.sent_at(), now_ms);
            }
            other => return Err(out_of_phase(kind, other)),
        },
        SignalKind::Connected => match session.connectivity {
            Connectivity::Negotiating => machine.mark_connected(session, now_ms, &mut step),
            Connectivity::Connected => {}
            other => return Err(out_of_phase(kind, other)),
        },
        SignalKind::Bye => {
            if !session.bye_sent {
                let data = machine.payload(session, SignalKind::Bye).with_reason("peer closed");
                step.emit(Channel::Signal, machine.signal(data, now_ms));
                session.bye_sent = true;
            }
            close_on_bye(session, envelope, &mut step);
        }
        SignalKind::Keepalive | SignalKind::KeepaliveResponse => {
            return machine.on_keepalive(session, Channel::Signal, kind, envelope, now_ms);
        }
        SignalKind::Ready | SignalKind::Answer => return Err(ProtocolViolation::NotForRole(kind.to_string())),
        SignalKind::Unrecognized(other) => return Err(ProtocolViolation::UnrecognizedType(other.clone())),
    }
    Ok(step)
}

impl SignalingMachine {
    fn mark_connected(&self, session: &mut Session, now_ms: i64, step: &mut Step) {
        session.connectivity = Connectivity::Connected;
        session.timestamps.connected = Some(now_ms);
        step.latency(LatencyMetric::SessionToConnected, session.timestamps.created, now_ms);
        step.effect(Effect::Connected);
        step.effect(Effect::StartKeepalive);
    }

    /// Adopt the session described by a configuration push and announce
    /// readiness for it.
    pub fn adopt(&self, envelope: &Envelope, now_ms: i64) -> Result<(Session, RtcConfig, Step), ProtocolViolation> {
        if self.role != Role::Responder {
            return Err(ProtocolViolation::NotForRole(envelope.cmd.to_string()));
        }
        if envelope.cmd != Command::ConfigService {
            return Err(ProtocolViolation::UnknownCommand(envelope.cmd.to_string()));
        }
        if let Some(from) = envelope.sender() {
            if from == self.local_id {
                return Err(ProtocolViolation::SelfEcho(from.to_string()));
            }
        }
        let session_id = envelope
            .session_id()
            .filter(|sid| !sid.is_empty())
            .ok_or(ProtocolViolation::MissingField("sessionId"))?;

        let peer_id = envelope.data.member_id.as_deref().map(str::to_string);
        let mut session = Session::adopted(session_id, self.local_id.clone(), peer_id, now_ms);
        let config = RtcConfig::from_payload(&envelope.data);
        let step = self.announce_ready(&mut session, now_ms);
        Ok((session, config, step))
    }

    /// Send `ready` for the current session.
    pub fn ready(&self, session: &mut Session, now_ms: i64) -> Result<Step, PreconditionError> {
        self.require_role(Role::Responder, "ready")?;
        super::require_open(session)?;
        Ok(self.announce_ready(session, now_ms))
    }

    fn announce_ready(&self, session: &mut Session, now_ms: i64) -> Step {
        let mut data = self.payload(session, SignalKind::Ready);
        data.capabilities = Some(default_capabilities());
        session.readiness = Readiness::PeerReady;
        session.timestamps.ready_sent = Some(now_ms);

        let mut step = Step::default();
        step.emit(Channel::Signal, self.signal(data, now_ms));
        step.effect(Effect::PeerReady);
        step
    }

    /// Send an answer.
    pub fn answer(&self, session: &mut Session, sdp: &str, now_ms: i64) -> Result<Step, PreconditionError> {
        self.require_role(Role::Responder, "answer")?;
        super::require_open(session)?;
        let data = self.payload(session, SignalKind::Answer).with_sdp(sdp);
        let mut step = Step::default();
        step.emit(Channel::Signal, self.signal(data, now_ms));
        Ok(step)
    }

    /// Announce the connection as established.
    pub fn connected(&self, session: &mut Session, now_ms: i64) -> Result<Step, PreconditionError> {
        self.require_role(Role::Responder, "connected")?;
        super::require_open(session)?;
        let mut step = Step::default();
        if !session.is_connected() {
            self.mark_connected(session, now_ms, &mut step);
        }
        let data = self.payload(session, SignalKind::Connected);
        step.emit(Channel::Signal, self.signal(data, now_ms));
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::envelope::Payload;

    fn config_push(session_id: &str) -> Envelope {
        let mut data = Payload {
            session_id: Some(session_id.into()),
            member_id: Some(APP.into()),
            ..Default::default()
        };
        RtcConfig::fallback().fill_payload(&mut data);
        Envelope::new(Command::ConfigService, 100, "cfg", data)
    }

    fn adopted() -> (SignalingMachine, Session) {
        let m = SignalingMachine::new(Role::Responder, DEVICE);
        let (s, _, _) = m.adopt(&config_push("s1"), 1_000).unwrap();
        (m, s)
    }

    #[test]
    fn test_config_push_adopts_and_emits_ready() {
        let m = SignalingMachine::new(Role::Responder, DEVICE);
        let (s, config, step) = m.adopt(&config_push("s1"), 1_000).unwrap();

        assert_eq!(s.id, "s1");
        assert_eq!(s.peer_id.as_deref(), Some(APP));
        assert_eq!(s.readiness, Readiness::PeerReady);
        assert_eq!(s.connectivity, Connectivity::Idle);
        assert_eq!(config, RtcConfig::fallback());

        assert_eq!(step.outbound.len(), 1);
        let ready = &step.outbound[0].envelope;
        assert_eq!(ready.kind(), Some(&SignalKind::Ready));
        assert_eq!(ready.data.to.as_deref(), Some(APP));
        assert_eq!(ready.data.capabilities.as_ref().unwrap()["maxResolution"], "1920x1080");
    }

    #[test]
    fn test_config_push_requires_session_id() {
        let m = SignalingMachine::new(Role::Responder, DEVICE);
        let mut push = config_push("s1");
        push.data.session_id = None;
        assert_eq!(m.adopt(&push, 0).unwrap_err(), ProtocolViolation::MissingField("sessionId"));
    }

    #[test]
    fn test_offer_moves_to_negotiating() {
        let (m, mut s) = adopted();
        let step = m
            .on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Offer, "s1", APP, 1_200), 1_250)
            .unwrap();
        assert_eq!(s.connectivity, Connectivity::Negotiating);
        assert!(step.outbound.is_empty());
        let metrics: Vec<_> = step.latencies().map(|l| (l.metric, l.millis)).collect();
        assert_eq!(
            metrics,
            vec![(LatencyMetric::OfferDelivery, 50), (LatencyMetric::ReadyToOffer, 250)]
        );
    }

    #[test]
    fn test_candidate_while_negotiating_connects() {
        let (m, mut s) = adopted();
        m.on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Offer, "s1", APP, 0), 1)
            .unwrap();
        let step = m
            .on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Candidate, "s1", APP, 0), 2)
            .unwrap();

        assert_eq!(s.connectivity, Connectivity::Connected);
        assert_eq!(step.outbound.len(), 1);
        assert_eq!(step.outbound[0].envelope.kind(), Some(&SignalKind::Connected));
        assert!(step.has_effect(&Effect::StartKeepalive));

        // further candidates are accepted silently
        let again = m
            .on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Candidate, "s1", APP, 0), 3)
            .unwrap();
        assert!(again.outbound.is_empty());
        assert!(!again.has_effect(&Effect::StartKeepalive));
    }

    #[test]
    fn test_candidate_before_offer_dropped() {
        let (m, mut s) = adopted();
        let before = s.clone();
        assert!(matches!(
            m.on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Candidate, "s1", APP, 0), 1),
            Err(ProtocolViolation::OutOfPhase {
                connectivity: Connectivity::Idle,
                ..
            })
        ));
        assert_eq!(s, before);
    }

    #[test]
    fn test_connected_from_peer() {
        let (m, mut s) = adopted();
        m.on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Offer, "s1", APP, 0), 1)
            .unwrap();
        let step = m
            .on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Connected, "s1", APP, 0), 2)
            .unwrap();
        assert!(s.is_connected());
        assert!(step.outbound.is_empty());
        assert!(step.has_effect(&Effect::StartKeepalive));
    }

    #[test]
    fn test_bye_answered_once() {
        let (m, mut s) = adopted();
        let bye = inbound(SignalKind::Bye, "s1", APP, 0);
        let step = m.on_envelope(&mut s, Channel::Signal, &bye, 1).unwrap();
        assert_eq!(s.connectivity, Connectivity::Closed);
        assert_eq!(step.outbound.len(), 1);
        assert_eq!(step.outbound[0].envelope.kind(), Some(&SignalKind::Bye));

        let before = s.clone();
        assert_eq!(
            m.on_envelope(&mut s, Channel::Signal, &bye, 2),
            Err(ProtocolViolation::AlreadyClosed)
        );
        assert_eq!(s, before);
    }

    #[test]
    fn test_manual_connected_is_idempotent_for_state() {
        let (m, mut s) = adopted();
        let first = m.connected(&mut s, 5).unwrap();
        assert!(first.has_effect(&Effect::StartKeepalive));
        let second = m.connected(&mut s, 6).unwrap();
        assert_eq!(second.outbound.len(), 1);
        assert!(!second.has_effect(&Effect::StartKeepalive));
    }

    #[test]
    fn test_ready_and_answer_require_responder() {
        let m = SignalingMachine::new(Role::Initiator, APP);
        let mut s = Session::initiated("s1", APP, None, 0);
        assert_eq!(m.ready(&mut s, 0), Err(PreconditionError::WrongRole("ready")));
        assert_eq!(m.answer(&mut s, "v=0", 0), Err(PreconditionError::WrongRole("answer")));
    }
}
