//! Initiator ("app") transitions.

use tracing::info;

use super::{close_on_bye, Channel, Effect, LatencyMetric, SignalingMachine, Step};
use crate::envelope::{Envelope, SignalKind};
use crate::errors::{PreconditionError, ProtocolViolation};
use crate::session::{Connectivity, Readiness, Role, Session};

pub(super) fn on_signal(
    machine: &SignalingMachine,
    session: &mut Session,
    kind: &SignalKind,
    envelope: &Envelope,
    now_ms: i64,
) -> Result<Step, ProtocolViolation> {
    let mut step = Step::default();
    match kind {
        SignalKind::Ready => {
            if session.readiness == Readiness::PeerReady {
                return Ok(step);
            }
            session.readiness = Readiness::PeerReady;
            session.timestamps.ready_received = Some(now_ms);
            step.latency(LatencyMetric::ReadyDelivery, envelope.sent_at(), now_ms);
            if let Some(caps) = &envelope.data.capabilities {
                info!(session_id = %session.id, capabilities = %caps, "peer capabilities");
            }
            step.effect(Effect::PeerReady);
            if machine.auto_flow() && !session.auto_flow_started {
                session.auto_flow_started = true;
                step.effect(Effect::RunAutoFlow);
            }
        }
        SignalKind::Answer => {
            step.latency(LatencyMetric::OfferToAnswer, session.timestamps.offer_sent, now_ms);
        }
        SignalKind::Candidate => {
            step.latency(LatencyMetric::CandidateDelivery, envelope.sent_at(), now_ms);
        }
        SignalKind::Connected => {
            if session.connectivity == Connectivity::Connected {
                return Ok(step);
            }
            session.connectivity = Connectivity::Connected;
            session.timestamps.connected = Some(now_ms);
            step.latency(LatencyMetric::SessionToConnected, session.timestamps.created, now_ms);
            step.effect(Effect::Connected);
            step.effect(Effect::StartKeepalive);
        }
        SignalKind::Bye => close_on_bye(session, envelope, &mut step),
        SignalKind::Keepalive | SignalKind::KeepaliveResponse => {
            return machine.on_keepalive(session, Channel::Signal, kind, envelope, now_ms);
        }
        SignalKind::Offer => return Err(ProtocolViolation::NotForRole(kind.to_string())),
        SignalKind::Unrecognized(other) => return Err(ProtocolViolation::UnrecognizedType(other.clone())),
    }
    Ok(step)
}

impl SignalingMachine {
    /// Send the offer. Requires the peer to have announced readiness.
    pub fn offer(&self, session: &mut Session, sdp: &str, now_ms: i64) -> Result<Step, PreconditionError> {
        self.require_role(Role::Initiator, "offer")?;
        super::require_open(session)?;
        if session.readiness != Readiness::PeerReady {
            return Err(PreconditionError::PeerNotReady);
        }

        let data = self.payload(session, SignalKind::Offer).with_sdp(sdp);
        session.timestamps.offer_sent = Some(now_ms);

        let mut step = Step::default();
        step.emit(Channel::Signal, self.signal(data, now_ms));
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::machine::LatencySample;

    fn fresh(auto: bool) -> (SignalingMachine, Session) {
        (
            SignalingMachine::new(Role::Initiator, APP).with_auto_flow(auto),
            Session::initiated("s1", APP, Some(DEVICE.into()), 1_000),
        )
    }

    #[test]
    fn test_ready_marks_peer_ready() {
        let (m, mut s) = fresh(false);
        let step = m
            .on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Ready, "s1", DEVICE, 1_100), 1_150)
            .unwrap();
        assert_eq!(s.readiness, Readiness::PeerReady);
        assert_eq!(s.timestamps.ready_received, Some(1_150));
        assert!(step.outbound.is_empty());
        assert!(step.has_effect(&Effect::PeerReady));
        assert!(!step.has_effect(&Effect::RunAutoFlow));
        assert!(step.has_effect(&Effect::Latency(LatencySample {
            metric: LatencyMetric::ReadyDelivery,
            millis: 50
        })));
    }

    #[test]
    fn test_ready_triggers_auto_flow_once() {
        let (m, mut s) = fresh(true);
        let ready = inbound(SignalKind::Ready, "s1", DEVICE, 0);
        let first = m.on_envelope(&mut s, Channel::Signal, &ready, 5).unwrap();
        assert!(first.has_effect(&Effect::RunAutoFlow));

        let again = m.on_envelope(&mut s, Channel::Signal, &ready, 6).unwrap();
        assert!(again.is_empty());
        assert!(s.auto_flow_started);
    }

    #[test]
    fn test_offer_requires_peer_ready() {
        let (m, mut s) = fresh(false);
        let before = s.clone();
        assert_eq!(m.offer(&mut s, "v=0", 10), Err(PreconditionError::PeerNotReady));
        assert_eq!(s, before);

        s.readiness = Readiness::PeerReady;
        let step = m.offer(&mut s, "v=0", 10).unwrap();
        assert_eq!(step.outbound.len(), 1);
        let env = &step.outbound[0].envelope;
        assert_eq!(env.kind(), Some(&SignalKind::Offer));
        assert_eq!(env.data.to.as_deref(), Some(DEVICE));
        assert_eq!(env.data.sdp.as_deref(), Some("v=0"));
        assert_eq!(s.timestamps.offer_sent, Some(10));
    }

    #[test]
    fn test_offer_not_available_to_responder() {
        let m = SignalingMachine::new(Role::Responder, DEVICE);
        let mut s = Session::adopted("s1", DEVICE, None, 0);
        s.readiness = Readiness::PeerReady;
        assert_eq!(m.offer(&mut s, "x", 0), Err(PreconditionError::WrongRole("offer")));
    }

    #[test]
    fn test_answer_measures_offer_round_trip() {
        let (m, mut s) = fresh(false);
        s.readiness = Readiness::PeerReady;
        m.offer(&mut s, "v=0", 2_000).unwrap();
        let step = m
            .on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Answer, "s1", DEVICE, 2_100), 2_300)
            .unwrap();
        assert_eq!(
            step.latencies().copied().collect::<Vec<_>>(),
            vec![LatencySample {
                metric: LatencyMetric::OfferToAnswer,
                millis: 300
            }]
        );
    }

    #[test]
    fn test_answer_without_offer_records_nothing() {
        let (m, mut s) = fresh(false);
        let step = m
            .on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Answer, "s1", DEVICE, 1), 2)
            .unwrap();
        assert!(step.is_empty());
    }

    #[test]
    fn test_connected_starts_keepalive_once() {
        let (m, mut s) = fresh(false);
        let connected = inbound(SignalKind::Connected, "s1", DEVICE, 0);
        let step = m.on_envelope(&mut s, Channel::Signal, &connected, 4_000).unwrap();
        assert_eq!(s.connectivity, Connectivity::Connected);
        assert!(step.has_effect(&Effect::StartKeepalive));
        assert!(step.has_effect(&Effect::Latency(LatencySample {
            metric: LatencyMetric::SessionToConnected,
            millis: 3_000
        })));

        let dup = m.on_envelope(&mut s, Channel::Signal, &connected, 4_001).unwrap();
        assert!(dup.is_empty());
    }

    #[test]
    fn test_bye_closes_without_reply() {
        let (m, mut s) = fresh(false);
        let mut bye = inbound(SignalKind::Bye, "s1", DEVICE, 0);
        bye.data.reason = Some("shutdown".into());
        let step = m.on_envelope(&mut s, Channel::Signal, &bye, 1).unwrap();
        assert_eq!(s.connectivity, Connectivity::Closed);
        assert!(step.outbound.is_empty());
        assert!(step.has_effect(&Effect::Closed {
            reason: Some("shutdown".into())
        }));

        assert_eq!(
            m.on_envelope(&mut s, Channel::Signal, &bye, 2),
            Err(ProtocolViolation::AlreadyClosed)
        );
    }

    #[test]
    fn test_offer_from_peer_rejected() {
        let (m, mut s) = fresh(false);
        let before = s.clone();
        assert_eq!(
            m.on_envelope(&mut s, Channel::Signal, &inbound(SignalKind::Offer, "s1", DEVICE, 0), 1),
            Err(ProtocolViolation::NotForRole("offer".into()))
        );
        assert_eq!(s, before);
    }
}
