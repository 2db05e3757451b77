//! Session orchestrator.
//!
//! An [`Endpoint`] owns the single session of one identity, the transport
//! and the optional session service. Every state change, inbound or local,
//! happens under one lock: the machine computes a [`Step`], the endpoint runs
//! its effects and publishes its envelopes before the lock is released.
//! Background work (keepalive, automated flow) runs in the session's
//! [`TaskGroup`] and is cancelled when the session closes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::{fetch_config_or_fallback, SessionApi};
use crate::envelope::{decode, encode, Envelope};
use crate::errors::{EndpointError, PreconditionError, ProtocolViolation};
use crate::keepalive::{run_keepalive, KeepaliveExit, KeepaliveSettings, KeepaliveTarget, TaskGroup, TickOutcome};
use crate::machine::{Channel, Effect, LatencySample, Outbound, SignalingMachine, Step};
use crate::rtc_config::{ConfigSource, RtcConfig};
use crate::session::{Connectivity, Readiness, Role, Session};
use crate::topic::{Route, TopicAddress};
use p2ps_transport::{Delivery, PubSubTransport, QoS};

/// SDP sent by the simulated app.
pub const SIMULATED_OFFER_SDP: &str =
    "v=0\r\no=- 1234567890 1234567890 IN IP4 192.168.1.100\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
/// SDP sent by the simulated device.
pub const SIMULATED_ANSWER_SDP: &str =
    "v=0\r\no=- 9876543210 9876543210 IN IP4 192.168.1.200\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
const APP_CANDIDATE: &str = "candidate:1 1 UDP 2013266431 192.168.1.100 54321 typ host";
const DEVICE_CANDIDATE: &str = "candidate:1 1 UDP 2013266431 192.168.1.200 12345 typ host";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Settings
// ============================================================================

/// Fixed waits of the automated flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowSettings {
    pub after_offer: Duration,
    pub after_candidate: Duration,
    /// How long [`Endpoint::run_automated`] waits for `ready`
    pub ready_timeout: Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            after_offer: Duration::from_secs(1),
            after_candidate: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EndpointSettings {
    pub role: Role,
    pub local_id: String,
    pub topics: TopicAddress,
    pub keepalive: KeepaliveSettings,
    pub flow: FlowSettings,
    /// Initiator: run the flow as soon as the peer is ready
    pub auto_flow: bool,
}

impl EndpointSettings {
    /// Initiator ("app") identified by `app_id`.
    pub fn app(topics: TopicAddress, app_id: impl Into<String>) -> Self {
        Self {
            role: Role::Initiator,
            local_id: app_id.into(),
            topics,
            keepalive: KeepaliveSettings::default(),
            flow: FlowSettings::default(),
            auto_flow: false,
        }
    }

    /// Responder ("device"), identified by the topic's device id.
    pub fn device(topics: TopicAddress) -> Self {
        Self {
            role: Role::Responder,
            local_id: topics.device_id().to_string(),
            topics,
            keepalive: KeepaliveSettings::default(),
            flow: FlowSettings::default(),
            auto_flow: false,
        }
    }
}

// ============================================================================
// Events and snapshots
// ============================================================================

/// Notifications for drivers and tests.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EndpointEvent {
    SessionCreated { session_id: String },
    ConfigInstalled { session_id: String, source: ConfigSource },
    PeerReady { session_id: String },
    Connected { session_id: String },
    KeepaliveSent { session_id: String, sequence: u64 },
    KeepaliveStopped { session_id: String, ticks_sent: u32 },
    Latency { session_id: String, sample: LatencySample },
    Dropped { topic: String, reason: String },
    Closed { session_id: String, reason: Option<String> },
    FlowFinished { session_id: String, connected: bool },
}

/// Point-in-time view of an endpoint.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub role: Role,
    pub local_id: String,
    pub transport_connected: bool,
    pub session: Option<Session>,
    pub config: Option<RtcConfig>,
    pub config_source: Option<ConfigSource>,
    pub keepalive_interval_ms: u64,
    pub background_tasks: usize,
}

// ============================================================================
// Endpoint
// ============================================================================

struct EndpointState {
    session: Option<Session>,
    config: Option<(RtcConfig, ConfigSource)>,
    tasks: TaskGroup,
    heartbeat_seq: u64,
}

struct Inner {
    settings: EndpointSettings,
    transport: Arc<dyn PubSubTransport>,
    api: Option<Arc<dyn SessionApi>>,
    machine: SignalingMachine,
    state: Mutex<EndpointState>,
    events: broadcast::Sender<EndpointEvent>,
}

type FlowFuture = Pin<Box<dyn Future<Output = Result<(), EndpointError>> + Send>>;

/// One signaling endpoint (app or device).
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    pub fn new(
        settings: EndpointSettings,
        transport: Arc<dyn PubSubTransport>,
        api: Option<Arc<dyn SessionApi>>,
    ) -> Self {
        let machine = SignalingMachine::new(settings.role, settings.local_id.clone()).with_auto_flow(settings.auto_flow);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                api,
                machine,
                state: Mutex::new(EndpointState {
                    session: None,
                    config: None,
                    tasks: TaskGroup::new(),
                    heartbeat_seq: 0,
                }),
                events,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.settings.role
    }

    pub fn local_id(&self) -> &str {
        &self.inner.settings.local_id
    }

    pub fn topics(&self) -> &TopicAddress {
        &self.inner.settings.topics
    }

    pub fn events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to the topics the endpoint needs before any session exists.
    pub async fn start(&self) -> Result<(), EndpointError> {
        if self.role() == Role::Responder {
            let topic = self.topics().device_service();
            self.inner.transport.subscribe(&topic, QoS::AtLeastOnce).await?;
            info!(role = %self.role(), topic = %topic, "waiting for configuration");
        }
        Ok(())
    }

    /// Receive and handle deliveries until the transport fails.
    pub async fn run_inbound(&self) -> Result<(), EndpointError> {
        loop {
            let delivery = self.inner.transport.recv().await?;
            if let Err(e) = self.handle_delivery(delivery).await {
                warn!(role = %self.role(), error = %e, "inbound handling failed");
            }
        }
    }

    /// Process one delivery to completion.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<(), EndpointError> {
        self.inner.handle_delivery(delivery).await
    }

    // ------------------------------------------------------------------
    // Initiator operations
    // ------------------------------------------------------------------

    /// Create a session through the session service and subscribe to its
    /// topics. Any previous session is closed first.
    pub async fn create_session(&self) -> Result<String, EndpointError> {
        self.inner.create_session(false).await
    }

    pub async fn send_offer(&self) -> Result<(), EndpointError> {
        self.inner
            .with_current(|m, s, now| m.offer(s, SIMULATED_OFFER_SDP, now))
            .await
    }

    /// Opaque status document of the current session.
    pub async fn session_status(&self) -> Result<serde_json::Value, EndpointError> {
        let api = self.inner.api.as_ref().ok_or(PreconditionError::NoSessionService)?;
        let session_id = self.current_session_id().await.ok_or(PreconditionError::NoSession)?;
        Ok(api.session_status(&session_id).await?)
    }

    /// Create a session, wait for the peer, then run the offer/candidate
    /// flow. Succeeds only if the session ends up connected.
    pub async fn run_automated(&self) -> Result<String, EndpointError> {
        let mut events = self.events();
        let session_id = self.inner.create_session(true).await?;
        let ready_timeout = self.inner.settings.flow.ready_timeout;

        let ready = async {
            loop {
                if self.inner.peer_ready(&session_id).await {
                    return Ok(());
                }
                if !self.inner.session_open(&session_id).await {
                    return Err(EndpointError::Interrupted);
                }
                match events.recv().await {
                    Ok(EndpointEvent::PeerReady { session_id: sid }) if sid == session_id => return Ok(()),
                    Ok(EndpointEvent::Closed { session_id: sid, .. }) if sid == session_id => {
                        return Err(EndpointError::Interrupted);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(EndpointError::Interrupted),
                    _ => {}
                }
            }
        };
        tokio::time::timeout(ready_timeout, ready)
            .await
            .map_err(|_| EndpointError::Timeout("peer ready"))??;

        Arc::clone(&self.inner).execute_flow(session_id.clone(), None).await?;
        Ok(session_id)
    }

    // ------------------------------------------------------------------
    // Responder operations
    // ------------------------------------------------------------------

    /// Announce readiness. With a session id, adopt that session first
    /// (closing any other); without one, use the current session or start a
    /// manual one.
    pub async fn announce_ready(&self, session_id: Option<String>) -> Result<String, EndpointError> {
        self.inner.announce_ready(session_id).await
    }

    pub async fn send_answer(&self) -> Result<(), EndpointError> {
        self.inner
            .with_current(|m, s, now| m.answer(s, SIMULATED_ANSWER_SDP, now))
            .await
    }

    pub async fn send_connected(&self) -> Result<(), EndpointError> {
        self.inner.with_current(|m, s, now| m.connected(s, now)).await
    }

    // ------------------------------------------------------------------
    // Both roles
    // ------------------------------------------------------------------

    pub async fn send_candidate(&self) -> Result<(), EndpointError> {
        let candidate = match self.role() {
            Role::Initiator => APP_CANDIDATE,
            Role::Responder => DEVICE_CANDIDATE,
        };
        self.inner
            .with_current(|m, s, now| m.candidate(s, candidate, "0", 0, now))
            .await
    }

    /// Send one signaling heartbeat with the next heartbeat sequence.
    pub async fn send_heartbeat(&self) -> Result<(), EndpointError> {
        let mut state = self.inner.state.lock().await;
        let sequence = state.heartbeat_seq + 1;
        let session = state.session.as_mut().ok_or(PreconditionError::NoSession)?;
        let step = self.inner.machine.heartbeat(session, sequence, now_ms())?;
        state.heartbeat_seq = sequence;
        self.inner.apply_step(&mut state, step).await
    }

    /// Send `bye` and close the session.
    pub async fn end_session(&self, reason: &str) -> Result<(), EndpointError> {
        self.inner.with_current(|m, s, now| m.bye(s, reason, now)).await
    }

    pub async fn current_session_id(&self) -> Option<String> {
        self.inner.state.lock().await.session.as_ref().map(|s| s.id.clone())
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock().await;
        let (config, config_source) = match &state.config {
            Some((config, source)) => (Some(config.clone()), Some(*source)),
            None => (None, None),
        };
        Snapshot {
            role: self.role(),
            local_id: self.local_id().to_string(),
            transport_connected: self.inner.transport.is_connected(),
            session: state.session.clone(),
            keepalive_interval_ms: self.inner.keepalive_interval(&state).as_millis() as u64,
            config,
            config_source,
            background_tasks: state.tasks.active(),
        }
    }
}

impl Inner {
    fn emit(&self, event: EndpointEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn keepalive_interval(&self, state: &EndpointState) -> Duration {
        let default = self.settings.keepalive.default_interval;
        match &state.config {
            Some((config, _)) => config.keepalive_interval_or(default),
            None => default,
        }
    }

    async fn session_open(&self, session_id: &str) -> bool {
        let state = self.state.lock().await;
        matches!(&state.session, Some(s) if s.id == session_id && s.is_active())
    }

    async fn peer_ready(&self, session_id: &str) -> bool {
        let state = self.state.lock().await;
        matches!(&state.session, Some(s) if s.id == session_id && s.readiness == Readiness::PeerReady)
    }

    fn session_topics(&self, session_id: &str) -> Result<[String; 2], EndpointError> {
        let topics = &self.settings.topics;
        Ok([
            topics.inbox(self.settings.role, session_id)?,
            topics.p2p_data(session_id)?,
        ])
    }

    async fn subscribe_session(&self, session_id: &str) -> Result<(), EndpointError> {
        for topic in self.session_topics(session_id)? {
            self.transport.subscribe(&topic, QoS::AtLeastOnce).await?;
            debug!(session_id, topic = %topic, "subscribed");
        }
        Ok(())
    }

    async fn unsubscribe_session(&self, session_id: &str) {
        let Ok(topics) = self.session_topics(session_id) else {
            return;
        };
        for topic in topics {
            if let Err(e) = self.transport.unsubscribe(&topic).await {
                debug!(session_id, topic = %topic, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Close whatever session is held before a new one takes its place.
    async fn retire_current(self: &Arc<Self>, state: &mut EndpointState) {
        let Some(mut old) = state.session.take() else {
            return;
        };
        if old.is_active() {
            match self.machine.bye(&mut old, "superseded", now_ms()) {
                Ok(step) => {
                    if let Err(e) = self.publish(&old.id, &step.outbound).await {
                        warn!(session_id = %old.id, error = %e, "bye for superseded session not sent");
                    }
                }
                Err(e) => debug!(session_id = %old.id, error = %e, "no bye for superseded session"),
            }
            self.emit(EndpointEvent::Closed {
                session_id: old.id.clone(),
                reason: Some("superseded".into()),
            });
        }
        state.tasks.cancel();
        state.config = None;
        self.unsubscribe_session(&old.id).await;
    }

    async fn create_session(self: &Arc<Self>, scripted: bool) -> Result<String, EndpointError> {
        if self.settings.role != Role::Initiator {
            return Err(PreconditionError::WrongRole("create_session").into());
        }
        let api = self.api.as_ref().ok_or(PreconditionError::NoSessionService)?;
        let device_id = self.settings.topics.device_id();
        let session_id = api.create_session(device_id).await?;

        let mut state = self.state.lock().await;
        self.retire_current(&mut state).await;

        self.subscribe_session(&session_id).await?;
        let mut session = Session::initiated(
            session_id.clone(),
            self.settings.local_id.clone(),
            Some(device_id.to_string()),
            now_ms(),
        );
        // a scripted run drives the flow itself
        session.auto_flow_started = scripted;
        state.session = Some(session);
        state.heartbeat_seq = 0;

        info!(role = %self.settings.role, session_id = %session_id, device_id, "session created");
        self.emit(EndpointEvent::SessionCreated {
            session_id: session_id.clone(),
        });
        Ok(session_id)
    }

    async fn announce_ready(self: &Arc<Self>, session_id: Option<String>) -> Result<String, EndpointError> {
        if self.settings.role != Role::Responder {
            return Err(PreconditionError::WrongRole("ready").into());
        }
        let mut state = self.state.lock().await;
        let current = state.session.as_ref().filter(|s| s.is_active()).map(|s| s.id.clone());

        let session_id = match (session_id, current) {
            (Some(wanted), Some(current)) if wanted == current => current,
            (None, Some(current)) => current,
            (wanted, _) => {
                let session_id = wanted.unwrap_or_else(|| format!("manual_session_{}", now_ms()));
                self.retire_current(&mut state).await;
                self.subscribe_session(&session_id).await?;
                state.session = Some(Session::adopted(
                    session_id.clone(),
                    self.settings.local_id.clone(),
                    None,
                    now_ms(),
                ));
                state.heartbeat_seq = 0;
                self.emit(EndpointEvent::SessionCreated {
                    session_id: session_id.clone(),
                });
                session_id
            }
        };

        let session = state.session.as_mut().ok_or(PreconditionError::NoSession)?;
        let step = self.machine.ready(session, now_ms())?;
        self.apply_step(&mut state, step).await?;
        Ok(session_id)
    }

    /// Apply a local command to the current session.
    async fn with_current<F>(self: &Arc<Self>, f: F) -> Result<(), EndpointError>
    where
        F: FnOnce(&SignalingMachine, &mut Session, i64) -> Result<Step, PreconditionError>,
    {
        let mut state = self.state.lock().await;
        let session = state.session.as_mut().ok_or(PreconditionError::NoSession)?;
        let step = f(&self.machine, session, now_ms())?;
        self.apply_step(&mut state, step).await
    }

    /// Apply a flow step, but only to the session the flow belongs to.
    async fn with_flow_session<F>(self: &Arc<Self>, session_id: &str, f: F) -> Result<(), EndpointError>
    where
        F: FnOnce(&SignalingMachine, &mut Session, i64) -> Result<Step, PreconditionError>,
    {
        let mut state = self.state.lock().await;
        let session = match state.session.as_mut() {
            Some(s) if s.id == session_id && s.is_active() => s,
            _ => return Err(EndpointError::Interrupted),
        };
        let step = f(&self.machine, session, now_ms())?;
        self.apply_step(&mut state, step).await
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_delivery(self: &Arc<Self>, delivery: Delivery) -> Result<(), EndpointError> {
        let Some(route) = self.settings.topics.parse(&delivery.topic) else {
            debug!(topic = %delivery.topic, "ignoring foreign topic");
            return Ok(());
        };

        let envelope = match decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.drop_delivery(&delivery.topic, ProtocolViolation::Undecodable(e.to_string()));
                return Ok(());
            }
        };
        debug!(
            role = %self.settings.role,
            topic = %delivery.topic,
            cmd = %envelope.cmd,
            kind = ?envelope.kind(),
            msg_id = ?envelope.msg_id,
            "inbound"
        );

        let channel = match (&route, self.settings.role) {
            (Route::Service, Role::Responder) => return self.on_config_push(&delivery.topic, &envelope).await,
            (Route::AppSignal { .. }, Role::Initiator) | (Route::DeviceSignal { .. }, Role::Responder) => {
                Channel::Signal
            }
            (Route::Data { .. }, _) => Channel::Data,
            _ => {
                debug!(topic = %delivery.topic, "not an inbound route for this role");
                return Ok(());
            }
        };

        let mut state = self.state.lock().await;
        let Some(session) = state.session.as_mut() else {
            self.drop_delivery(&delivery.topic, ProtocolViolation::NoSession);
            return Ok(());
        };
        if route.session_id() != Some(session.id.as_str()) {
            let violation = ProtocolViolation::SessionMismatch {
                local: session.id.clone(),
                got: route.session_id().map(str::to_string),
            };
            self.drop_delivery(&delivery.topic, violation);
            return Ok(());
        }

        match self.machine.on_envelope(session, channel, &envelope, now_ms()) {
            Ok(step) => {
                info!(
                    role = %self.settings.role,
                    session_id = %session.id,
                    kind = ?envelope.kind(),
                    readiness = ?session.readiness,
                    connectivity = ?session.connectivity,
                    "applied"
                );
                self.apply_step(&mut state, step).await
            }
            Err(violation) => {
                self.drop_delivery(&delivery.topic, violation);
                Ok(())
            }
        }
    }

    fn drop_delivery(&self, topic: &str, violation: ProtocolViolation) {
        // the broker echoes our own publishes back on shared topics
        if matches!(violation, ProtocolViolation::SelfEcho(_)) {
            debug!(role = %self.settings.role, topic, %violation, "envelope dropped");
        } else {
            warn!(role = %self.settings.role, topic, %violation, "envelope dropped");
        }
        self.emit(EndpointEvent::Dropped {
            topic: topic.to_string(),
            reason: violation.to_string(),
        });
    }

    async fn on_config_push(self: &Arc<Self>, topic: &str, envelope: &Envelope) -> Result<(), EndpointError> {
        let (session, config, step) = match self.machine.adopt(envelope, now_ms()) {
            Ok(adopted) => adopted,
            Err(violation) => {
                self.drop_delivery(topic, violation);
                return Ok(());
            }
        };

        let mut state = self.state.lock().await;
        if matches!(&state.session, Some(s) if s.id == session.id && s.is_active()) {
            debug!(session_id = %session.id, "duplicate configuration push");
            return Ok(());
        }
        self.retire_current(&mut state).await;

        let session_id = session.id.clone();
        self.subscribe_session(&session_id).await?;
        info!(
            session_id = %session_id,
            peer = ?session.peer_id,
            stun = ?config.stun_servers,
            turn = ?config.turn_servers,
            "configuration received"
        );
        state.session = Some(session);
        state.config = Some((config, ConfigSource::Pushed));
        state.heartbeat_seq = 0;
        self.emit(EndpointEvent::SessionCreated {
            session_id: session_id.clone(),
        });
        self.emit(EndpointEvent::ConfigInstalled {
            session_id,
            source: ConfigSource::Pushed,
        });
        self.apply_step(&mut state, step).await
    }

    // ------------------------------------------------------------------
    // Step execution
    // ------------------------------------------------------------------

    async fn publish(&self, session_id: &str, outbound: &[Outbound]) -> Result<(), EndpointError> {
        let topics = &self.settings.topics;
        for out in outbound {
            let topic = match out.channel {
                Channel::Signal => topics.outbox(self.settings.role, session_id)?,
                Channel::Data => topics.p2p_data(session_id)?,
            };
            let payload = encode(&out.envelope)?;
            debug!(
                role = %self.settings.role,
                topic = %topic,
                cmd = %out.envelope.cmd,
                kind = ?out.envelope.kind(),
                msg_id = ?out.envelope.msg_id,
                "outbound"
            );
            self.transport.publish(&topic, payload, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Run the step's effects, then publish its envelopes in order.
    async fn apply_step(self: &Arc<Self>, state: &mut EndpointState, step: Step) -> Result<(), EndpointError> {
        let Some(session_id) = state.session.as_ref().map(|s| s.id.clone()) else {
            return Ok(());
        };

        let mut unsubscribe = false;
        for effect in step.effects {
            match effect {
                Effect::PeerReady => self.emit(EndpointEvent::PeerReady {
                    session_id: session_id.clone(),
                }),
                Effect::Connected => {
                    info!(role = %self.settings.role, session_id = %session_id, "connected");
                    self.emit(EndpointEvent::Connected {
                        session_id: session_id.clone(),
                    });
                }
                Effect::StartKeepalive => self.spawn_keepalive(state, &session_id),
                Effect::StopKeepalive => state.tasks.cancel(),
                Effect::RunAutoFlow => self.spawn_flow(state, &session_id),
                Effect::Closed { reason } => {
                    info!(role = %self.settings.role, session_id = %session_id, reason = ?reason, "session closed");
                    self.emit(EndpointEvent::Closed {
                        session_id: session_id.clone(),
                        reason,
                    });
                    unsubscribe = true;
                }
                Effect::Latency(sample) => {
                    info!(
                        session_id = %session_id,
                        metric = %sample.metric,
                        latency_ms = sample.millis,
                        "latency"
                    );
                    self.emit(EndpointEvent::Latency {
                        session_id: session_id.clone(),
                        sample,
                    });
                }
            }
        }

        let published = self.publish(&session_id, &step.outbound).await;
        if unsubscribe {
            self.unsubscribe_session(&session_id).await;
        }
        published
    }

    fn spawn_keepalive(self: &Arc<Self>, state: &mut EndpointState, session_id: &str) {
        let interval = self.keepalive_interval(state);
        let max_ticks = self.settings.keepalive.max_ticks;
        let target = Arc::downgrade(self);
        let token = state.tasks.token();
        let events = self.events.clone();
        let session_id = session_id.to_string();

        state.tasks.spawn(async move {
            let report = run_keepalive(target, session_id.clone(), interval, max_ticks, token).await;
            if report.exit != KeepaliveExit::EndpointDropped {
                let _ = events.send(EndpointEvent::KeepaliveStopped {
                    session_id,
                    ticks_sent: report.ticks_sent,
                });
            }
        });
    }

    fn spawn_flow(self: &Arc<Self>, state: &mut EndpointState, session_id: &str) {
        let flow = Arc::clone(self).execute_flow(session_id.to_string(), Some(state.tasks.token()));
        let session_id = session_id.to_string();
        state.tasks.spawn(async move {
            if let Err(e) = flow.await {
                warn!(session_id = %session_id, error = %e, "automated flow failed");
            }
        });
    }

    /// Fetch configuration, offer, wait, candidate, wait, then require the
    /// session to be connected.
    fn execute_flow(self: Arc<Self>, session_id: String, cancel: Option<watch::Receiver<bool>>) -> FlowFuture {
        Box::pin(async move {
            let result = self.flow_steps(&session_id, cancel).await;
            self.emit(EndpointEvent::FlowFinished {
                session_id: session_id.clone(),
                connected: result.is_ok(),
            });
            match &result {
                Ok(()) => info!(session_id = %session_id, "automated flow connected"),
                Err(e) => warn!(session_id = %session_id, error = %e, "automated flow ended"),
            }
            result
        })
    }

    async fn flow_steps(
        self: &Arc<Self>,
        session_id: &str,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), EndpointError> {
        let (config, source) = match &self.api {
            Some(api) => fetch_config_or_fallback(api.as_ref(), session_id).await,
            None => (RtcConfig::fallback(), ConfigSource::Fallback),
        };
        {
            let mut state = self.state.lock().await;
            match &state.session {
                Some(s) if s.id == session_id && s.is_active() => {}
                _ => return Err(EndpointError::Interrupted),
            }
            state.config = Some((config, source));
        }
        self.emit(EndpointEvent::ConfigInstalled {
            session_id: session_id.to_string(),
            source,
        });

        self.with_flow_session(session_id, |m, s, now| m.offer(s, SIMULATED_OFFER_SDP, now))
            .await?;
        pause(self.settings.flow.after_offer, cancel.as_mut()).await?;

        self.with_flow_session(session_id, |m, s, now| m.candidate(s, APP_CANDIDATE, "0", 0, now))
            .await?;
        pause(self.settings.flow.after_candidate, cancel.as_mut()).await?;

        let state = self.state.lock().await;
        match &state.session {
            Some(s) if s.id == session_id => match s.connectivity {
                Connectivity::Connected => Ok(()),
                Connectivity::Closed => Err(EndpointError::Interrupted),
                other => Err(EndpointError::NotConnected(other)),
            },
            _ => Err(EndpointError::Interrupted),
        }
    }
}

/// Fixed wait between flow steps; ends early when the session's tasks are
/// cancelled.
async fn pause(duration: Duration, cancel: Option<&mut watch::Receiver<bool>>) -> Result<(), EndpointError> {
    match cancel {
        Some(cancel) => {
            if *cancel.borrow() {
                return Err(EndpointError::Interrupted);
            }
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = cancel.changed() => Err(EndpointError::Interrupted),
            }
        }
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
    }
}

#[async_trait]
impl KeepaliveTarget for Inner {
    async fn tick(&self, session_id: &str, sequence: u64) -> Result<TickOutcome, EndpointError> {
        let mut state = self.state.lock().await;
        let session = match state.session.as_mut() {
            None => return Ok(TickOutcome::Closed),
            Some(s) if s.id != session_id => return Ok(TickOutcome::Replaced),
            Some(s) if s.connectivity.is_closed() => return Ok(TickOutcome::Closed),
            Some(s) if !s.is_connected() => return Ok(TickOutcome::NotConnected),
            Some(s) => s,
        };
        let step = self.machine.keepalive_tick(session, sequence, now_ms())?;
        self.publish(session_id, &step.outbound).await?;
        self.emit(EndpointEvent::KeepaliveSent {
            session_id: session_id.to_string(),
            sequence,
        });
        Ok(TickOutcome::Sent)
    }
}
