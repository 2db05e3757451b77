//! In-process stand-ins for the cloud side.
//!
//! The real deployment has a session service that, besides answering HTTP,
//! pushes each new session's configuration to the device over the broker.
//! [`LocalSessionService`] plays that whole role in-process;
//! [`RelayedApi`] adds only the push to another [`SessionApi`] (for example
//! the HTTP client). [`LocalPair`] wires an app and a device endpoint over a
//! [`MemoryBroker`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{fetch_config_or_fallback, ApiError, SessionApi};
use crate::envelope::{encode, Command, Envelope, Payload};
use crate::errors::EndpointError;
use crate::orchestrator::{Endpoint, EndpointSettings};
use crate::rtc_config::RtcConfig;
use crate::topic::TopicAddress;
use p2ps_transport::{MemoryBroker, PubSubTransport, QoS};

/// Delay before a configuration push, so the app has subscribed first.
pub const DEFAULT_PUSH_DELAY: Duration = Duration::from_millis(100);

/// Publishes configuration pushes on the device's service topic.
#[derive(Clone)]
pub struct ConfigPusher {
    transport: Arc<dyn PubSubTransport>,
    topics: TopicAddress,
    member_id: String,
    delay: Duration,
}

impl ConfigPusher {
    pub fn new(transport: Arc<dyn PubSubTransport>, topics: TopicAddress, member_id: impl Into<String>) -> Self {
        Self {
            transport,
            topics,
            member_id: member_id.into(),
            delay: DEFAULT_PUSH_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn envelope(&self, session_id: &str, config: &RtcConfig) -> Envelope {
        let mut data = Payload {
            session_id: Some(session_id.to_string()),
            member_id: Some(self.member_id.as_str().into()),
            ..Default::default()
        };
        config.fill_payload(&mut data);
        let now = chrono::Utc::now().timestamp_millis();
        Envelope::new(Command::ConfigService, now, format!("config_{now}"), data)
    }

    /// Publish the push now.
    pub async fn push(&self, session_id: &str, config: &RtcConfig) -> Result<(), EndpointError> {
        let topic = self.topics.device_service();
        let payload = encode(&self.envelope(session_id, config))?;
        self.transport.publish(&topic, payload, QoS::AtLeastOnce).await?;
        info!(session_id, topic = %topic, "configuration pushed");
        Ok(())
    }

    /// Publish the push after the configured delay.
    pub fn push_later(&self, session_id: String, config: RtcConfig) {
        let pusher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(pusher.delay).await;
            if let Err(e) = pusher.push(&session_id, &config).await {
                warn!(session_id = %session_id, error = %e, "configuration push failed");
            }
        });
    }
}

// ============================================================================
// Local session service
// ============================================================================

struct SessionRecord {
    device_id: String,
    created_at: i64,
}

/// Session service kept in memory. Every session gets the same
/// configuration. A device holds one session at a time; creating another
/// forgets the previous one.
pub struct LocalSessionService {
    pusher: ConfigPusher,
    config: RtcConfig,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    next_id: AtomicU64,
}

impl LocalSessionService {
    pub fn new(pusher: ConfigPusher) -> Self {
        Self {
            pusher,
            config: RtcConfig::fallback(),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_config(mut self, config: RtcConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl SessionApi for LocalSessionService {
    async fn create_session(&self, device_id: &str) -> Result<String, ApiError> {
        let now = chrono::Utc::now().timestamp_millis();
        let session_id = format!("session_{}_{}", now, self.next_id.fetch_add(1, Ordering::Relaxed));
        let replaced = {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|_, record| record.device_id != device_id);
            let replaced = before - sessions.len();
            sessions.insert(
                session_id.clone(),
                SessionRecord {
                    device_id: device_id.to_string(),
                    created_at: now,
                },
            );
            replaced
        };
        debug!(session_id = %session_id, device_id, replaced, "local session created");
        self.pusher.push_later(session_id.clone(), self.config.clone());
        Ok(session_id)
    }

    async fn session_status(&self, session_id: &str) -> Result<serde_json::Value, ApiError> {
        let sessions = self.sessions.lock();
        let record = sessions
            .get(session_id)
            .ok_or_else(|| ApiError::NotFound(session_id.to_string()))?;
        Ok(json!({
            "sessionId": session_id,
            "deviceId": record.device_id,
            "status": "active",
            "createdAt": record.created_at,
        }))
    }

    async fn session_config(&self, session_id: &str) -> Result<RtcConfig, ApiError> {
        if !self.sessions.lock().contains_key(session_id) {
            return Err(ApiError::NotFound(session_id.to_string()));
        }
        Ok(self.config.clone())
    }
}

// ============================================================================
// Relayed API
// ============================================================================

/// Another session service plus the configuration push it does not do
/// itself.
pub struct RelayedApi {
    inner: Arc<dyn SessionApi>,
    pusher: ConfigPusher,
}

impl RelayedApi {
    pub fn new(inner: Arc<dyn SessionApi>, pusher: ConfigPusher) -> Self {
        Self { inner, pusher }
    }
}

#[async_trait]
impl SessionApi for RelayedApi {
    async fn create_session(&self, device_id: &str) -> Result<String, ApiError> {
        let session_id = self.inner.create_session(device_id).await?;
        let (config, _) = fetch_config_or_fallback(self.inner.as_ref(), &session_id).await;
        self.pusher.push_later(session_id.clone(), config);
        Ok(session_id)
    }

    async fn session_status(&self, session_id: &str) -> Result<serde_json::Value, ApiError> {
        self.inner.session_status(session_id).await
    }

    async fn session_config(&self, session_id: &str) -> Result<RtcConfig, ApiError> {
        self.inner.session_config(session_id).await
    }
}

// ============================================================================
// Local pair
// ============================================================================

/// App and device endpoints wired over one in-memory broker, with their
/// inbound loops running.
pub struct LocalPair {
    pub broker: MemoryBroker,
    pub app: Endpoint,
    pub device: Endpoint,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalPair {
    /// Start both sides. `api` defaults to a [`LocalSessionService`].
    pub async fn start(
        app_settings: EndpointSettings,
        device_settings: EndpointSettings,
        api: Option<Arc<dyn SessionApi>>,
    ) -> Result<Self, EndpointError> {
        let broker = MemoryBroker::new();
        let pusher = ConfigPusher::new(
            Arc::new(broker.client("session-service")),
            app_settings.topics.clone(),
            app_settings.local_id.clone(),
        );
        let api: Arc<dyn SessionApi> = match api {
            Some(inner) => Arc::new(RelayedApi::new(inner, pusher)),
            None => Arc::new(LocalSessionService::new(pusher)),
        };

        let app = Endpoint::new(
            app_settings,
            Arc::new(broker.client("app")),
            Some(api),
        );
        let device = Endpoint::new(device_settings, Arc::new(broker.client("device")), None);
        app.start().await?;
        device.start().await?;

        let tasks = [app.clone(), device.clone()]
            .into_iter()
            .map(|endpoint| {
                tokio::spawn(async move {
                    if let Err(e) = endpoint.run_inbound().await {
                        debug!(role = %endpoint.role(), error = %e, "inbound loop ended");
                    }
                })
            })
            .collect();

        Ok(Self {
            broker,
            app,
            device,
            tasks,
        })
    }
}

impl Drop for LocalPair {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::decode;
    use p2ps_transport::MockTransport;

    fn topics() -> TopicAddress {
        TopicAddress::new("PLAF204", "DEV1").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_service_pushes_config_after_delay() {
        let transport = Arc::new(MockTransport::new());
        let service = LocalSessionService::new(ConfigPusher::new(transport.clone(), topics(), "APP1"));

        let session_id = service.create_session("DEV1").await.unwrap();
        assert!(transport.get_published().is_empty());

        tokio::time::sleep(DEFAULT_PUSH_DELAY * 2).await;
        let published = transport.get_published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, topics().device_service());

        let push = decode(&published[0].1).unwrap();
        assert_eq!(push.cmd, Command::ConfigService);
        assert_eq!(push.session_id(), Some(session_id.as_str()));
        assert_eq!(push.data.member_id.as_deref(), Some("APP1"));
        assert_eq!(RtcConfig::from_payload(&push.data), RtcConfig::fallback());
    }

    #[tokio::test]
    async fn test_local_service_status_and_config() {
        let service = LocalSessionService::new(ConfigPusher::new(Arc::new(MockTransport::new()), topics(), "APP1"));
        let sid = service.create_session("DEV1").await.unwrap();
        assert_eq!(service.session_count(), 1);

        let status = service.session_status(&sid).await.unwrap();
        assert_eq!(status["deviceId"], "DEV1");
        assert!(service.session_config(&sid).await.unwrap().is_usable());
        assert_eq!(
            service.session_config("nope").await,
            Err(ApiError::NotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_session_ids_are_distinct() {
        let service = LocalSessionService::new(ConfigPusher::new(Arc::new(MockTransport::new()), topics(), "APP1"));
        let a = service.create_session("DEV1").await.unwrap();
        let b = service.create_session("DEV1").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_new_session_replaces_device_record() {
        let service = LocalSessionService::new(ConfigPusher::new(Arc::new(MockTransport::new()), topics(), "APP1"));
        let first = service.create_session("DEV1").await.unwrap();
        let other = service.create_session("DEV2").await.unwrap();
        for _ in 0..5 {
            service.create_session("DEV1").await.unwrap();
        }
        assert_eq!(service.session_count(), 2);
        assert_eq!(
            service.session_status(&first).await,
            Err(ApiError::NotFound(first.clone()))
        );
        assert!(service.session_status(&other).await.is_ok());
    }
}
