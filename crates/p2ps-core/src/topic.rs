//! Topic addressing for the signaling broker.
//!
//! Every topic is derived from the product key, the device identifier and,
//! for session-scoped topics, the session identifier:
//!
//! | Purpose | Topic |
//! |---|---|
//! | device config push | `{pk}/{device}/device/service/sub` |
//! | app → device signaling | `{pk}/{device}/device/{session}/p2p/signal/sub` |
//! | device → app signaling | `{pk}/{device}/app/{session}/p2p/signal/sub` |
//! | keepalive data channel | `{pk}/{device}/p2p/{session}/data` |
//!
//! An optional namespace segment may be prepended to all of them.

use thiserror::Error;

use crate::session::Role;

/// Errors produced while building or parsing topics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// A component was empty
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A component contained a level separator or wildcard
    #[error("{field} '{value}' contains a reserved character ('/', '+', '#')")]
    ReservedCharacter { field: &'static str, value: String },
}

/// Which logical channel a topic belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Config push to the device
    Service,
    /// Signaling addressed to the device
    DeviceSignal { session_id: String },
    /// Signaling addressed to the app
    AppSignal { session_id: String },
    /// Shared keepalive data channel
    Data { session_id: String },
}

impl Route {
    /// Session the route is scoped to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Route::Service => None,
            Route::DeviceSignal { session_id }
            | Route::AppSignal { session_id }
            | Route::Data { session_id } => Some(session_id),
        }
    }
}

fn check_component(field: &'static str, value: &str) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(TopicError::Empty(field));
    }
    if value.contains(['/', '+', '#']) {
        return Err(TopicError::ReservedCharacter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Topic builder bound to one product key and device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicAddress {
    namespace: Option<String>,
    product_key: String,
    device_id: String,
}

impl TopicAddress {
    /// Create an address for a product key and device identifier.
    pub fn new(product_key: impl Into<String>, device_id: impl Into<String>) -> Result<Self, TopicError> {
        let product_key = product_key.into();
        let device_id = device_id.into();
        check_component("product key", &product_key)?;
        check_component("device id", &device_id)?;
        Ok(Self {
            namespace: None,
            product_key,
            device_id,
        })
    }

    /// Prepend a namespace segment (e.g. `dl`) to every topic.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Result<Self, TopicError> {
        let namespace = namespace.into();
        check_component("namespace", &namespace)?;
        self.namespace = Some(namespace);
        Ok(self)
    }

    pub fn product_key(&self) -> &str {
        &self.product_key
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn base(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", ns, self.product_key, self.device_id),
            None => format!("{}/{}", self.product_key, self.device_id),
        }
    }

    /// Topic the device listens on for configuration pushes.
    pub fn device_service(&self) -> String {
        format!("{}/device/service/sub", self.base())
    }

    /// Signaling topic the device subscribes to (app → device).
    pub fn device_signal(&self, session_id: &str) -> Result<String, TopicError> {
        check_component("session id", session_id)?;
        Ok(format!("{}/device/{}/p2p/signal/sub", self.base(), session_id))
    }

    /// Signaling topic the app subscribes to (device → app).
    pub fn app_signal(&self, session_id: &str) -> Result<String, TopicError> {
        check_component("session id", session_id)?;
        Ok(format!("{}/app/{}/p2p/signal/sub", self.base(), session_id))
    }

    /// Keepalive data channel shared by both sides.
    pub fn p2p_data(&self, session_id: &str) -> Result<String, TopicError> {
        check_component("session id", session_id)?;
        Ok(format!("{}/p2p/{}/data", self.base(), session_id))
    }

    /// Signaling topic a role receives on.
    pub fn inbox(&self, role: Role, session_id: &str) -> Result<String, TopicError> {
        match role {
            Role::Initiator => self.app_signal(session_id),
            Role::Responder => self.device_signal(session_id),
        }
    }

    /// Signaling topic a role publishes to (the peer's inbox).
    pub fn outbox(&self, role: Role, session_id: &str) -> Result<String, TopicError> {
        self.inbox(role.peer(), session_id)
    }

    /// Classify a topic. Returns `None` for topics of another device.
    pub fn parse(&self, topic: &str) -> Option<Route> {
        let rest = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        let levels: Vec<&str> = rest.split('/').collect();
        match levels.as_slice() {
            ["device", "service", "sub"] => Some(Route::Service),
            ["device", sid, "p2p", "signal", "sub"] if !sid.is_empty() => Some(Route::DeviceSignal {
                session_id: sid.to_string(),
            }),
            ["app", sid, "p2p", "signal", "sub"] if !sid.is_empty() => Some(Route::AppSignal {
                session_id: sid.to_string(),
            }),
            ["p2p", sid, "data"] if !sid.is_empty() => Some(Route::Data {
                session_id: sid.to_string(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr() -> TopicAddress {
        TopicAddress::new("PLAF204", "AF070135F064641AG").unwrap()
    }

    #[test]
    fn test_canonical_forms() {
        let a = addr();
        assert_eq!(a.device_service(), "PLAF204/AF070135F064641AG/device/service/sub");
        assert_eq!(
            a.device_signal("s1").unwrap(),
            "PLAF204/AF070135F064641AG/device/s1/p2p/signal/sub"
        );
        assert_eq!(
            a.app_signal("s1").unwrap(),
            "PLAF204/AF070135F064641AG/app/s1/p2p/signal/sub"
        );
        assert_eq!(a.p2p_data("s1").unwrap(), "PLAF204/AF070135F064641AG/p2p/s1/data");
    }

    #[test]
    fn test_namespace_prefix() {
        let a = addr().with_namespace("dl").unwrap();
        assert_eq!(a.device_service(), "dl/PLAF204/AF070135F064641AG/device/service/sub");
        assert_eq!(a.parse(&a.p2p_data("abc").unwrap()), Some(Route::Data { session_id: "abc".into() }));
    }

    #[test]
    fn test_inbox_outbox_are_mirrored() {
        let a = addr();
        assert_eq!(a.outbox(Role::Initiator, "s").unwrap(), a.inbox(Role::Responder, "s").unwrap());
        assert_eq!(a.outbox(Role::Responder, "s").unwrap(), a.inbox(Role::Initiator, "s").unwrap());
    }

    #[test]
    fn test_rejects_reserved_characters() {
        assert!(matches!(
            TopicAddress::new("pk", "dev/1"),
            Err(TopicError::ReservedCharacter { .. })
        ));
        assert!(matches!(TopicAddress::new("", "dev"), Err(TopicError::Empty(_))));
        assert!(addr().device_signal("a+b").is_err());
        assert!(addr().p2p_data("#").is_err());
        assert!(addr().app_signal("").is_err());
    }

    #[test]
    fn test_parse_foreign_device_is_none() {
        let other = TopicAddress::new("PLAF204", "OTHER").unwrap();
        assert_eq!(addr().parse(&other.device_service()), None);
        assert_eq!(addr().parse("PLAF204/AF070135F064641AG/device/service"), None);
    }

    proptest! {
        #[test]
        fn prop_topics_are_injective(
            d1 in "[A-Za-z0-9_-]{1,12}",
            s1 in "[A-Za-z0-9_-]{1,12}",
            d2 in "[A-Za-z0-9_-]{1,12}",
            s2 in "[A-Za-z0-9_-]{1,12}",
        ) {
            prop_assume!((&d1, &s1) != (&d2, &s2));
            let a = TopicAddress::new("pk", d1).unwrap();
            let b = TopicAddress::new("pk", d2).unwrap();
            prop_assert_ne!(a.device_signal(&s1).unwrap(), b.device_signal(&s2).unwrap());
            prop_assert_ne!(a.app_signal(&s1).unwrap(), b.app_signal(&s2).unwrap());
            prop_assert_ne!(a.p2p_data(&s1).unwrap(), b.p2p_data(&s2).unwrap());
        }

        #[test]
        fn prop_parse_recovers_session(sid in "[A-Za-z0-9_-]{1,24}") {
            let a = addr();
            prop_assert_eq!(
                a.parse(&a.device_signal(&sid).unwrap()),
                Some(Route::DeviceSignal { session_id: sid.clone() })
            );
            prop_assert_eq!(
                a.parse(&a.app_signal(&sid).unwrap()),
                Some(Route::AppSignal { session_id: sid.clone() })
            );
        }
    }
}
