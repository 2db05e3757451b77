//! P2P signaling core.
//!
//! This crate implements:
//! - Topic addressing for the per-device and per-session channels
//! - The JSON envelope codec
//! - Initiator ("app") and responder ("device") state machines
//! - Keepalive scheduling with a per-session task group
//! - The endpoint orchestrator that ties them to a transport and the
//!   session service
//! - In-process stand-ins for the cloud side

#![forbid(unsafe_code)]

// Wire format
pub mod envelope;
pub mod topic;

// State machines
pub mod machine;
pub mod session;

// Services
pub mod api;
pub mod keepalive;
pub mod orchestrator;
pub mod rtc_config;

// Supporting modules
pub mod errors;
pub mod harness;

pub use api::{ApiCredentials, ApiError, SessionApi};
#[cfg(feature = "http-api")]
pub use api::HttpSessionApi;
pub use envelope::{decode, encode, ChannelTag, CodecError, Command, Envelope, Payload, SignalKind, WireId};
pub use errors::{EndpointError, PreconditionError, ProtocolViolation};
pub use keepalive::{KeepaliveExit, KeepaliveReport, KeepaliveSettings};
pub use machine::{Channel, Effect, LatencyMetric, LatencySample, SignalingMachine, Step};
pub use orchestrator::{Endpoint, EndpointEvent, EndpointSettings, FlowSettings, Snapshot};
pub use rtc_config::{ConfigSource, RtcConfig};
pub use session::{Connectivity, Readiness, Role, Session};
pub use topic::{Route, TopicAddress, TopicError};
