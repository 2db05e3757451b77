//! Signaling envelope and its JSON codec.
//!
//! Wire shape:
//!
//! ```json
//! {
//!   "cmd": "WEB_RTC",
//!   "ts": 1718000000000,
//!   "msgId": "offer_1718000000000_3",
//!   "data": { "type": "offer", "sessionId": "...", "from": "...", "to": "...", "sdp": "..." }
//! }
//! ```
//!
//! Command tags and message types are closed enums with an `Unrecognized`
//! variant so that unknown values survive decoding and can be rejected by the
//! state machine instead of failing the whole envelope.

use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Envelope codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload was empty
    #[error("empty payload")]
    Empty,

    /// Payload was not a valid envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ============================================================================
// Command tag
// ============================================================================

/// Top-level command tag (`cmd`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    /// Signaling message on a session's signal topic
    Signal,
    /// Keepalive on the data channel
    KeepaliveData,
    /// Answer to a data-channel keepalive
    KeepaliveDataResponse,
    /// Configuration pushed to the device by the session service
    ConfigService,
    /// Any other tag
    Unrecognized(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Signal => "WEB_RTC",
            Command::KeepaliveData => "P2P_KEEPALIVE",
            Command::KeepaliveDataResponse => "P2P_KEEPALIVE_RESPONSE",
            Command::ConfigService => "P2P_SIGNAL_CONFIG_SERVICE",
            Command::Unrecognized(s) => s,
        }
    }
}

impl From<String> for Command {
    fn from(s: String) -> Self {
        match s.as_str() {
            "WEB_RTC" => Command::Signal,
            "P2P_KEEPALIVE" => Command::KeepaliveData,
            "P2P_KEEPALIVE_RESPONSE" => Command::KeepaliveDataResponse,
            "P2P_SIGNAL_CONFIG_SERVICE" => Command::ConfigService,
            _ => Command::Unrecognized(s),
        }
    }
}

impl From<Command> for String {
    fn from(c: Command) -> Self {
        match c {
            Command::Unrecognized(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message type
// ============================================================================

/// Signaling message type (`data.type`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalKind {
    Ready,
    Offer,
    Answer,
    Candidate,
    Connected,
    Bye,
    Keepalive,
    KeepaliveResponse,
    Unrecognized(String),
}

impl SignalKind {
    pub fn as_str(&self) -> &str {
        match self {
            SignalKind::Ready => "ready",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Connected => "connected",
            SignalKind::Bye => "bye",
            SignalKind::Keepalive => "keepalive",
            SignalKind::KeepaliveResponse => "keepalive_response",
            SignalKind::Unrecognized(s) => s,
        }
    }
}

impl From<String> for SignalKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ready" => SignalKind::Ready,
            "offer" => SignalKind::Offer,
            "answer" => SignalKind::Answer,
            "candidate" => SignalKind::Candidate,
            "connected" => SignalKind::Connected,
            "bye" => SignalKind::Bye,
            "keepalive" => SignalKind::Keepalive,
            "keepalive_response" => SignalKind::KeepaliveResponse,
            _ => SignalKind::Unrecognized(s),
        }
    }
}

impl From<SignalKind> for String {
    fn from(k: SignalKind) -> Self {
        match k {
            SignalKind::Unrecognized(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel tag carried by keepalive traffic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChannelTag {
    /// Data channel
    Data,
    /// Signaling channel
    Signal,
    /// Any other tag
    Unrecognized(String),
}

impl ChannelTag {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelTag::Data => "P2P",
            ChannelTag::Signal => "MQTT",
            ChannelTag::Unrecognized(s) => s,
        }
    }
}

impl From<String> for ChannelTag {
    fn from(s: String) -> Self {
        match s.as_str() {
            "P2P" => ChannelTag::Data,
            "MQTT" => ChannelTag::Signal,
            _ => ChannelTag::Unrecognized(s),
        }
    }
}

impl From<ChannelTag> for String {
    fn from(c: ChannelTag) -> Self {
        match c {
            ChannelTag::Unrecognized(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Wire identifiers
// ============================================================================

/// Identity or message id as it travelled: some deployments send the app
/// identity and `msgId` as integers. Re-encodes in the form it arrived in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WireId {
    text: String,
    numeric: bool,
}

impl WireId {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the value was an integer on the wire.
    pub fn is_numeric(&self) -> bool {
        self.numeric
    }
}

impl Deref for WireId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl From<String> for WireId {
    fn from(text: String) -> Self {
        Self { text, numeric: false }
    }
}

impl From<&str> for WireId {
    fn from(text: &str) -> Self {
        Self::from(text.to_string())
    }
}

impl From<u64> for WireId {
    fn from(n: u64) -> Self {
        Self {
            text: n.to_string(),
            numeric: true,
        }
    }
}

impl From<i64> for WireId {
    fn from(n: i64) -> Self {
        Self {
            text: n.to_string(),
            numeric: true,
        }
    }
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for WireId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.numeric {
            if let Ok(n) = self.text.parse::<u64>() {
                return serializer.serialize_u64(n);
            }
            if let Ok(n) = self.text.parse::<i64>() {
                return serializer.serialize_i64(n);
            }
        }
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for WireId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StrOrNum {
            Str(String),
            Uint(u64),
            Int(i64),
        }

        Ok(match StrOrNum::deserialize(deserializer)? {
            StrOrNum::Str(s) => WireId::from(s),
            StrOrNum::Uint(n) => WireId::from(n),
            StrOrNum::Int(n) => WireId::from(n),
        })
    }
}

// ============================================================================
// Payload / Envelope
// ============================================================================

/// Nested payload (`data`). Every field is optional on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SignalKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<WireId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<WireId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<WireId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stun_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtc_configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_config: Option<String>,
}

impl Payload {
    /// Payload for a signaling message between two identities.
    pub fn signal(
        kind: SignalKind,
        session_id: impl Into<String>,
        from: impl Into<String>,
        to: Option<String>,
    ) -> Self {
        Self {
            kind: Some(kind),
            session_id: Some(session_id.into()),
            from: Some(WireId::from(Into::<String>::into(from))),
            to: to.map(WireId::from),
            ..Default::default()
        }
    }

    pub fn with_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.sdp = Some(sdp.into());
        self
    }

    pub fn with_candidate(mut self, candidate: impl Into<String>, sdp_mid: impl Into<String>, m_line_index: u32) -> Self {
        self.candidate = Some(candidate.into());
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_m_line_index = Some(m_line_index);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_sequence(mut self, sequence: u64, channel: ChannelTag) -> Self {
        self.sequence = Some(sequence);
        self.channel = Some(channel);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// One signaling message unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: Command,
    /// Send time, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    /// Correlation id for logs; never used for deduplication
    #[serde(rename = "msgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<WireId>,
    #[serde(default)]
    pub data: Payload,
}

impl Envelope {
    pub fn new(cmd: Command, ts: i64, msg_id: impl Into<String>, data: Payload) -> Self {
        Self {
            cmd,
            ts: Some(ts),
            msg_id: Some(WireId::from(Into::<String>::into(msg_id))),
            data,
        }
    }

    /// Send timestamp, when the sender supplied a usable one.
    pub fn sent_at(&self) -> Option<i64> {
        self.ts.filter(|ts| *ts > 0)
    }

    pub fn kind(&self) -> Option<&SignalKind> {
        self.data.kind.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.data.session_id.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.data.from.as_deref()
    }
}

/// Serialize an envelope to UTF-8 JSON bytes.
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Parse an envelope from UTF-8 JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(CodecError::Empty);
    }
    Ok(serde_json::from_slice(bytes)?)
}
