//! Output formatting for CLI results
//!
//! Three output formats:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting and automation
//! - Quiet: Minimal output, exit codes only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use p2ps_core::{EndpointEvent, LatencySample, Snapshot};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for scripting
    Json,
    /// Minimal output - exit codes only
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper for consistent schema
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
        }
    }
}

impl JsonResponse<()> {
    pub fn error_with_command(message: &str, command: &str) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
        }
    }
}

/// Result of an automated run, as printed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowReport {
    pub session_id: Option<String>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latencies: Vec<LatencySample>,
    pub endpoints: Vec<Snapshot>,
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Format endpoint snapshots
    pub fn format_snapshots(&self, snapshots: &[Snapshot], command: &str) -> String {
        match self.format {
            OutputFormat::Table => snapshots.iter().map(|s| self.snapshot_table(s)).collect::<Vec<_>>().join("\n"),
            OutputFormat::Json => self.to_json_response(&snapshots, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format the result of an automated run
    pub fn format_flow(&self, report: &FlowReport, command: &str) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Field", "Value"]);
                table.add_row(vec![
                    "Session".to_string(),
                    report.session_id.clone().unwrap_or_else(|| "-".to_string()),
                ]);
                table.add_row(vec!["Connected".to_string(), yes_no(report.connected).to_string()]);
                if let Some(error) = &report.error {
                    table.add_row(vec!["Error".to_string(), error.clone()]);
                }
                let mut out = table.to_string();
                if !report.latencies.is_empty() {
                    out.push('\n');
                    out.push_str(&latency_table(&report.latencies));
                }
                if self.verbose {
                    for snapshot in &report.endpoints {
                        out.push('\n');
                        out.push_str(&self.snapshot_table(snapshot));
                    }
                }
                out
            }
            OutputFormat::Json => self.to_json_response(report, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// One line per endpoint event; JSON prints the event object.
    pub fn format_event(&self, role: &str, event: &EndpointEvent) -> String {
        match self.format {
            OutputFormat::Table => format!("[{role}] {}", describe_event(event)),
            OutputFormat::Json => {
                serde_json::to_string(&serde_json::json!({ "role": role, "event": event })).unwrap_or_default()
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a plain status message
    pub fn format_message(&self, message: &str, command: &str) -> String {
        match self.format {
            OutputFormat::Table => message.to_string(),
            OutputFormat::Json => self.to_json_response(&serde_json::json!({ "message": message }), command),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format an error
    pub fn format_error(&self, message: &str, command: &str) -> String {
        match self.format {
            OutputFormat::Table | OutputFormat::Quiet => format!("Error: {message}"),
            OutputFormat::Json => serde_json::to_string_pretty(&JsonResponse::error_with_command(message, command))
                .unwrap_or_default(),
        }
    }

    fn to_json_response<T: Serialize>(&self, data: &T, command: &str) -> String {
        serde_json::to_string_pretty(&JsonResponse::success_with_command(data, command)).unwrap_or_default()
    }

    fn snapshot_table(&self, snapshot: &Snapshot) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Field", "Value"]);
        table.add_row(vec!["Role".to_string(), snapshot.role.to_string()]);
        table.add_row(vec!["Identity".to_string(), snapshot.local_id.clone()]);
        table.add_row(vec![
            "Transport".to_string(),
            (if snapshot.transport_connected { "connected" } else { "disconnected" }).to_string(),
        ]);

        match &snapshot.session {
            Some(session) => {
                table.add_row(vec!["Session".to_string(), session.id.clone()]);
                table.add_row(vec![
                    "Peer".to_string(),
                    session.peer_id.clone().unwrap_or_else(|| "-".to_string()),
                ]);
                table.add_row(vec!["Readiness".to_string(), format!("{:?}", session.readiness)]);
                table.add_row(vec!["Connectivity".to_string(), format!("{:?}", session.connectivity)]);
                if self.verbose {
                    table.add_row(vec!["Bye sent".to_string(), yes_no(session.bye_sent).to_string()]);
                    if let Some((sequence, at)) = session.timestamps.last_keepalive_sent {
                        table.add_row(vec!["Last keepalive".to_string(), format!("#{sequence} at {at}")]);
                    }
                }
            }
            None => {
                table.add_row(vec!["Session".to_string(), "-".to_string()]);
            }
        }

        if let Some(source) = snapshot.config_source {
            table.add_row(vec!["Config source".to_string(), format!("{source:?}")]);
        }
        if let Some(config) = &snapshot.config {
            table.add_row(vec!["STUN".to_string(), config.stun_servers.join(", ")]);
            table.add_row(vec!["TURN".to_string(), config.turn_servers.join(", ")]);
        }
        table.add_row(vec![
            "Keepalive interval".to_string(),
            format!("{} ms", snapshot.keepalive_interval_ms),
        ]);
        table.add_row(vec!["Background tasks".to_string(), snapshot.background_tasks.to_string()]);
        table.to_string()
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn latency_table(samples: &[LatencySample]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Latency", "ms"]);
    for sample in samples {
        table.add_row(vec![sample.metric.to_string(), sample.millis.to_string()]);
    }
    table.to_string()
}

fn describe_event(event: &EndpointEvent) -> String {
    match event {
        EndpointEvent::SessionCreated { session_id } => format!("session {session_id} created"),
        EndpointEvent::ConfigInstalled { session_id, source } => {
            format!("session {session_id}: configuration installed ({source:?})")
        }
        EndpointEvent::PeerReady { session_id } => format!("session {session_id}: peer ready"),
        EndpointEvent::Connected { session_id } => format!("session {session_id}: connected"),
        EndpointEvent::KeepaliveSent { session_id, sequence } => {
            format!("session {session_id}: keepalive #{sequence}")
        }
        EndpointEvent::KeepaliveStopped { session_id, ticks_sent } => {
            format!("session {session_id}: keepalive stopped after {ticks_sent} ticks")
        }
        EndpointEvent::Latency { session_id, sample } => {
            format!("session {session_id}: {} = {} ms", sample.metric, sample.millis)
        }
        EndpointEvent::Dropped { topic, reason } => format!("dropped on {topic}: {reason}"),
        EndpointEvent::Closed { session_id, reason } => match reason {
            Some(reason) => format!("session {session_id} closed ({reason})"),
            None => format!("session {session_id} closed"),
        },
        EndpointEvent::FlowFinished { session_id, connected } => {
            format!("session {session_id}: automated flow finished, connected: {}", yes_no(*connected))
        }
    }
}
