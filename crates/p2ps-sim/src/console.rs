//! Interactive consoles for the app and device sides.

use std::str::FromStr;

use p2ps_core::{Endpoint, EndpointError, Snapshot};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::output::OutputFormatter;
use crate::ExitCode;

pub const APP_MENU: &str = "\
1. Create session
2. Query session status
3. Send offer
4. Send ICE candidate
5. Send heartbeat
6. End session
7. Automated flow
0. Quit";

pub const DEVICE_HELP: &str = "\
status           show the current session
ready [session]  announce readiness (adopts the session if given)
answer           send an answer
candidate        send an ICE candidate
connected        announce the connection
bye              end the session
quit             exit";

/// App menu choices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppCommand {
    CreateSession,
    Status,
    Offer,
    Candidate,
    Heartbeat,
    EndSession,
    Automated,
    Quit,
}

impl FromStr for AppCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(Self::CreateSession),
            "2" => Ok(Self::Status),
            "3" => Ok(Self::Offer),
            "4" => Ok(Self::Candidate),
            "5" => Ok(Self::Heartbeat),
            "6" => Ok(Self::EndSession),
            "7" => Ok(Self::Automated),
            "0" => Ok(Self::Quit),
            other => Err(format!("unknown choice '{other}'")),
        }
    }
}

/// Device console commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCommand {
    Status,
    Ready(Option<String>),
    Answer,
    Candidate,
    Connected,
    Bye,
    Help,
    Quit,
}

impl FromStr for DeviceCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = words.next().unwrap_or("help").to_lowercase();
        let arg = words.next().map(str::to_string);
        if words.next().is_some() {
            return Err(format!("too many arguments: '{}'", s.trim()));
        }
        match (command.as_str(), arg) {
            ("status", None) => Ok(Self::Status),
            ("ready", session) => Ok(Self::Ready(session)),
            ("answer", None) => Ok(Self::Answer),
            ("candidate", None) => Ok(Self::Candidate),
            ("connected", None) => Ok(Self::Connected),
            ("bye", None) => Ok(Self::Bye),
            ("help", None) => Ok(Self::Help),
            ("quit" | "exit", None) => Ok(Self::Quit),
            (other, _) => Err(format!("unknown command '{other}'")),
        }
    }
}

/// What a command produced.
#[derive(Debug)]
pub enum Reply {
    Message(String),
    Snapshot(Box<Snapshot>),
}

pub async fn apply_app(app: &Endpoint, command: AppCommand) -> Result<Reply, EndpointError> {
    let message = match command {
        AppCommand::CreateSession => format!("session {} created", app.create_session().await?),
        AppCommand::Status => {
            let status = app.session_status().await?;
            serde_json::to_string_pretty(&status).unwrap_or_else(|_| status.to_string())
        }
        AppCommand::Offer => {
            app.send_offer().await?;
            "offer sent".to_string()
        }
        AppCommand::Candidate => {
            app.send_candidate().await?;
            "candidate sent".to_string()
        }
        AppCommand::Heartbeat => {
            app.send_heartbeat().await?;
            "heartbeat sent".to_string()
        }
        AppCommand::EndSession => {
            app.end_session("user ended session").await?;
            "session ended".to_string()
        }
        AppCommand::Automated => format!("session {} connected", app.run_automated().await?),
        AppCommand::Quit => return Ok(Reply::Message(String::new())),
    };
    Ok(Reply::Message(message))
}

pub async fn apply_device(device: &Endpoint, command: DeviceCommand) -> Result<Reply, EndpointError> {
    let message = match command {
        DeviceCommand::Status => return Ok(Reply::Snapshot(Box::new(device.snapshot().await))),
        DeviceCommand::Ready(session_id) => format!("ready sent for {}", device.announce_ready(session_id).await?),
        DeviceCommand::Answer => {
            device.send_answer().await?;
            "answer sent".to_string()
        }
        DeviceCommand::Candidate => {
            device.send_candidate().await?;
            "candidate sent".to_string()
        }
        DeviceCommand::Connected => {
            device.send_connected().await?;
            "connected sent".to_string()
        }
        DeviceCommand::Bye => {
            device.end_session("device ended session").await?;
            "session ended".to_string()
        }
        DeviceCommand::Help => DEVICE_HELP.to_string(),
        DeviceCommand::Quit => String::new(),
    };
    Ok(Reply::Message(message))
}

fn print_reply(out: &OutputFormatter, result: Result<Reply, EndpointError>, command: &str) {
    let text = match result {
        Ok(Reply::Message(message)) => out.format_message(&message, command),
        Ok(Reply::Snapshot(snapshot)) => out.format_snapshots(std::slice::from_ref(&*snapshot), command),
        Err(e) => out.format_error(&e.to_string(), command),
    };
    if !text.is_empty() {
        println!("{text}");
    }
}

/// Read menu choices until `0` or end of input.
pub async fn run_app_console<R>(app: &Endpoint, input: R, out: &OutputFormatter) -> anyhow::Result<ExitCode>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        if !out.is_quiet() {
            println!("{APP_MENU}");
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<AppCommand>() {
            Ok(AppCommand::Quit) => break,
            Ok(command) => print_reply(out, apply_app(app, command).await, "app"),
            Err(e) => println!("{}", out.format_error(&e, "app")),
        }
    }
    Ok(ExitCode::Success)
}

/// Read device commands until `quit` or end of input.
pub async fn run_device_console<R>(device: &Endpoint, input: R, out: &OutputFormatter) -> anyhow::Result<ExitCode>
where
    R: AsyncBufRead + Unpin,
{
    if !out.is_quiet() {
        println!("{DEVICE_HELP}");
    }
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<DeviceCommand>() {
            Ok(DeviceCommand::Quit) => break,
            Ok(command) => print_reply(out, apply_device(device, command).await, "device"),
            Err(e) => println!("{}", out.format_error(&e, "device")),
        }
    }
    Ok(ExitCode::Success)
}
