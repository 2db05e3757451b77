//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tracing::debug;

use crate::config::Config;
use crate::console::{run_app_console, run_device_console};
use crate::output::{OutputFormat, OutputFormatter};
use crate::runtime::Runtime;
use crate::ExitCode;

/// P2P signaling simulator - app and device over an in-process broker
#[derive(Parser, Debug)]
#[command(name = "p2ps-sim")]
#[command(version, about = "P2P signaling simulator - app and device over an in-process broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (envelope-level tracing)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Session service base URL (default: in-process service)
    #[arg(long, env = "P2PS_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Device identifier
    #[arg(long, global = true)]
    pub device_id: Option<String>,

    /// App identifier
    #[arg(long, global = true)]
    pub app_id: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive the app side from a menu; the device answers on its own
    App,
    /// Drive the device side from a command prompt
    Device,
    /// Run the automated flow once
    Auto(AutoArgs),
    /// Run the automated flow, keep the session up through keepalive, then
    /// end it and print both sides
    Demo,
    /// Print a sample configuration file, or write it
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct AutoArgs {
    /// Keep the session up this many seconds after connecting, then end it
    #[arg(long)]
    pub hold: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Write the defaults to the config path instead of printing a sample
    #[arg(long)]
    pub init: bool,
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        if let Err(e) = config.validate() {
            eprintln!("Error: {e}");
            return Ok(ExitCode::InvalidInput);
        }
        let format = config.output.format.parse().unwrap_or(self.output);
        let out = Arc::new(OutputFormatter::new(format, config.output.verbose));

        match self.command {
            Commands::App => {
                let mut runtime = Runtime::start(&config).await?;
                runtime.print_events(Arc::clone(&out));
                let stdin = BufReader::new(tokio::io::stdin());
                run_app_console(runtime.app(), stdin, &out).await
            }
            Commands::Device => {
                let mut runtime = Runtime::start(&config).await?;
                runtime.print_events(Arc::clone(&out));
                let stdin = BufReader::new(tokio::io::stdin());
                run_device_console(runtime.device(), stdin, &out).await
            }
            Commands::Auto(args) => {
                let mut runtime = Runtime::start(&config).await?;
                if out.is_verbose() {
                    runtime.print_events(Arc::clone(&out));
                }
                run_once(&runtime, args.hold.map(Duration::from_secs), &out, "auto").await
            }
            Commands::Demo => {
                let mut runtime = Runtime::start(&config).await?;
                runtime.print_events(Arc::clone(&out));
                // long enough for the whole keepalive budget
                run_once(&runtime, Some(Duration::MAX), &out, "demo").await
            }
            Commands::Config(args) => write_config(self.config, args.init),
        }
    }
}

async fn run_once(
    runtime: &Runtime,
    hold: Option<Duration>,
    out: &OutputFormatter,
    command: &str,
) -> anyhow::Result<ExitCode> {
    let (report, result) = tokio::select! {
        outcome = runtime.run_flow(hold) => outcome,
        _ = tokio::signal::ctrl_c() => {
            if let Err(e) = runtime.app().end_session("interrupted").await {
                debug!(error = %e, "no session to end");
            }
            eprintln!("Interrupted");
            return Ok(ExitCode::GeneralError);
        }
    };
    let text = out.format_flow(&report, command);
    if !text.is_empty() {
        println!("{text}");
    }
    Ok(match result {
        Ok(()) => ExitCode::Success,
        Err(e) => ExitCode::from_error(&e),
    })
}

fn write_config(path: Option<PathBuf>, init: bool) -> anyhow::Result<ExitCode> {
    if !init {
        print!("{}", Config::sample_toml());
        return Ok(ExitCode::Success);
    }
    let Some(path) = path.or_else(Config::default_path) else {
        eprintln!("Error: no configuration directory on this platform");
        return Ok(ExitCode::GeneralError);
    };
    if path.exists() {
        println!("{} already exists", path.display());
        return Ok(ExitCode::Success);
    }
    Config::default().save(&path)?;
    println!("wrote {}", path.display());
    Ok(ExitCode::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_auto_with_globals() {
        let cli = Cli::try_parse_from([
            "p2ps-sim",
            "auto",
            "--hold",
            "5",
            "--output",
            "json",
            "--api-url",
            "http://localhost:8080",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.api_url.as_deref(), Some("http://localhost:8080"));
        assert!(matches!(cli.command, Commands::Auto(AutoArgs { hold: Some(5) })));
    }

    #[test]
    fn test_parse_rejects_bad_output() {
        assert!(Cli::try_parse_from(["p2ps-sim", "demo", "--output", "xml"]).is_err());
    }

    #[test]
    fn test_config_init_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sim.toml");
        assert_eq!(write_config(Some(path.clone()), true).unwrap(), ExitCode::Success);
        assert!(Config::load(&path).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_is_invalid_input() {
        let cli = Cli::try_parse_from(["p2ps-sim", "auto"]).unwrap();
        let mut config = Config::default();
        config.endpoint.device_id = "a/b".into();
        assert_eq!(cli.execute_with_config(config).await.unwrap(), ExitCode::InvalidInput);
    }
}
