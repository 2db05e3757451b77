//! Property-based tests for p2ps-sim
//!
//! These tests verify correctness properties using proptest.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::config::{CliOverrides, Config};
    use crate::console::{AppCommand, DeviceCommand};
    use crate::output::{OutputFormat, OutputFormatter};

    // Config overrides: command-line values always win over the file, and
    // absent overrides leave the file untouched.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_overrides_take_precedence(
            device_id in proptest::option::of("[A-Z0-9]{4,16}"),
            app_id in proptest::option::of("[a-z0-9_]{4,16}"),
            api_url in proptest::option::of("https://[a-z]{3,10}\\.example"),
            verbose in proptest::option::of(any::<bool>()),
        ) {
            let base = Config::default();
            let overrides = CliOverrides {
                output_format: None,
                verbose,
                debug: None,
                api_url: api_url.clone(),
                device_id: device_id.clone(),
                app_id: app_id.clone(),
            };
            let config = base.clone().with_overrides(&overrides);

            prop_assert_eq!(&config.endpoint.device_id, device_id.as_ref().unwrap_or(&base.endpoint.device_id));
            prop_assert_eq!(&config.endpoint.app_id, app_id.as_ref().unwrap_or(&base.endpoint.app_id));
            prop_assert_eq!(&config.api.base_url, api_url.as_ref().unwrap_or(&base.api.base_url));
            prop_assert_eq!(config.output.verbose, verbose.unwrap_or(base.output.verbose));
            prop_assert!(config.validate().is_ok());
        }
    }

    // Config survives a save/load cycle through TOML.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        #[test]
        fn test_config_toml_persistence(
            interval_ms in 1u64..60_000,
            max_ticks in 0u32..50,
            ready_timeout in 1u64..300,
            format in prop::sample::select(vec!["table", "json", "quiet"]),
        ) {
            let mut config = Config::default();
            config.keepalive.interval_ms = interval_ms;
            config.keepalive.max_ticks = max_ticks;
            config.flow.ready_timeout_seconds = ready_timeout;
            config.output.format = format.to_string();

            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("sim.toml");
            config.save(&path).unwrap();
            let loaded = Config::load(&path).unwrap();

            prop_assert_eq!(loaded.keepalive.interval_ms, interval_ms);
            prop_assert_eq!(loaded.keepalive.max_ticks, max_ticks);
            prop_assert_eq!(loaded.flow.ready_timeout_seconds, ready_timeout);
            prop_assert_eq!(loaded.output.format, format);
        }
    }

    // Console parsing never panics and only accepts the listed menu digits.
    proptest! {
        #[test]
        fn test_console_parsing_is_total(line in ".{0,40}") {
            let _ = line.parse::<DeviceCommand>();
            if let Ok(command) = line.parse::<AppCommand>() {
                prop_assert!(matches!(line.trim(), "0" | "1" | "2" | "3" | "4" | "5" | "6" | "7"));
                prop_assert_eq!(command == AppCommand::Quit, line.trim() == "0");
            }
        }

        #[test]
        fn test_ready_adopts_any_session_id(session in "[a-zA-Z0-9_-]{1,32}") {
            let parsed = format!("ready {session}").parse::<DeviceCommand>().unwrap();
            prop_assert_eq!(parsed, DeviceCommand::Ready(Some(session)));
        }
    }

    // Quiet mode prints nothing but errors.
    proptest! {
        #[test]
        fn test_quiet_mode_suppresses_messages(message in ".{0,60}") {
            let out = OutputFormatter::new(OutputFormat::Quiet, false);
            prop_assert!(out.format_message(&message, "test").is_empty());
            prop_assert!(out.format_error(&message, "test").starts_with("Error: "));
        }
    }
}
