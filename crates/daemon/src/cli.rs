//! Command-line interface.

use clap::{Parser, Subcommand};

use bd_domain::config::Config;

pub const INSTANCE_ENV: &str = "BROWSER_INSTANCE";
pub const PORT_ENV: &str = "BROWSER_PORT";

#[derive(Debug, Parser)]
#[command(name = "browserd", version, about = "Browser automation daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// TCP port override (beats BROWSER_PORT and the config file).
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Session ID enabling session-scoped close.
    #[arg(long = "session-id", global = true)]
    pub session_id: Option<String>,

    /// Instance ID override (beats BROWSER_INSTANCE).
    #[arg(long, global = true)]
    pub instance: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon (default).
    Serve,
    /// Query a running daemon's status over the wire.
    Status,
    /// Fan a test-script glob out across N peer daemons.
    Orchestrate {
        /// Glob pattern for test-script files.
        pattern: String,
        #[arg(long, default_value_t = 2)]
        instances: usize,
    },
    Version,
}

/// Instance ID: `--instance` beats `BROWSER_INSTANCE` beats `default`.
pub fn resolve_instance(cli: &Cli) -> String {
    cli.instance
        .clone()
        .or_else(|| std::env::var(INSTANCE_ENV).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| crate::paths::DEFAULT_INSTANCE.to_string())
}

/// Port: `--port` beats `BROWSER_PORT` beats the config file.
pub fn resolve_port(cli: &Cli, config: &Config) -> u16 {
    if let Some(port) = cli.port {
        return port;
    }
    if let Some(port) = std::env::var(PORT_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
    {
        return port;
    }
    config.server.port
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("browserd").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_to_serve_with_no_subcommand() {
        let cli = parse(&[]);
        assert!(cli.command.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn port_and_session_flags_parse() {
        let cli = parse(&["serve", "--port", "4001", "--session-id", "S1"]);
        assert_eq!(cli.port, Some(4001));
        assert_eq!(cli.session_id.as_deref(), Some("S1"));
    }

    #[test]
    fn cli_port_beats_config() {
        let cli = parse(&["--port", "9000"]);
        let config = Config::default();
        assert_eq!(resolve_port(&cli, &config), 9000);
    }

    #[test]
    fn config_port_is_the_fallback() {
        // Note: assumes BROWSER_PORT is not set in the test environment.
        let cli = parse(&[]);
        let config = Config::default();
        if std::env::var(PORT_ENV).is_err() {
            assert_eq!(resolve_port(&cli, &config), 3456);
        }
    }

    #[test]
    fn orchestrate_parses_pattern_and_instances() {
        let cli = parse(&["orchestrate", "tests/*.json", "--instances", "4"]);
        match cli.command {
            Some(Command::Orchestrate { pattern, instances }) => {
                assert_eq!(pattern, "tests/*.json");
                assert_eq!(instances, 4);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
