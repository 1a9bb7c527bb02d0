use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{
    config::Config,
    server::{MessageView, SendSmsRequest},
};

/// The command line interface for the SMS gateway.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// HTTP port, overrides the configuration file
    #[arg(long)]
    pub port: Option<u16>,

    /// Shared secret for the `X-API-KEY` header, overrides the configuration file
    #[arg(long, env = "SMS_GATEWAY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Most verbose level logged to stdout
    #[arg(long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also log (at debug level) to daily rotated files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON request body for `POST /send_sms`.
    SendSms,

    /// Show an example JSON response of `GET /messages`.
    Messages,
}

fn pretty_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("Could not serialize: {e}"))
}

/// The text a command prints.
pub fn command_output(command: Commands) -> String {
    match command {
        Commands::Examples(Examples::Config) => Config::example().serialize_pretty(),
        Commands::Examples(Examples::SendSms) => pretty_json(&SendSmsRequest::example()),
        Commands::Examples(Examples::Messages) => pretty_json(&vec![MessageView {
            id: 1,
            sender: "+15551234567".into(),
            timestamp: "25/01/01,12:00:00+00".into(),
            message: "Hello there".into(),
        }]),
    }
}

/// Run a command which does not need the gateway running.
pub fn handle_command(command: Commands) {
    println!("{}", command_output(command));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::parse_from([
            "sms-gateway",
            "gateway.ron",
            "--port",
            "8080",
            "--api-key",
            "k",
            "--log-level",
            "debug",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("gateway.ron")));
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.api_key.as_deref(), Some("k"));
        assert_eq!(cli.log_level, Level::DEBUG);
    }

    #[test]
    fn example_send_sms_has_field_names() {
        let output = command_output(Commands::Examples(Examples::SendSms));

        assert!(output.contains("phone_number"));
        assert!(output.contains("message"));
    }
}
