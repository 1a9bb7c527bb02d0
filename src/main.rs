use clap::Parser;
use color_eyre::Result;
use sms_gateway::{cli, config::Config, gateway::Gateway, logging, server};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, Level};

#[cfg(unix)]
async fn hangup() -> std::io::Result<()> {
    signal(SignalKind::hangup())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn hangup() -> std::io::Result<()> {
    std::future::pending().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    logging::init(cli.log_level, cli.log_dir.map(|dir| (Level::DEBUG, dir))).await;

    let mut config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(api_key) = cli.api_key {
        config.api_key = api_key;
    }

    config.validate()?;

    // Nothing works without the modem, so failing to open it ends the process.
    let gateway = Gateway::start(&config).await?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting");
            Ok(())
        }
        _ = hangup() => {
            info!("Told to hang up, quitting");
            Ok(())
        }
        result = server::run_on_port(gateway.state.clone(), config.port) => {
            error!(?result, "Server returned");
            Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"))
        }
    };

    gateway.shutdown().await;

    logging::shutdown();

    outcome
}
