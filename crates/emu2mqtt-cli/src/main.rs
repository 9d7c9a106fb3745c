//! Command-line entrypoint for the EMU-2 to MQTT bridge.

use anyhow::{Context, Result};
use clap::Parser;
use emu2mqtt_bridge::Bridge;
use emu2mqtt_core::config::env_vars;
use emu2mqtt_core::BridgeConfig;
use tokio::sync::watch;
use tracing::{error, info};

/// Bridge a Rainforest EMU-2 energy monitor to MQTT with Home Assistant
/// discovery.
#[derive(Parser, Debug)]
#[command(name = "emu2mqtt")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device of the EMU-2 (overrides SERIAL_DEVICE).
    #[arg(long)]
    serial_device: Option<String>,

    /// MQTT broker hostname (overrides MQTT_HOSTNAME).
    #[arg(long)]
    mqtt_hostname: Option<String>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

/// Filter directives covering every crate of this workspace. EnvFilter
/// target matching is segment-bounded, so `emu2mqtt=info` alone would
/// leave `emu2mqtt_bridge` and friends at the global level.
fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "emu2mqtt=debug,emu2mqtt_cli=debug,emu2mqtt_bridge=debug,emu2mqtt_core=debug,emu2mqtt_protocol=debug"
    } else {
        "emu2mqtt=info,emu2mqtt_cli=info,emu2mqtt_bridge=info,emu2mqtt_core=info,emu2mqtt_protocol=info"
    }
}

fn init_logging(args: &Args) {
    // JSON format for container deployments, compact otherwise.
    let json_logging = std::env::var("EMU2MQTT_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            // LOG_LEVEL mirrors the container convention; RUST_LOG wins.
            std::env::var(env_vars::LOG_LEVEL)
                .map_err(anyhow::Error::from)
                .and_then(|v| Ok(tracing_subscriber::EnvFilter::try_new(v)?))
        })
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(default_directives(args.verbose))
                .add_directive(tracing::Level::WARN.into())
        });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = term.recv() => info!("terminated"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = BridgeConfig::from_env().context("invalid configuration")?;
    if let Some(device) = args.serial_device {
        config.serial.device = device;
    }
    if let Some(hostname) = args.mqtt_hostname {
        config.mqtt.hostname = hostname;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = tokio::spawn(Bridge::new(config).run(shutdown_rx));

    wait_for_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    bridge.await.context("bridge task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_cover_every_workspace_crate() {
        for (directives, level) in [
            (default_directives(false), "info"),
            (default_directives(true), "debug"),
        ] {
            for target in [
                "emu2mqtt",
                "emu2mqtt_cli",
                "emu2mqtt_bridge",
                "emu2mqtt_core",
                "emu2mqtt_protocol",
            ] {
                assert!(
                    directives.split(',').any(|d| d == format!("{target}={level}")),
                    "{target} missing from {directives:?}"
                );
            }
        }
    }
}
