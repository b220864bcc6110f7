// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use dd_resmon::config::{config_path, get_log_level, load_config};
use dd_resmon::{Error, ResourceMonitor};
use log::{info, warn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dd-resmon", about = "Reports CPU and memory utilization against the resources allocated to this process")]
struct Cli {
    /// Path to the YAML configuration (defaults to $DD_RESMON_CONFIG or /etc/datadog-agent/resmon.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    Ok(())
}

fn report(monitor: &ResourceMonitor) {
    let window = monitor.config().report_window();
    match monitor.get_utilization(window) {
        Ok(u) => info!(
            "cpu {:.1}% of {:.2} cores, memory {} bytes ({:.1}% of {}) over {}ms",
            u.cpu_percentage,
            u.system_resources.maximum_cpu_units,
            u.memory_used_bytes,
            u.memory_percentage(),
            u.system_resources.maximum_memory_bytes,
            u.window.as_millis()
        ),
        Err(Error::InsufficientData { available }) => {
            info!("waiting for samples ({available} recorded so far)")
        }
        Err(e) => warn!("utilization unavailable: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config_path);
    let config = load_config(&path)?;

    simple_logger::init_with_level(get_log_level(&config))?;
    info!(
        "dd-resmon starting (version {}, config {})",
        env!("CARGO_PKG_VERSION"),
        path.display()
    );

    let monitor = ResourceMonitor::new(config);
    monitor.start().context("starting resource monitor")?;

    let mut ticker = tokio::time::interval(monitor.config().report_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately and there is nothing to report yet
    ticker.tick().await;

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            _ = ticker.tick() => report(&monitor),
        }
    }

    info!("dd-resmon shutting down");
    monitor.stop().await;
    Ok(())
}
