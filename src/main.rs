//! Headless WT9011 monitor.
//!
//! Usage: `wt9011-monitor [ADDRESS]`
//!
//! Scans when no address is given, connects, streams for the configured
//! duration and prints the telemetry window as JSON on stdout.

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use wt9011_bridge::domain::settings::{Settings, SettingsService};
use wt9011_bridge::domain::window::TelemetryWindow;
use wt9011_bridge::infrastructure::logging::init_logger;
use wt9011_bridge::Session;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let mut settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!(
        "Starting WT9011 monitor (settings: {})",
        settings_service.path().display()
    );

    let session = Session::new(settings.session.clone())?;
    session.init()?;

    let address = match std::env::args().nth(1) {
        Some(address) => address,
        None => pick_device(&session, &settings)?,
    };

    session
        .connect(&address)
        .with_context(|| format!("Could not connect to {}", address))?;
    if let Err(e) = settings_service.remember_address(&address) {
        warn!("Failed to save last address: {}", e);
    }

    if let Some(rate_hz) = settings.monitor.return_rate_hz {
        session.commands().set_return_rate(rate_hz)?;
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    session.start_receiving(Arc::new(tx))?;

    let mut window = TelemetryWindow::new(settings.window.channel);
    let started = Instant::now();
    let run_for = Duration::from_secs(settings.monitor.stream_secs);
    info!("Streaming for {:?}", run_for);

    while started.elapsed() < run_for {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(sample) => window.push(sample, started.elapsed().as_secs_f64()),
            Err(RecvTimeoutError::Timeout) => {
                if !session.is_receiving() {
                    warn!("Telemetry stream ended early");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let stats = session.pipeline_stats();
    session.disconnect()?;
    session.cleanup()?;
    info!(
        "Received {} frames, {} dropped",
        stats.frames_received, stats.frames_dropped
    );

    let report = serde_json::json!({
        "address": address,
        "channel": window.channel(),
        "bounds": window.bounds(),
        "stats": stats,
        "entries": window.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Prefer the last used device, then the first whose name matches the filter.
fn pick_device(session: &Session, settings: &Settings) -> Result<String> {
    let devices = session.scan(
        settings.session.scan_timeout_secs,
        settings.session.scan_max_results,
    )?;
    for device in &devices {
        info!("Found {} ({})", device.name, device.address);
    }

    if let Some(last) = &settings.last_connected_address {
        if devices.iter().any(|d| &d.address == last) {
            return Ok(last.clone());
        }
    }

    devices
        .iter()
        .find(|d| d.name.contains(&settings.monitor.device_name_filter))
        .map(|d| d.address.clone())
        .with_context(|| {
            format!(
                "No device matching \"{}\" among {} found",
                settings.monitor.device_name_filter,
                devices.len()
            )
        })
}
