//! Soundscape bridge - headless sound source synchronization
//!
//! Starts a sync session, registers a number of sources and keeps them in
//! sync with the device until killed (or for a fixed time).
//!
//! ## Command line flags
//!
//! - `--config PATH`: YAML config file (default: `<config dir>/soundscape-sync/sync.yaml`)
//! - `--sources N`: number of sources to register (default 1)
//! - `--mode off|tx|rx|sync`: communication mode of the sources
//! - `--address IP`: device address, overrides the config
//! - `--interval MS`: send interval, overrides the config
//! - `--run-for SECS`: exit after this many seconds

use anyhow::{bail, Context};
use soundscape_sync::{
    default_sync_config_path, load_sync_config, ChangeSource, ComsMode, DirtyFlags, SessionEvent,
    SyncSession,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How often the main loop drains events and checks the online status
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    sources: usize,
    mode: Option<ComsMode>,
    address: Option<String>,
    interval_ms: Option<i64>,
    run_for: Option<Duration>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args {
        sources: 1,
        ..Args::default()
    };

    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--config" => parsed.config_path = Some(PathBuf::from(value("--config")?)),
            "--sources" => {
                parsed.sources = value("--sources")?.parse().context("--sources expects a number")?;
            }
            "--mode" => {
                let raw = value("--mode")?;
                match ComsMode::parse(&raw) {
                    Some(mode) => parsed.mode = Some(mode),
                    None => bail!("Unknown mode '{}' (expected off, tx, rx or sync)", raw),
                }
            }
            "--address" => parsed.address = Some(value("--address")?),
            "--interval" => {
                parsed.interval_ms = Some(value("--interval")?.parse().context("--interval expects milliseconds")?);
            }
            "--run-for" => {
                let secs: u64 = value("--run-for")?.parse().context("--run-for expects seconds")?;
                parsed.run_for = Some(Duration::from_secs(secs));
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(parsed)
}

fn main() -> anyhow::Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    let config_path = args.config_path.clone().unwrap_or_else(default_sync_config_path);
    let mut config = load_sync_config(&config_path);
    if let Some(mode) = args.mode {
        config.default_coms_mode = mode;
    }

    let session = SyncSession::start(&config).context("Failed to start sync session")?;
    if let Some(address) = &args.address {
        session.set_endpoint_address(ChangeSource::Host, address);
    }
    if let Some(interval) = args.interval_ms {
        session.set_send_interval(ChangeSource::Host, interval);
    }

    let handles: Vec<_> = (0..args.sources).map(|_| session.add_source()).collect();
    for handle in &handles {
        let source_id = session.source_id(*handle).unwrap_or_default();
        session.set_display_name(*handle, ChangeSource::Host, &format!("Source {}", source_id));
    }
    log::info!(
        "soundscape-bridge: {} source(s) in {} mode, device {}, interval {} ms",
        handles.len(),
        config.default_coms_mode.label(),
        session.endpoint_address(),
        session.send_interval_ms()
    );

    let started = Instant::now();
    loop {
        std::thread::sleep(POLL_INTERVAL);

        for event in session.drain_events() {
            match event {
                SessionEvent::Gesture { source, kind, edge } => {
                    log::debug!("Gesture {:?} on {} for {}", edge, kind.name(), source);
                }
                SessionEvent::Idle => log::info!("Session idle"),
            }
        }

        if session.pop_global_dirty(ChangeSource::Interface, DirtyFlags::ONLINE) {
            if session.is_online() {
                log::info!("Device {} online", session.endpoint_address());
            } else {
                log::warn!("Device {} offline", session.endpoint_address());
            }
        }

        if args.run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }

    for handle in handles {
        session.remove_source(handle);
    }
    session.shutdown();
    Ok(())
}
