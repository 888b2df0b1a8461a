//! `headunit` binary entry point.
//!
//! Wires a [`HeadUnit`] to the simulated phone backend and an in-memory video
//! surface, installs a device watcher, and runs until Ctrl-C.
//!
//! ```text
//! main()
//!  └─ load_config()               -- --config or the platform config file
//!  └─ HeadUnit::new()             -- executor, renderer, session manager
//!  └─ DeviceWatcher               -- scripted bus (--device) or sysfs (--sysfs)
//!  └─ signal logger thread        -- logs ConnectedChanged / SessionError / StateChanged
//!  └─ block on Ctrl-C, then drop the head unit
//! ```
//!
//! `main` is synchronous: the head unit owns its Tokio runtime and must be
//! dropped outside of it.  Ctrl-C is awaited through the head unit's own
//! runtime handle.
//!
//! # Examples
//!
//! ```text
//! headunit --device 18d1:4ee1              # plug a simulated phone at start
//! headunit --device 18d1:4ee1 --pings 5    # phone ends the session after 5 pings
//! headunit --sysfs                         # watch /sys/bus/usb/devices
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use headunit_client::application::session_manager::SessionSignal;
use headunit_client::infrastructure::backend::{PhoneScript, SimulatedBackend};
use headunit_client::infrastructure::config::{load_config, platform_config_path, HeadUnitConfig};
use headunit_client::infrastructure::device_watcher::mock::MockUsbBus;
use headunit_client::infrastructure::device_watcher::sysfs::{SysfsUsbEnumerator, SYSFS_USB_DEVICES};
use headunit_client::infrastructure::device_watcher::DeviceWatcher;
use headunit_client::infrastructure::ui_bridge::get_status;
use headunit_client::infrastructure::video_surface::VideoSurface;
use headunit_client::HeadUnit;

/// Vehicle head unit with a simulated phone.
#[derive(Debug, Parser)]
#[command(name = "headunit", about = "Vehicle head-unit session orchestrator", version)]
struct Cli {
    /// Path to the TOML config file.  Defaults to the platform config file.
    #[arg(long, env = "HEADUNIT_CONFIG")]
    config: Option<PathBuf>,

    /// Plug a simulated device with this `vvvv:pppp` USB id at start-up.
    #[arg(long, conflicts_with = "sysfs")]
    device: Option<String>,

    /// Watch the Linux sysfs USB tree (polling) instead of the simulated bus.
    #[arg(long, num_args = 0..=1, default_missing_value = SYSFS_USB_DEVICES)]
    sysfs: Option<PathBuf>,

    /// Pings the simulated phone sends before it asks to end the session.
    #[arg(long)]
    pings: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, source) = match cli.config.clone().map(Ok).unwrap_or_else(platform_config_path) {
        Ok(path) => {
            let config = load_config(&path).with_context(|| format!("loading config from {}", path.display()))?;
            (config, path.display().to_string())
        }
        Err(_) => (HeadUnitConfig::default(), "built-in defaults".to_string()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .init();
    info!(config = %source, "headunit starting");

    let device = cli.device.as_deref().map(parse_usb_id).transpose()?;

    let surface = Arc::new(VideoSurface::new());
    let backend = Arc::new(SimulatedBackend::new(PhoneScript {
        pings_before_shutdown: cli.pings,
        ..PhoneScript::default()
    }));
    let head_unit = HeadUnit::new(&config, backend, surface).context("starting head unit")?;

    let signals = head_unit.session().subscribe();
    std::thread::Builder::new()
        .name("headunit-signals".to_string())
        .spawn(move || {
            for signal in signals {
                match signal {
                    SessionSignal::ConnectedChanged(connected) => info!(connected, "connection changed"),
                    SessionSignal::SessionError(message) => warn!(%message, "session error"),
                    SessionSignal::StateChanged(state) => info!(%state, "session state"),
                }
            }
        })
        .context("spawning signal logger")?;

    let bus = MockUsbBus::with_hotplug();
    let factory = match &cli.sysfs {
        Some(root) => {
            info!(root = %root.display(), "watching sysfs");
            SysfsUsbEnumerator::factory(root.clone())
        }
        None => bus.factory(),
    };
    let (watcher, events) = DeviceWatcher::new(factory, config.watcher_config());
    head_unit.attach_watcher(events)?;
    head_unit.start_detection(watcher)?;

    if let Some((vendor_id, product_id)) = device {
        bus.plug(vendor_id, product_id);
    }

    info!(status = %serde_json::to_string(&get_status(&head_unit))?, "head unit running; Ctrl-C to quit");
    head_unit
        .runtime()
        .block_on(tokio::signal::ctrl_c())
        .context("waiting for Ctrl-C")?;

    info!(
        status = %serde_json::to_string(&get_status(&head_unit))?,
        fallback_frames = head_unit.fallback_frames(),
        "shutdown signal received"
    );
    drop(head_unit);
    Ok(())
}

/// Parses a `vvvv:pppp` USB id.
fn parse_usb_id(id: &str) -> anyhow::Result<(u16, u16)> {
    let Some((vendor, product)) = id.split_once(':') else {
        bail!("device id '{id}' is not of the form vvvv:pppp");
    };
    let vendor = u16::from_str_radix(vendor, 16).with_context(|| format!("bad vendor id in '{id}'"))?;
    let product = u16::from_str_radix(product, 16).with_context(|| format!("bad product id in '{id}'"))?;
    Ok((vendor, product))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usb_id_accepts_hex_pair() {
        assert_eq!(parse_usb_id("18d1:4ee1").unwrap(), (0x18d1, 0x4ee1));
    }

    #[test]
    fn test_parse_usb_id_rejects_malformed_ids() {
        assert!(parse_usb_id("18d14ee1").is_err());
        assert!(parse_usb_id("zz:4ee1").is_err());
        assert!(parse_usb_id("18d1:10000").is_err());
    }

    #[test]
    fn test_cli_rejects_device_with_sysfs() {
        let result = Cli::try_parse_from(["headunit", "--device", "18d1:4ee1", "--sysfs"]);
        assert!(result.is_err());
    }
}
