//! Command-line front-end: scan for DFU-capable devices, reboot a device
//! into its bootloader, or perform a full firmware update.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use nrf_dfu::ble::btleplug::BtleplugClient;
use nrf_dfu::ble::{parse_uuid, Client};
use nrf_dfu::dfu::{DeviceId, SecureDfu, DFU_SERVICE_UUID};

/// A DFU tool for nRF modules.
#[derive(Parser)]
#[command(name = "nrf-dfu", version, about)]
struct Cli {
    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Produce debug output
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for BLE devices
    Scan {
        /// Duration of the BLE scan in seconds
        #[arg(short, long, default_value_t = 30)]
        duration: u64,
    },
    /// Reboot a device into DFU mode
    Boot {
        #[command(flatten)]
        target: Target,

        /// Timeout in seconds for connecting to the device
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
    /// Perform a device firmware upgrade
    Dfu {
        #[command(flatten)]
        target: Target,

        /// Path of the firmware archive
        #[arg(short, long)]
        firmware: PathBuf,

        /// Timeout in seconds for connecting to the device
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
}

#[derive(Args)]
struct Target {
    /// Address of the target device
    #[arg(short, long, conflicts_with = "name")]
    address: Option<String>,

    /// Advertised name of the target device
    #[arg(short, long)]
    name: Option<String>,
}

impl Target {
    fn device_id(&self) -> Result<DeviceId, String> {
        match (&self.address, &self.name) {
            (Some(address), _) => Ok(DeviceId::Address(address.clone())),
            (None, Some(name)) => Ok(DeviceId::Name(name.clone())),
            (None, None) => Err("no device specified; use --address or --name".to_string()),
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(err) = run(cli) {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Scan { duration } => run_scan(Duration::from_secs(duration)),
        Command::Boot { target, timeout } => {
            run_boot(target.device_id()?, Duration::from_secs(timeout))
        }
        Command::Dfu {
            target,
            firmware,
            timeout,
        } => run_dfu(target.device_id()?, &firmware, Duration::from_secs(timeout)),
    }
}

fn run_scan(duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for BLE devices...");
    let client = BtleplugClient::new()?;
    let dfu_service = parse_uuid(DFU_SERVICE_UUID);

    client.scan(duration, &mut |advertisement| {
        let supported = advertisement
            .services
            .iter()
            .filter_map(|service| parse_uuid(service))
            .any(|service| Some(service) == dfu_service);
        let marker = if supported { " [DFU Supported]" } else { "" };
        println!("{} : {}{}", advertisement.address, advertisement.name, marker);
    })?;
    Ok(())
}

fn run_boot(target: DeviceId, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("rebooting device into DFU mode");
    let client = BtleplugClient::new()?;
    let mut dfu = SecureDfu::new(Box::new(client), target, timeout);
    dfu.enter_bootloader()?;
    Ok(())
}

fn run_dfu(
    target: DeviceId,
    firmware: &Path,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("upgrading firmware with {}", firmware.display());
    let client = BtleplugClient::new()?;
    let mut dfu = SecureDfu::new(Box::new(client), target, timeout);

    let mut last_percent = u64::MAX;
    dfu.update(firmware, |current, total| {
        if total == 0 {
            return;
        }
        let percent = current * 100 / total;
        if percent != last_percent {
            last_percent = percent;
            eprint!("\rDFU: {}/{} bytes ({}%)", current, total, percent);
            let _ = std::io::stderr().flush();
        }
    })?;
    eprintln!();

    log::info!("firmware update complete");
    Ok(())
}
