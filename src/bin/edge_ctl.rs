//! edge_ctl - switch the edge-detection device on or off directly.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use edge_streamer::device::{DeviceChannel, DeviceConfig, IOCTL_SET_EDGE_DETECTION};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send the enable/disable command to the edge-detection device")]
struct Args {
    /// Transform device node.
    #[arg(long, env = "EDGE_STREAMER_DEVICE", default_value = "/dev/edge_detection")]
    device: String,

    /// ioctl request number for the mode switch.
    #[arg(long, default_value_t = IOCTL_SET_EDGE_DETECTION, value_parser = parse_command)]
    ioctl_command: u32,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Action {
    /// Turn edge detection on.
    Enable,
    /// Turn edge detection off.
    Disable,
}

fn parse_command(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("'{value}' is not a decimal or 0x-prefixed ioctl number"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let channel = DeviceChannel::open(&DeviceConfig {
        path: args.device.clone(),
        ioctl_command: args.ioctl_command,
        ..DeviceConfig::default()
    });
    let enabled = matches!(args.action, Action::Enable);
    channel
        .set_mode(enabled)
        .with_context(|| format!("failed to switch {}", args.device))?;

    println!(
        "Edge detection {} on {}",
        if enabled { "enabled" } else { "disabled" },
        args.device
    );
    Ok(())
}
