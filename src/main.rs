//! Mount a reMarkable document store as a filesystem.
use std::path::PathBuf;

use clap::Parser;
use rm_fs::fs::Mode;
use tracing::error;

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Browse, read and upload reMarkable documents through a mounted filesystem."
)]
struct Args {
    /// Where to mount. Overrides `mount-point` from the configuration.
    mount_point: Option<PathBuf>,

    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase log verbosity (-v debug, -vv trace)."
    )]
    verbose: u8,

    #[arg(
        short,
        long,
        help = "Initial presentation mode: annot, orig, raw or meta."
    )]
    mode: Option<Mode>,

    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to an rm-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(long, help = "Write the default configuration and exit.")]
    write_config: bool,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    if args.write_config {
        match Config::write_default() {
            Ok(Some(path)) => eprintln!("Wrote default configuration to {}.", path.display()),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Failed to write configuration: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Some(mount_point) = args.mount_point {
        config.mount_point = mount_point;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = Trc::new(args.verbose).init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    if let Err(e) = daemon::spawn(config) {
        error!("Daemon failed: {e}");
        std::process::exit(1);
    }
}
