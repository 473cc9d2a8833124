//! Pilot host agent daemon.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use pilotd::config::ConfigKey;
use pilotd::pilot::{Pilot, PilotOptions};

#[derive(Parser, Debug)]
#[command(name = "pilotd", version, about = "pilot host agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the host agent
    Launch(LaunchArgs),
}

#[derive(Args, Debug)]
struct LaunchArgs {
    /// Use the hardware uuid to identify the device (instead of the
    /// primary mac address)
    #[arg(long = "hw-id", short = 'w')]
    hw_id: bool,

    /// Enable trace-level logging
    #[arg(long = "trace", short = 't')]
    trace: bool,

    /// Enable the upload of telemetry information to pilot control
    #[arg(long = "telemetry", short = 'm')]
    telemetry: bool,

    /// Enable cpu profiling only; cannot profile memory
    #[arg(long)]
    cpu: bool,

    /// Enable memory profiling only; cannot profile cpu
    #[arg(long)]
    mem: bool,

    /// Disable verification of server certificates; susceptible to
    /// machine-in-the-middle interception
    #[arg(long = "insecureSkipVerify", short = 's')]
    insecure_skip_verify: bool,

    /// Upload CVE reports found in this path to pilot control
    #[arg(long = "cve-path")]
    cve_path: Option<PathBuf>,

    /// Maximum upload delay (in minutes) applied before uploading a CVE
    /// report
    #[arg(long = "cve-up-delay", default_value_t = 5)]
    cve_up_delay: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Launch(args) => launch(args).await,
    }
}

async fn launch(args: LaunchArgs) -> Result<()> {
    let filter = if args.trace {
        "trace".to_string()
    } else {
        std::env::var(ConfigKey::LogLevel.as_str()).unwrap_or_else(|_| "info".into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if args.cpu || args.mem {
        warn!("profiling flags are accepted but profiling support is not built in");
    }

    let pilot = Pilot::new(PilotOptions {
        use_hw_id: args.hw_id,
        telemetry: args.telemetry,
        insecure_skip_verify: args.insecure_skip_verify,
        cve_path: args.cve_path,
        cve_upload_delay_mins: args.cve_up_delay,
    })
    .await?;

    pilot.start().await
}
