use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use streamcap::{CaptureSession, StreamcapConfig};

#[derive(Parser, Debug)]
#[command(name = "streamcap")]
#[command(about = "Supervised live-stream recorder driving ffmpeg")]
#[command(version)]
#[command(long_about = "Records a live stream to disk by supervising an ffmpeg capture \
process: its diagnostic output is drained and evaluated every 15 seconds against \
throughput and error heuristics, the source's liveness is polled through the provider \
API, and failed captures are restarted with exponential backoff.")]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "streamcap.toml",
        help = "Path to TOML configuration file"
    )]
    config: String,

    /// Source identifier override
    #[arg(short, long, help = "Record this room id instead of the configured one")]
    room: Option<String>,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without recording")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting streamcap v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let mut config = match StreamcapConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Some(room) = args.room {
        config.source.room_id = room;
    }

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    let session = CaptureSession::new(config).map_err(|e| {
        error!("Failed to create capture session: {}", e);
        e
    })?;

    let exit_code = session.run().await.map_err(|e| {
        error!("Capture session failed: {}", e);
        e
    })?;

    info!("streamcap exited with code: {}", exit_code);
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    // Create environment filter
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("streamcap={}", log_level)));

    // Configure format based on options
    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Streamcap Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    let default_config = r#"[source]
# Liveness provider name
provider = "bilibili"
# Provider-specific source identifier (room id)
room_id = ""
# Preferred CDN index into the resolved candidate list (optional)
# cdn_index = 0
# Preferred CDN host name substituted into the resolved URL (optional)
# cdn_host = "cn-gotcha01"

[capture]
# Output base path; {streamer}, {title} and {time} are expanded per run
output = "./recordings/{streamer}_{time}"
# Output container format appended to the base path
format = "flv"
# Segment duration in seconds; omit to record one continuous file
# segment = 3600
# Extra ffmpeg arguments inserted before the input URL
extra_args = []
# Path to the ffmpeg binary
ffmpeg = "ffmpeg"
# Pass ffmpeg diagnostics through to the console (degrades health checks)
debug = false

[monitor]
# Health-loop poll interval in milliseconds
poll_interval_ms = 1000
# Evaluation window length in milliseconds
window_ms = 15000
# Unterminated output lines are flushed after this many milliseconds
partial_line_flush_ms = 10000
# How long to wait for a graceful exit before escalating to a signal
graceful_stop_wait_ms = 5000
# Throughput multiplier below which a window counts as a strike
low_speed_threshold = 0.9
# Consecutive low-speed windows tolerated before failing the run
low_speed_strike_limit = 2
# The liveness oracle is polled every this many window ticks
oracle_poll_ticks = 3
# Disable the low-throughput interrupt entirely
disable_lowspeed_interrupt = false

[restart]
# Maximum consecutive restart attempts
max_retries = 5
# Base delay for exponential backoff, in seconds
base_delay_secs = 1
# Maximum delay between restarts, in seconds
max_delay_secs = 60
# Whether the delay grows exponentially with each attempt
exponential_backoff = true
"#;

    println!("{}", default_config);
}
