mod exit;
mod logging;

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use spiwire_service::{AlwaysReady, Service, ServiceConfig, ServiceError, ServiceHandle};
use spiwire_spi::{DeviceBus, NullBus, SpiBus};
use tracing::{debug, info, warn};

use crate::exit::{service_error, spi_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::logging::{init_logging, LogFormat, LogLevel};

const SUPERVISE_TICK: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "spiwired", version, about = "Forward TCP frames to an SPI slave link")]
struct Cli {
    /// JSON service configuration. Defaults apply when omitted.
    #[arg(long, value_name = "PATH", env = "SPIWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Device node the SPI chunks are written to. Chunks are discarded when omitted.
    #[arg(long, value_name = "PATH")]
    spi_device: Option<PathBuf>,

    /// Override the configured listening port.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

fn run(cli: Cli) -> CliResult<i32> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        target = option_env!("SPIWIRE_BUILD_TARGET").unwrap_or("unknown"),
        profile = option_env!("SPIWIRE_BUILD_PROFILE").unwrap_or("unknown"),
        "spiwired starting"
    );

    let config = load_config(&cli)?;
    let handle = match &cli.spi_device {
        Some(path) => {
            let bus = DeviceBus::open(path).map_err(|err| spi_error("open SPI device", err))?;
            info!(device = %path.display(), "SPI chunks written to device");
            start(config.clone(), bus)?
        }
        None => {
            info!("no SPI device configured, chunks are discarded");
            start(config.clone(), NullBus)?
        }
    };

    supervise(handle, config.telemetry_interval)
}

fn load_config(cli: &Cli) -> CliResult<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::from_json_file(path)
            .map_err(|err| service_error("load config", err))?,
        None => ServiceConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    config
        .validate()
        .map_err(|err| service_error("load config", err))?;
    Ok(config)
}

fn start<S: SpiBus>(config: ServiceConfig, bus: S) -> CliResult<ServiceHandle> {
    Service::start(config, bus, AlwaysReady).map_err(|err| service_error("start service", err))
}

fn supervise(mut handle: ServiceHandle, telemetry: Option<Duration>) -> CliResult<i32> {
    install_ctrlc_handler(&handle)?;

    let mut next_telemetry = telemetry.map(|interval| Instant::now() + interval);
    while !handle.is_stopping() {
        if let (Some(interval), Some(due)) = (telemetry, next_telemetry) {
            let now = Instant::now();
            if now >= due {
                publish_telemetry(&handle);
                next_telemetry = Some(now + interval);
            }
        }
        thread::sleep(SUPERVISE_TICK);
    }

    info!("stop requested");
    handle
        .shutdown()
        .map_err(|err| service_error("shutdown", err))?;
    Ok(SUCCESS)
}

fn publish_telemetry(handle: &ServiceHandle) {
    let line = match handle.telemetry().to_json_line() {
        Ok(line) => line,
        Err(err) => {
            warn!(error = %err, "telemetry encoding failed");
            return;
        }
    };
    match handle.management().submit(&line) {
        Ok(bytes) => debug!(bytes, "telemetry queued"),
        Err(ServiceError::ManagementClosed) => debug!("listener not up, telemetry skipped"),
        Err(err) => warn!(error = %err, "telemetry dropped"),
    }
}

fn install_ctrlc_handler(handle: &ServiceHandle) -> CliResult<()> {
    let stopper = handle.stopper();
    ctrlc::set_handler(move || stopper.stop())
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
