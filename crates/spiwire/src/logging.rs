use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Environment variable holding `tracing` filter directives; overrides
/// `--log-level` when set, e.g. `SPIWIRE_LOG=info,spiwire_spi=trace`.
pub const LOG_ENV: &str = "SPIWIRE_LOG";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> tracing::level_filters::LevelFilter {
        match self {
            LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
            LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
            LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
            LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
            LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
        }
    }
}

/// Filter for `level`, unless `directives` (the `SPIWIRE_LOG` value) parse.
fn build_filter(level: LogLevel, directives: Option<&str>) -> EnvFilter {
    let fallback = || {
        EnvFilter::builder()
            .with_default_directive(level.as_filter().into())
            .parse_lossy("")
    };
    match directives {
        Some(raw) if !raw.trim().is_empty() => match EnvFilter::try_new(raw) {
            Ok(filter) => filter,
            Err(err) => {
                eprintln!("warning: ignoring {LOG_ENV}={raw:?}: {err}");
                fallback()
            }
        },
        _ => fallback(),
    }
}

/// Install the stderr subscriber. Records carry the thread name so reactor
/// (`sinsvc2`) and SPI task (`spi2_slv`) lines can be told apart.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let directives = std::env::var(LOG_ENV).ok();
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(build_filter(level, directives.as_deref()))
        .with_ansi(false)
        .with_target(false)
        .with_thread_names(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
