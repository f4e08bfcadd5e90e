use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable that overrides the verbosity flags
pub const LOG_ENV: &str = "FLOWCTL_LOG";

/// How the process should log
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub debug: bool,
    pub quiet: bool,
    /// Emit JSON lines on stderr instead of text
    pub json: bool,
    /// Additional plain-text log file
    pub file: Option<PathBuf>,
}

/// Crate filter for the given verbosity flags
pub fn filter_directive(debug: bool, quiet: bool) -> &'static str {
    if debug {
        "flowctl=debug"
    } else if quiet {
        "flowctl=error"
    } else {
        "flowctl=info"
    }
}

/// Install the global subscriber
///
/// `FLOWCTL_LOG` takes precedence over `debug` and `quiet`.
pub fn init_logging(opts: &LogOptions) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(opts.debug, opts.quiet)));

    let text_layer = (!opts.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_line_number(opts.debug)
            .with_file(opts.debug)
            .with_writer(std::io::stderr)
    });
    let json_layer = opts
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));

    let file_layer = match opts.file {
        Some(ref log_path) => {
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?;

            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Default log file for a long-running controller process
pub fn default_log_path() -> anyhow::Result<PathBuf> {
    let log_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
        .join("flowctl")
        .join("logs");

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(log_dir.join(format!("controller-{}.log", timestamp)))
}
