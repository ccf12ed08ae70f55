use crate::config::MiscConfig;
use crate::error::{Result, TunnelError};
use std::fs::OpenOptions;
use std::sync::{Mutex, Once};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Initialize logging from the `misc` section.
///
/// `RUST_LOG` takes precedence over `log-level`. Only the first call in a
/// process installs a subscriber; later calls return `Ok(())`.
pub fn init_logging(misc: &MiscConfig) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(misc);
    });

    result
}

fn make_writer(target: &str) -> Result<BoxMakeWriter> {
    let writer = match target {
        "" | "stderr" => BoxMakeWriter::new(std::io::stderr),
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| TunnelError::config(format!("Cannot open log file {}: {}", path, e)))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };
    Ok(writer)
}

fn init_logging_inner(misc: &MiscConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(misc.log_level.as_str()));
    let to_file = !matches!(misc.log_file.as_str(), "" | "stderr" | "stdout");

    let fmt_layer = fmt::layer()
        .with_writer(make_writer(&misc.log_file)?)
        .with_ansi(!to_file)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // Another subscriber may already be installed by the embedding process
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!(
            "Logging initialized at level {} to {}",
            misc.log_level.as_str(),
            misc.log_file
        );
    }
    Ok(())
}
