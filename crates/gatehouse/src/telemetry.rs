use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Initialises the global tracing subscriber. The configured level acts as
/// the default directive; `RUST_LOG` still takes precedence when set.
pub fn init(level: &str, format: LogFormat) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	match format {
		LogFormat::Plain => builder.try_init().map_err(|e| anyhow::anyhow!(e))?,
		LogFormat::Json => builder.json().try_init().map_err(|e| anyhow::anyhow!(e))?,
	}
	Ok(())
}
