use gatehouse::config::Config;
use gatehouse::{server, telemetry};

pub fn execute(config_contents: &str, validate_only: bool) -> anyhow::Result<()> {
	let config = Config::from_yaml(config_contents)?;
	if validate_only {
		println!("configuration is valid");
		return Ok(());
	}

	telemetry::init(&config.log_level, config.log_format)?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(server::run(config))
}
