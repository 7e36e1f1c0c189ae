use clap::Parser;
use std::path::PathBuf;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "gatehouse", about, long_about = None)]
struct Cli {
	/// Read configuration from this YAML file.
	#[arg(short, long, value_name = "file", env = "GATEHOUSE_CONFIG")]
	file: Option<PathBuf>,

	/// Inline YAML configuration (mutually exclusive with --file).
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Parse and validate the configuration, then exit.
	#[arg(long)]
	validate_only: bool,
}

pub fn run() -> anyhow::Result<()> {
	let args = Cli::parse();
	let contents = read_config_contents(&args)?;
	commands::run::execute(&contents, args.validate_only)
}

fn read_config_contents(args: &Cli) -> anyhow::Result<String> {
	match (&args.config, &args.file) {
		(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file"),
		(Some(config), None) => Ok(config.clone()),
		(None, Some(file)) => Ok(std::fs::read_to_string(file)?),
		(None, None) => anyhow::bail!("one of --config or --file is required"),
	}
}
