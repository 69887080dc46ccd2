use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use throttlegate::config::Config;
use throttlegate::proxy::App;
use throttlegate::registry::ModelRegistry;
use throttlegate::telemetry::{RoutingLog, stats};

#[derive(Parser)]
#[command(name = "throttlegate", about = "Cost-optimizing reverse proxy for LLM chat APIs")]
struct Args {
	/// Path to the JSON configuration file.
	#[arg(long, short, default_value = "throttlegate.json")]
	config: PathBuf,
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
	/// Aggregate the routing log and print the report.
	Stats {
		/// Look-back window in days.
		#[arg(long, default_value_t = 30)]
		days: i64,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let cfg = Config::load(&args.config).context("loading configuration")?;

	match args.command {
		Some(Command::Stats { days }) => print_stats(&cfg, days),
		None => {
			init_tracing(&cfg.logging.level);
			if !cfg.http.enabled {
				anyhow::bail!("http server is disabled in configuration");
			}
			let app = App::new(cfg).context("initializing")?;
			throttlegate::proxy::serve(app).await
		},
	}
}

fn init_tracing(level: &str) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(format!("throttlegate={level}")));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_stats(cfg: &Config, days: i64) -> anyhow::Result<()> {
	let registry = ModelRegistry::load(
		&cfg.model_catalog_path,
		&cfg.routing_table_path,
		cfg.aliases.clone(),
	)?;
	let baseline = registry
		.most_expensive()
		.context("model catalog is empty")?;
	let log = RoutingLog::open(&cfg.logging.log_file_path);
	let since = Utc::now() - chrono::Duration::days(days.max(0));
	let report = stats::aggregate(&log.read_since(since), since, baseline);
	println!("{}", serde_json::to_string_pretty(&report)?);
	Ok(())
}
