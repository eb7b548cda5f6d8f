use clap::Parser;
use std::process::ExitCode;

use prediction_engine::{
	settings::{Settings, SettingsOptions},
	supervisor,
};

#[derive(Parser, Debug)]
#[clap(name = "prediction-engine", version)]
struct Cli {
	#[clap(flatten)]
	settings: SettingsOptions,

	#[clap(subcommand)]
	mode: Mode,
}

#[derive(clap::Subcommand, Debug)]
enum Mode {
	/// Historical backfill daemon: main backtracking worker, recent-window side worker,
	/// periodic graceful restarts.
	History,
	/// Live daemon: chain subscription, online detection, websocket fan-out.
	Realtime,
	/// One-shot backfill of the closed interval [from, to], reporting counts.
	Range {
		#[clap(long)]
		from: i64,
		#[clap(long)]
		to: i64,
	},
}

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();

	let settings = match Settings::load(cli.settings) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("configuration error: {error}");
			return ExitCode::from(1);
		},
	};

	let result = match cli.mode {
		Mode::History => supervisor::run_history(settings).await,
		Mode::Realtime => supervisor::run_realtime(settings).await,
		Mode::Range { from, to } => supervisor::run_range(settings, from, to).await,
	};

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(error) => {
			tracing::error!("fatal: {error:#}");
			ExitCode::from(2)
		},
	}
}
