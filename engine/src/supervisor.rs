//! Lifecycle wiring.
//!
//! Builds the construction graph (store, chain facade) once per process and hands the
//! pieces to whichever pipelines the daemon mode runs. Shutdown is signal-driven:
//! SIGINT/SIGTERM stops the backfill worker cooperatively, cancels the live subscription
//! and fan-out with the task scope, and drains the store last.

use std::sync::Arc;

use anyhow::{Context, Result};
use utilities::{
	make_periodic_tick,
	task_scope::{task_scope, Scope},
	SecretUrl,
};

use crate::{
	backfill::{self, BackfillContext, BackfillService},
	constants::GRACEFUL_RESTART_INTERVAL,
	fanout::FanoutServer,
	prediction::{subscription::spawn_subscription, PredictionRpcApi, PredictionRpcClient},
	realtime::RealtimePipeline,
	settings::Settings,
	store::{PostgresStore, Store},
};

async fn connect_dependencies(
	settings: &Settings,
) -> Result<(Arc<PostgresStore>, Arc<PredictionRpcClient>)> {
	let store = Arc::new(
		PostgresStore::connect(&settings.database_url)
			.await
			.context("connecting to Postgres")?,
	);
	store.probe().await.context("probing Postgres")?;

	let rpc = Arc::new(
		PredictionRpcClient::connect(
			SecretUrl::from(settings.rpc_url.clone()),
			&settings.contract_address,
			settings.rate_limit_rps,
		)
		.await?,
	);
	Ok((store, rpc))
}

fn backfill_context(
	settings: &Settings,
	store: &Arc<PostgresStore>,
	rpc: &Arc<PredictionRpcClient>,
) -> BackfillContext {
	BackfillContext::new(
		rpc.clone() as Arc<dyn PredictionRpcApi>,
		store.clone() as Arc<dyn Store>,
		settings.multi_claim_threshold,
	)
}

/// `history` mode: main + side backfill workers with periodic graceful restarts.
pub async fn run_history(settings: Settings) -> Result<()> {
	let (store, rpc) = connect_dependencies(&settings).await?;
	let context = backfill_context(&settings, &store, &rpc);

	let result = task_scope(|scope: Scope| async move {
		let service = Arc::new(BackfillService::start(context.clone()));
		scope.spawn(backfill::run_side_worker(context));

		let restart_service = service.clone();
		scope.spawn(async move {
			let mut tick = make_periodic_tick(GRACEFUL_RESTART_INTERVAL, false);
			loop {
				tick.tick().await;
				restart_service.graceful_restart().await;
			}
		});

		let signal = wait_for_shutdown_signal().await?;
		tracing::info!("{signal} received, stopping backfill");
		service.shutdown().await;
		Ok(())
	})
	.await;

	store.close().await;
	result
}

/// `realtime` mode: live subscription, real-time pipeline and the fan-out server.
pub async fn run_realtime(settings: Settings) -> Result<()> {
	let (store, rpc) = connect_dependencies(&settings).await?;
	let contract_address = settings
		.contract_address
		.parse()
		.with_context(|| format!("invalid contract address {:?}", settings.contract_address))?;

	let server = FanoutServer::new(settings.fanout_port).await?;
	let fanout = server.handle();

	let ws_endpoint = SecretUrl::from(settings.rpc_ws_url.clone());
	let pipeline_store = store.clone() as Arc<dyn Store>;
	let pipeline_rpc = rpc.clone() as Arc<dyn PredictionRpcApi>;

	let result = task_scope(|scope: Scope| async move {
		scope.spawn(server.run());

		let events = spawn_subscription(&scope, ws_endpoint, contract_address);
		let pipeline = RealtimePipeline::new(pipeline_rpc, pipeline_store, fanout);
		scope.spawn(pipeline.run(events));

		let signal = wait_for_shutdown_signal().await?;
		tracing::info!("{signal} received, closing subscription and fan-out");
		Ok(())
	})
	.await;

	store.close().await;
	result
}

/// `range` mode: one-shot backfill over a closed interval, then exit.
pub async fn run_range(settings: Settings, from_epoch: i64, to_epoch: i64) -> Result<()> {
	let (store, rpc) = connect_dependencies(&settings).await?;
	let context = backfill_context(&settings, &store, &rpc);

	let report = backfill::process_range(&context, from_epoch, to_epoch).await;
	store.close().await;
	let report = report?;

	tracing::info!(
		"range [{from_epoch}, {to_epoch}]: {} committed ({} bets, {} claims), {} skipped, {} failed",
		report.committed,
		report.bets,
		report.claims,
		report.skipped,
		report.failed,
	);
	Ok(())
}

async fn wait_for_shutdown_signal() -> Result<&'static str> {
	let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
		.context("installing SIGTERM handler")?;
	Ok(tokio::select! {
		result = tokio::signal::ctrl_c() => {
			result.context("waiting for SIGINT")?;
			"SIGINT"
		},
		_ = sigterm.recv() => "SIGTERM",
	})
}
