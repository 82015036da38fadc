use async_trait::async_trait;
use itertools::Itertools;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mdw_sync::config::SyncConfig;
use mdw_sync::middleware::{MiddlewareClient, Transaction};
use mdw_sync::sync::health::HealthStatus;
use mdw_sync::sync::{
	PluginError, SqliteLedgerStore, SyncError, SyncOrchestrator, SyncPlugin, TransactionFilter,
};

/// Logs a per-type summary of every delivered batch.
struct TransactionLogPlugin {
	start_from_height: u64,
}

#[async_trait]
impl SyncPlugin for TransactionLogPlugin {
	fn name(&self) -> &str {
		"transaction-log"
	}

	fn start_from_height(&self) -> u64 {
		self.start_from_height
	}

	fn filters(&self) -> Vec<TransactionFilter> {
		vec![TransactionFilter::any()]
	}

	async fn on_transactions_saved(&self, transactions: &[Transaction]) -> Result<(), PluginError> {
		let by_type = transactions
			.iter()
			.counts_by(|tx| tx.tx_type.as_str())
			.into_iter()
			.sorted()
			.map(|(tx_type, count)| format!("{}={}", tx_type, count))
			.join(", ");
		info!(
			first_height = transactions.first().map(|tx| tx.block_height),
			last_height = transactions.last().map(|tx| tx.block_height),
			"Transactions saved: {}",
			by_type
		);
		Ok(())
	}

	async fn on_reorg(&self, fork_height: u64) -> Result<(), PluginError> {
		warn!(fork_height, "Chain reorganized");
		Ok(())
	}
}

async fn run(config: SyncConfig) -> Result<HealthStatus, SyncError> {
	let store = Arc::new(SqliteLedgerStore::open(
		&config.database_path,
		config.start_height,
	)?);
	let client = Arc::new(MiddlewareClient::from_config(&config)?);
	info!(middleware_url = %config.middleware_url, "Created middleware client");

	let shutdown = CancellationToken::new();
	let orchestrator = SyncOrchestrator::new(&config, store, client, shutdown.clone())?;
	orchestrator
		.register_plugin(Arc::new(TransactionLogPlugin {
			start_from_height: config.start_height,
		}))
		.await?;

	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				error!("Failed to listen for ctrl-c: {}", e);
			}
			info!("Shutdown requested");
			shutdown.cancel();
		}
	});

	let result = orchestrator.run().await;

	let health = orchestrator.health()?;
	match serde_json::to_string_pretty(&health) {
		Ok(report) => info!("Final health report:\n{}", report),
		Err(e) => warn!("Failed to render health report: {}", e),
	}
	if let Err(e) = result {
		error!("Sync loop stopped: {}", e);
	}
	Ok(health.status)
}

#[tokio::main]
async fn main() -> ExitCode {
	let config = match SyncConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Invalid configuration: {}", e);
			return ExitCode::FAILURE;
		}
	};

	// RUST_LOG wins; `log_filter` is the fallback directive.
	let directive = config
		.log_filter
		.parse()
		.unwrap_or_else(|_| tracing::Level::INFO.into());
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::builder()
				.with_default_directive(directive)
				.from_env_lossy(),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.init();

	info!("Starting middleware sync service");

	match run(config).await {
		Ok(HealthStatus::Halted) => ExitCode::FAILURE,
		Ok(_) => ExitCode::SUCCESS,
		Err(e) => {
			error!("Sync service failed: {}", e);
			ExitCode::FAILURE
		}
	}
}
