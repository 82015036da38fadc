//! Sync loop orchestrator and integration point for all sync services.
//!
//! `SyncOrchestrator` drives one cycle per timer tick:
//!
//! - POLLING: read the remote tip and fetch the next run of blocks
//! - REORG_CHECK: make sure the first fetched block extends the local chain, rolling back and
//!   notifying plugins if it does not
//! - PERSISTING: fetch the transactions of the new blocks and store both together with the
//!   advanced global cursor
//! - DISPATCHING: settle pending reorg notifications, deliver the new transactions to
//!   caught-up plugins and backfill the lagging ones
//!
//! Every error ends the tick without advancing cursors; only an unresolvable reorg halts the
//! loop for good.

use crate::config::SyncConfig;
use crate::middleware::{
	Block, LedgerSource, Transaction, TransactionQuery, collect_transactions, sort_chain_order,
};
use crate::sync::{
	backfill::{BackfillReport, BackfillScheduler},
	events::{DispatchReport, Dispatcher},
	health::HealthReport,
	plugins::{PluginRegistry, RegisteredPlugin, SyncPlugin},
	progress_tracker::{SyncProgressTracker, SyncStats},
	reorg::{ChainLink, ReorgDetector},
	repositories::LedgerStore,
	types::{GlobalSyncState, PluginSyncState, SyncError, SyncPhase},
};

use futures::future::join_all;
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a call to [`SyncOrchestrator::tick`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
	/// Blocks `from_height..=to_height` were mirrored.
	Advanced {
		from_height: u64,
		to_height: u64,
		transactions: usize,
	},
	/// Nothing new on the remote; plugins were still served.
	UpToDate,
	/// A reorg was repaired; the next tick re-fetches from `fork_height + 1`.
	Reorged { fork_height: u64 },
	/// The previous tick was still running.
	Skipped,
	/// Shutdown was requested mid-tick. Work committed before it was seen stays committed.
	Cancelled,
	/// The orchestrator is halted and does nothing.
	Halted,
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
	fn acquire(flag: &'a AtomicBool) -> Option<Self> {
		flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| Self(flag))
	}
}

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

/// Main sync orchestrator that coordinates all sync components.
pub struct SyncOrchestrator {
	store: Arc<dyn LedgerStore>,
	source: Arc<dyn LedgerSource>,

	// Services
	registry: PluginRegistry,
	detector: ReorgDetector,
	dispatcher: Dispatcher,
	backfill: BackfillScheduler,
	progress: Mutex<SyncProgressTracker>,

	// Configuration
	sync_interval: Duration,
	max_blocks_per_tick: u64,

	phase: watch::Sender<SyncPhase>,
	in_flight: AtomicBool,
	consecutive_failures: AtomicU32,
	shutdown: CancellationToken,
}

impl SyncOrchestrator {
	/// Wire the sync services together.
	///
	/// `shutdown` stops [`run`](Self::run) and cuts the current tick short after its current
	/// unit of work.
	pub fn new(
		config: &SyncConfig,
		store: Arc<dyn LedgerStore>,
		source: Arc<dyn LedgerSource>,
		shutdown: CancellationToken,
	) -> Result<Self, SyncError> {
		let start_height = store.read_global()?.last_synced_height;
		let (phase, _) = watch::channel(SyncPhase::Idle);

		Ok(Self {
			registry: PluginRegistry::new(store.clone()),
			detector: ReorgDetector::new(config.reorg_depth),
			dispatcher: Dispatcher::new(store.clone()),
			backfill: BackfillScheduler::new(
				store.clone(),
				source.clone(),
				config.backfill_batch_blocks,
				shutdown.clone(),
			),
			progress: Mutex::new(SyncProgressTracker::new(start_height)),
			sync_interval: config.sync_interval(),
			max_blocks_per_tick: config.max_blocks_per_tick.max(1),
			phase,
			in_flight: AtomicBool::new(false),
			consecutive_failures: AtomicU32::new(0),
			shutdown,
			store,
			source,
		})
	}

	pub fn registry(&self) -> &PluginRegistry {
		&self.registry
	}

	/// Register a plugin; see [`PluginRegistry::register`].
	pub async fn register_plugin(
		&self,
		plugin: Arc<dyn SyncPlugin>,
	) -> Result<PluginSyncState, SyncError> {
		self.registry.register(plugin).await
	}

	pub fn phase(&self) -> SyncPhase {
		self.phase.borrow().clone()
	}

	/// Follow phase transitions.
	pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
		self.phase.subscribe()
	}

	pub async fn stats(&self) -> SyncStats {
		self.progress.lock().await.get_stats()
	}

	pub fn health(&self) -> Result<HealthReport, SyncError> {
		Ok(HealthReport::new(
			&self.phase(),
			self.consecutive_failures.load(Ordering::Acquire),
			self.store.read_global()?,
			self.store.read_plugins()?,
		))
	}

	fn set_phase(&self, phase: SyncPhase) {
		debug!(%phase, "Sync phase");
		self.phase.send_replace(phase);
	}

	/// Tick on the configured interval until shutdown.
	///
	/// # Errors
	/// Returns the fatal error that halted the orchestrator.
	pub async fn run(&self) -> Result<(), SyncError> {
		info!(interval_ms = self.sync_interval.as_millis() as u64, "Starting sync loop");
		let mut interval = tokio::time::interval(self.sync_interval);
		interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				biased;
				_ = self.shutdown.cancelled() => {
					info!("Sync loop stopped");
					self.progress.lock().await.log_progress(true);
					return Ok(());
				}
				_ = interval.tick() => {}
			}

			match self.tick().await {
				Err(e) if e.is_fatal() => return Err(e),
				Ok(TickOutcome::Halted) => {
					let reason = match self.phase() {
						SyncPhase::Halted(reason) => reason,
						phase => phase.to_string(),
					};
					return Err(SyncError::Halted(reason));
				}
				// Failures are logged by `tick`; the next tick retries.
				_ => {}
			}
		}
	}

	/// Run one sync cycle unless one is already running.
	pub async fn tick(&self) -> Result<TickOutcome, SyncError> {
		if self.phase().is_halted() {
			return Ok(TickOutcome::Halted);
		}
		let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
			debug!("Previous tick still running, skipping");
			return Ok(TickOutcome::Skipped);
		};

		let result = self.run_tick().await;
		match &result {
			Ok(outcome) => {
				self.consecutive_failures.store(0, Ordering::Release);
				self.set_phase(SyncPhase::Idle);
				let mut progress = self.progress.lock().await;
				progress.log_progress(false);
				debug!(?outcome, "Tick finished");
			}
			Err(e) if e.is_fatal() => {
				error!(error = %e, "Synchronizer halted");
				self.set_phase(SyncPhase::Halted(e.to_string()));
				self.progress.lock().await.log_progress(true);
			}
			Err(e) => {
				let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
				warn!(error = %e, consecutive_failures = failures, "Tick failed, cursors unchanged");
				self.progress.lock().await.record_failure();
				self.set_phase(SyncPhase::Idle);
			}
		}
		result
	}

	async fn run_tick(&self) -> Result<TickOutcome, SyncError> {
		self.set_phase(SyncPhase::Polling);
		let global = self.store.read_global()?;
		let remote_tip = self.source.tip_height().await?;
		if self.shutdown.is_cancelled() {
			return Ok(TickOutcome::Cancelled);
		}

		// Fetch only what the remote serves now; the recorded tip never moves back outside a
		// rollback, even when a lagging replica answers.
		let fetch_tip = remote_tip.max(global.last_synced_height);
		let tip_height = fetch_tip.max(global.tip_height);
		if remote_tip < global.tip_height {
			debug!(remote_tip, recorded_tip = global.tip_height, "Remote tip behind the recorded tip");
		}
		let mut advanced = GlobalSyncState {
			last_synced_height: global.last_synced_height,
			tip_height,
		};
		let mut outcome = TickOutcome::UpToDate;
		let mut new_transactions = Vec::new();

		if fetch_tip > global.last_synced_height {
			let from_height = global.last_synced_height + 1;
			let count = (fetch_tip - global.last_synced_height).min(self.max_blocks_per_tick);
			let blocks = self.source.blocks_range(from_height, count).await?;
			let blocks = validate_blocks(from_height, blocks)?;
			if self.shutdown.is_cancelled() {
				return Ok(TickOutcome::Cancelled);
			}

			self.set_phase(SyncPhase::ReorgCheck);
			if let ChainLink::Forked { fork_height } = self
				.detector
				.check(&blocks[0], self.store.as_ref(), self.source.as_ref())
				.await?
			{
				self.repair_reorg(fork_height).await?;
				return Ok(TickOutcome::Reorged { fork_height });
			}

			self.set_phase(SyncPhase::Persisting);
			let to_height = blocks[blocks.len() - 1].height;
			let transactions = self.fetch_transactions(from_height, to_height).await?;
			if self.shutdown.is_cancelled() {
				return Ok(TickOutcome::Cancelled);
			}

			advanced.last_synced_height = to_height;
			self.store.persist_blocks(&blocks, &transactions, &advanced)?;
			info!(
				from_height,
				to_height,
				transactions = transactions.len(),
				tip_height,
				"Persisted blocks"
			);
			self.progress.lock().await.record_blocks(
				blocks.len() as u64,
				transactions.len() as u64,
				to_height,
			);

			outcome = TickOutcome::Advanced {
				from_height,
				to_height,
				transactions: transactions.len(),
			};
			new_transactions = transactions;
		} else if tip_height != global.tip_height {
			self.store.write_global(&advanced)?;
		}

		self.set_phase(SyncPhase::Dispatching);
		self.serve_plugins(
			global.last_synced_height,
			advanced.last_synced_height,
			&new_transactions,
		)
		.await?;
		if self.shutdown.is_cancelled() {
			debug!(?outcome, "Shutdown requested while serving plugins");
			return Ok(TickOutcome::Cancelled);
		}

		Ok(outcome)
	}

	/// Transactions of `from_height..=to_height` in chain order, dropping any the middleware
	/// returned from outside the range.
	async fn fetch_transactions(
		&self,
		from_height: u64,
		to_height: u64,
	) -> Result<Vec<Transaction>, SyncError> {
		let mut transactions = collect_transactions(
			self.source.as_ref(),
			TransactionQuery::heights(from_height, to_height),
		)
		.await?;

		let fetched = transactions.len();
		transactions.retain(|tx| (from_height..=to_height).contains(&tx.block_height));
		if transactions.len() < fetched {
			warn!(
				from_height,
				to_height,
				dropped = fetched - transactions.len(),
				"Dropped transactions outside the fetched range"
			);
		}
		sort_chain_order(&mut transactions);
		Ok(transactions)
	}

	async fn repair_reorg(&self, fork_height: u64) -> Result<(), SyncError> {
		let summary = self.store.rollback_to(fork_height)?;
		warn!(
			fork_height,
			removed_blocks = summary.removed_blocks,
			removed_transactions = summary.removed_transactions,
			plugins = ?summary.rolled_back_plugins,
			"Rolled back chain reorganization"
		);
		self.progress.lock().await.record_reorg(fork_height);

		self.set_phase(SyncPhase::Dispatching);
		let plugins = self.registry.snapshot().await;
		let states = self.plugin_states()?;
		self.dispatcher.settle_rollbacks(&plugins, &states).await;
		Ok(())
	}

	fn plugin_states(&self) -> Result<HashMap<String, PluginSyncState>, SyncError> {
		Ok(self
			.store
			.read_plugins()?
			.into_iter()
			.map(|state| (state.plugin_name.clone(), state))
			.collect())
	}

	/// Deliver the tick's transactions to caught-up plugins and backfill the rest, concurrently.
	async fn serve_plugins(
		&self,
		previous_height: u64,
		synced_height: u64,
		new_transactions: &[Transaction],
	) -> Result<(), SyncError> {
		let plugins = self.registry.snapshot().await;
		if plugins.is_empty() {
			return Ok(());
		}
		let states = self.plugin_states()?;
		let blocked = self.dispatcher.settle_rollbacks(&plugins, &states).await;
		if self.shutdown.is_cancelled() {
			return Ok(());
		}

		let mut live: Vec<Arc<RegisteredPlugin>> = Vec::new();
		let mut lagging: Vec<(Arc<RegisteredPlugin>, u64)> = Vec::new();
		for plugin in plugins {
			let Some(state) = states.get(plugin.name()) else {
				continue;
			};
			if !state.is_active || blocked.contains(plugin.name()) {
				continue;
			}
			if state.last_synced_height >= previous_height {
				live.push(plugin);
			} else {
				lagging.push((plugin, state.last_synced_height));
			}
		}

		let (dispatched, backfilled) = tokio::join!(
			self.dispatch_live(&live, new_transactions, synced_height),
			join_all(lagging.iter().map(|(plugin, cursor)| async move {
				let result = self.backfill.catch_up(plugin, *cursor, synced_height).await;
				(plugin.name(), result)
			}))
		);

		let mut delivered = dispatched.as_ref().map_or(0, |report| report.delivered);
		let mut store_error = dispatched.err();
		for (name, result) in backfilled {
			match result {
				Ok(BackfillReport {
					delivered: count,
					cursor,
					..
				}) => {
					delivered += count;
					debug!(plugin = name, cursor, "Backfill finished");
				}
				Err(e @ SyncError::PluginCallback { .. }) => {
					warn!(error = %e, "Backfill stopped, will resume next tick");
				}
				Err(e) => {
					error!(plugin = name, error = %e, "Backfill failed");
					store_error.get_or_insert(e);
				}
			}
		}
		self.progress.lock().await.record_delivered(delivered);

		match store_error {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	async fn dispatch_live(
		&self,
		plugins: &[Arc<RegisteredPlugin>],
		transactions: &[Transaction],
		synced_height: u64,
	) -> Result<DispatchReport, SyncError> {
		if plugins.is_empty() {
			return Ok(DispatchReport::default());
		}
		self.dispatcher
			.dispatch(plugins, transactions, synced_height)
			.await
	}
}

/// Blocks must start at `from_height` and form one parent-linked run.
fn validate_blocks(from_height: u64, blocks: Vec<Block>) -> Result<Vec<Block>, SyncError> {
	match blocks.first() {
		None => {
			return Err(SyncError::InconsistentRemote(format!(
				"no blocks returned from height {}",
				from_height
			)));
		}
		Some(first) if first.height != from_height => {
			return Err(SyncError::InconsistentRemote(format!(
				"expected block {} first, got {}",
				from_height, first.height
			)));
		}
		Some(_) => {}
	}

	if let Some((parent, child)) = blocks
		.iter()
		.tuple_windows()
		.find(|(parent, child)| !child.extends(parent))
	{
		return Err(SyncError::InconsistentRemote(format!(
			"block {} at height {} does not extend {} at height {}",
			child.hash, child.height, parent.hash, parent.height
		)));
	}
	Ok(blocks)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sync::health::HealthStatus;
	use crate::sync::plugins::TransactionFilter;
	use crate::sync::types::PluginError;
	use crate::test_utils::{MockLedger, RecordingPlugin, contract_call, main_chain, memory_store};

	fn config(max_blocks_per_tick: u64) -> SyncConfig {
		SyncConfig {
			max_blocks_per_tick,
			backfill_batch_blocks: 3,
			reorg_depth: 5,
			sync_interval_ms: 10,
			..SyncConfig::default()
		}
	}

	struct Harness {
		ledger: Arc<MockLedger>,
		store: Arc<dyn LedgerStore>,
		orchestrator: SyncOrchestrator,
		shutdown: CancellationToken,
	}

	fn harness(ledger: MockLedger, max_blocks_per_tick: u64) -> Harness {
		let ledger = Arc::new(ledger);
		let store = memory_store();
		let shutdown = CancellationToken::new();
		let orchestrator = SyncOrchestrator::new(
			&config(max_blocks_per_tick),
			store.clone(),
			ledger.clone(),
			shutdown.clone(),
		)
		.unwrap();
		Harness {
			ledger,
			store,
			orchestrator,
			shutdown,
		}
	}

	fn chain_with_transactions(tip: u64) -> MockLedger {
		let ledger = MockLedger::with_chain(tip);
		for height in 1..=tip {
			ledger.add_transactions(height, 1);
		}
		ledger
	}

	impl Harness {
		async fn sync_until_up_to_date(&self) {
			loop {
				let outcome = self.orchestrator.tick().await.unwrap();
				self.assert_cursor_invariants();
				if outcome == TickOutcome::UpToDate {
					return;
				}
			}
		}

		fn cursor(&self, name: &str) -> u64 {
			self.store
				.read_plugin(name)
				.unwrap()
				.unwrap()
				.last_synced_height
		}

		fn assert_cursor_invariants(&self) {
			let global = self.store.read_global().unwrap();
			assert!(global.last_synced_height <= global.tip_height);
			for plugin in self.store.read_plugins().unwrap() {
				assert!(
					plugin.last_synced_height <= global.last_synced_height,
					"{} ahead of the global cursor",
					plugin.plugin_name
				);
			}
			let blocks = self
				.store
				.blocks_in_range(0, global.last_synced_height)
				.unwrap();
			assert!(blocks.iter().tuple_windows().all(|(a, b)| b.extends(a)));
		}
	}

	#[tokio::test]
	async fn mirrors_the_chain_and_feeds_plugins() {
		let ledger = chain_with_transactions(10);
		ledger.push_transaction(contract_call("main", 4, 5, "ct_1", "mint"));
		let h = harness(ledger, 4);

		let all = Arc::new(RecordingPlugin::new("all", 1));
		let minter = Arc::new(
			RecordingPlugin::new("minter", 1).with_filters(vec![
				TransactionFilter::any()
					.with_type("ContractCallTx")
					.with_contract_ids(["ct_1"]),
			]),
		);
		h.orchestrator.register_plugin(all.clone()).await.unwrap();
		h.orchestrator.register_plugin(minter.clone()).await.unwrap();

		assert_eq!(
			h.orchestrator.tick().await.unwrap(),
			TickOutcome::Advanced {
				from_height: 1,
				to_height: 4,
				transactions: 5
			}
		);
		h.sync_until_up_to_date().await;

		let global = h.store.read_global().unwrap();
		assert_eq!(global.last_synced_height, 10);
		assert_eq!(global.tip_height, 10);
		assert_eq!(h.cursor("all"), 10);
		assert_eq!(h.cursor("minter"), 10);

		assert_eq!(all.received_hashes().len(), 11);
		let heights = all.received_heights();
		assert!(heights.windows(2).all(|pair| pair[0] <= pair[1]));
		assert_eq!(minter.received_hashes(), vec!["th_main_4_5"]);

		let stats = h.orchestrator.stats().await;
		assert_eq!(stats.blocks_synced, 10);
		assert_eq!(stats.transactions_synced, 11);
	}

	#[tokio::test]
	async fn reorg_rolls_back_and_notifies_before_new_data() {
		let h = harness(chain_with_transactions(10), 100);
		let plugin = Arc::new(RecordingPlugin::new("tips", 1));
		h.orchestrator.register_plugin(plugin.clone()).await.unwrap();
		h.sync_until_up_to_date().await;
		assert_eq!(h.cursor("tips"), 10);

		h.ledger.fork_from(6, "fork", 12);
		for height in 7..=12 {
			h.ledger.add_transactions(height, 1);
		}

		assert_eq!(
			h.orchestrator.tick().await.unwrap(),
			TickOutcome::Reorged { fork_height: 6 }
		);
		h.assert_cursor_invariants();
		assert_eq!(plugin.reorgs(), vec![6]);
		assert_eq!(h.cursor("tips"), 6);
		assert_eq!(h.store.block_hash_at(7).unwrap(), None);
		assert_eq!(h.store.read_global().unwrap().last_synced_height, 6);
		assert!(h.store.transactions_in_range(7, 10).unwrap().is_empty());

		h.sync_until_up_to_date().await;
		assert_eq!(h.store.block_hash_at(12).unwrap().as_deref(), Some("kh_fork_12"));
		assert_eq!(h.cursor("tips"), 12);
		let hashes = plugin.received_hashes();
		assert!(hashes.contains(&"th_fork_7_0".to_string()));
		assert!(!hashes.contains(&"th_main_7_0".to_string()));
	}

	#[tokio::test]
	async fn reorg_notification_is_retried_before_delivery() {
		let h = harness(chain_with_transactions(10), 100);
		let plugin = Arc::new(RecordingPlugin::new("tips", 1).failing_reorgs(1));
		h.orchestrator.register_plugin(plugin.clone()).await.unwrap();
		h.sync_until_up_to_date().await;

		h.ledger.fork_from(6, "fork", 12);
		h.orchestrator.tick().await.unwrap();
		assert!(plugin.reorgs().is_empty());
		assert_eq!(
			h.store.read_plugin("tips").unwrap().unwrap().pending_rollback,
			Some(6)
		);

		h.sync_until_up_to_date().await;
		assert_eq!(plugin.reorgs(), vec![6]);
		assert_eq!(
			h.store.read_plugin("tips").unwrap().unwrap().pending_rollback,
			None
		);
		assert_eq!(h.cursor("tips"), 12);
	}

	#[tokio::test]
	async fn too_deep_reorg_halts() {
		let h = harness(chain_with_transactions(10), 100);
		h.sync_until_up_to_date().await;

		let mut phases = h.orchestrator.subscribe_phase();

		h.ledger.fork_from(2, "fork", 11);
		let err = h.orchestrator.tick().await.unwrap_err();
		assert!(matches!(err, SyncError::ReorgTooDeep { .. }));
		assert!(h.orchestrator.phase().is_halted());
		assert!(phases.has_changed().unwrap());
		assert!(phases.borrow_and_update().is_halted());

		let health = h.orchestrator.health().unwrap();
		assert_eq!(health.status, HealthStatus::Halted);
		assert!(health.halted_reason.is_some());

		assert_eq!(h.orchestrator.tick().await.unwrap(), TickOutcome::Halted);
		assert_eq!(h.store.read_global().unwrap().last_synced_height, 10);
		assert!(h.orchestrator.run().await.is_err());
	}

	#[tokio::test]
	async fn lagging_remote_tip_never_lowers_the_recorded_tip() {
		let h = harness(chain_with_transactions(10), 3);
		h.orchestrator.tick().await.unwrap();
		assert_eq!(h.store.read_global().unwrap().tip_height, 10);

		// Same chain, served by a replica two blocks behind.
		h.ledger.fork_from(10, "main", 8);
		loop {
			let outcome = h.orchestrator.tick().await.unwrap();
			h.assert_cursor_invariants();
			assert_eq!(h.store.read_global().unwrap().tip_height, 10);
			if outcome == TickOutcome::UpToDate {
				break;
			}
		}
		assert_eq!(h.store.read_global().unwrap().last_synced_height, 8);

		h.ledger.extend_chain(12);
		h.sync_until_up_to_date().await;
		let global = h.store.read_global().unwrap();
		assert_eq!(global.last_synced_height, 12);
		assert_eq!(global.tip_height, 12);
	}

	/// Requests shutdown from inside its first delivery.
	struct ShutdownPlugin(CancellationToken);

	#[async_trait::async_trait]
	impl SyncPlugin for ShutdownPlugin {
		fn name(&self) -> &str {
			"shutdown"
		}

		fn start_from_height(&self) -> u64 {
			1
		}

		fn filters(&self) -> Vec<TransactionFilter> {
			vec![TransactionFilter::any()]
		}

		async fn on_transactions_saved(&self, _transactions: &[Transaction]) -> Result<(), PluginError> {
			self.0.cancel();
			Ok(())
		}
	}

	#[tokio::test]
	async fn shutdown_while_serving_plugins_reports_cancelled() {
		let h = harness(chain_with_transactions(4), 100);
		h.orchestrator
			.register_plugin(Arc::new(ShutdownPlugin(h.shutdown.clone())))
			.await
			.unwrap();

		assert_eq!(h.orchestrator.tick().await.unwrap(), TickOutcome::Cancelled);
		// The mirrored blocks and the delivered batch were committed before shutdown was seen.
		assert_eq!(h.store.read_global().unwrap().last_synced_height, 4);
		assert_eq!(h.cursor("shutdown"), 4);
	}

	#[tokio::test]
	async fn failing_plugin_catches_up_on_the_next_tick() {
		let h = harness(chain_with_transactions(6), 3);
		let flaky = Arc::new(RecordingPlugin::new("a", 1));
		let steady = Arc::new(RecordingPlugin::new("b", 1));
		h.orchestrator.register_plugin(flaky.clone()).await.unwrap();
		h.orchestrator.register_plugin(steady.clone()).await.unwrap();

		h.orchestrator.tick().await.unwrap();
		assert_eq!(h.cursor("a"), 3);

		flaky.fail_next_batches(1);
		h.orchestrator.tick().await.unwrap();
		assert_eq!(h.cursor("a"), 3);
		assert_eq!(h.cursor("b"), 6);
		h.assert_cursor_invariants();

		assert_eq!(h.orchestrator.tick().await.unwrap(), TickOutcome::UpToDate);
		assert_eq!(h.cursor("a"), 6);
		assert_eq!(flaky.received_hashes(), steady.received_hashes());
	}

	#[tokio::test]
	async fn late_plugin_is_backfilled_from_the_mirror() {
		let h = harness(chain_with_transactions(9), 100);
		h.sync_until_up_to_date().await;

		let late = Arc::new(RecordingPlugin::new("late", 4));
		let state = h.orchestrator.register_plugin(late.clone()).await.unwrap();
		assert_eq!(state.last_synced_height, 3);

		h.orchestrator.tick().await.unwrap();
		assert_eq!(h.cursor("late"), 9);
		assert_eq!(late.received_heights(), vec![4, 5, 6, 7, 8, 9]);
		// Three-height batches: 4..=6 and 7..=9.
		assert_eq!(late.batch_count(), 2);
		assert_eq!(h.ledger.page_requests(), 1);
	}

	#[tokio::test]
	async fn inactive_plugins_are_skipped() {
		let h = harness(chain_with_transactions(5), 100);
		let plugin = Arc::new(RecordingPlugin::new("paused", 1));
		h.orchestrator.register_plugin(plugin.clone()).await.unwrap();
		h.orchestrator.registry().deactivate("paused").await.unwrap();

		h.sync_until_up_to_date().await;
		assert!(plugin.received_hashes().is_empty());
		assert_eq!(h.cursor("paused"), 0);

		h.orchestrator.registry().activate("paused").await.unwrap();
		h.orchestrator.tick().await.unwrap();
		assert_eq!(h.cursor("paused"), 5);
		assert_eq!(plugin.received_hashes().len(), 5);
	}

	#[tokio::test]
	async fn network_failure_degrades_without_moving_cursors() {
		let h = harness(chain_with_transactions(5), 100);
		h.ledger.fail_next(1);

		let err = h.orchestrator.tick().await.unwrap_err();
		assert!(matches!(err, SyncError::Network(_)));
		assert!(!err.is_fatal());
		assert_eq!(h.orchestrator.phase(), SyncPhase::Idle);
		assert_eq!(
			h.orchestrator.health().unwrap().status,
			HealthStatus::Degraded
		);
		assert_eq!(h.store.read_global().unwrap().last_synced_height, 0);

		h.sync_until_up_to_date().await;
		assert_eq!(h.orchestrator.health().unwrap().status, HealthStatus::Ok);
		assert_eq!(h.store.read_global().unwrap().last_synced_height, 5);
	}

	#[tokio::test]
	async fn concurrent_tick_is_skipped() {
		let h = harness(
			chain_with_transactions(3).with_latency(Duration::from_millis(20)),
			100,
		);

		let (first, second) = tokio::join!(h.orchestrator.tick(), h.orchestrator.tick());
		let outcomes = [first.unwrap(), second.unwrap()];
		assert!(outcomes.contains(&TickOutcome::Skipped));
		assert!(outcomes.iter().any(|o| matches!(o, TickOutcome::Advanced { .. })));

		assert!(matches!(
			h.orchestrator.tick().await.unwrap(),
			TickOutcome::UpToDate
		));
	}

	#[tokio::test]
	async fn cancelled_tick_persists_nothing() {
		let h = harness(chain_with_transactions(5), 100);
		h.shutdown.cancel();

		assert_eq!(h.orchestrator.tick().await.unwrap(), TickOutcome::Cancelled);
		assert_eq!(h.store.read_global().unwrap().last_synced_height, 0);
		assert!(h.orchestrator.run().await.is_ok());
	}

	#[tokio::test]
	async fn non_contiguous_blocks_are_rejected() {
		let mut blocks = main_chain(4);
		blocks.remove(2);
		assert!(matches!(
			validate_blocks(1, blocks),
			Err(SyncError::InconsistentRemote(_))
		));
		assert!(matches!(
			validate_blocks(2, main_chain(3)),
			Err(SyncError::InconsistentRemote(_))
		));
		assert!(validate_blocks(1, main_chain(3)).is_ok());
	}
}
