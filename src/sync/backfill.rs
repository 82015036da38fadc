//! Batched historical catch-up for plugins whose cursor lags the global cursor.

use crate::middleware::{
	LedgerSource, Transaction, TransactionQuery, collect_transactions, sort_chain_order,
};
use crate::sync::plugins::RegisteredPlugin;
use crate::sync::repositories::LedgerStore;
use crate::sync::types::SyncError;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Splits `(after, through]` into inclusive `(from, to)` batches of at most `size` heights.
///
/// The iterator is lazy and can be recreated from any cursor to resume.
#[derive(Debug, Clone)]
pub struct BatchRange {
	next: u64,
	through: u64,
	size: u64,
}

impl BatchRange {
	pub fn new(after: u64, through: u64, size: u64) -> Self {
		Self {
			next: after + 1,
			through,
			size: size.max(1),
		}
	}
}

impl Iterator for BatchRange {
	type Item = (u64, u64);

	fn next(&mut self) -> Option<Self::Item> {
		if self.next > self.through {
			return None;
		}
		let from = self.next;
		let to = from.saturating_add(self.size - 1).min(self.through);
		self.next = to + 1;
		Some((from, to))
	}
}

/// Outcome of one catch-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
	pub batches: usize,
	pub delivered: usize,
	/// Cursor after the run.
	pub cursor: u64,
}

/// Replays mirrored (or remote) history to a single plugin.
pub struct BackfillScheduler {
	store: Arc<dyn LedgerStore>,
	source: Arc<dyn LedgerSource>,
	batch_blocks: u64,
	shutdown: CancellationToken,
}

impl BackfillScheduler {
	pub fn new(
		store: Arc<dyn LedgerStore>,
		source: Arc<dyn LedgerSource>,
		batch_blocks: u64,
		shutdown: CancellationToken,
	) -> Self {
		Self {
			store,
			source,
			batch_blocks,
			shutdown,
		}
	}

	/// Deliver heights `(cursor, target]` to `plugin`, persisting the cursor after every batch.
	///
	/// # Errors
	/// Stops at the first failing batch; the cursor stays at the last completed one.
	pub async fn catch_up(
		&self,
		plugin: &RegisteredPlugin,
		cursor: u64,
		target: u64,
	) -> Result<BackfillReport, SyncError> {
		let mut report = BackfillReport {
			cursor,
			..BackfillReport::default()
		};

		// Heights below the plugin's start are never delivered.
		let begin = cursor
			.max(plugin.start_from_height().saturating_sub(1))
			.min(target);
		if begin > cursor {
			self.store.write_plugin(plugin.name(), begin)?;
			report.cursor = begin;
		}

		info!(
			plugin = plugin.name(),
			from_height = begin + 1,
			to_height = target,
			"Backfilling plugin"
		);

		for (from, to) in BatchRange::new(begin, target, self.batch_blocks) {
			if self.shutdown.is_cancelled() {
				debug!(plugin = plugin.name(), cursor = report.cursor, "Backfill cancelled");
				break;
			}

			let transactions = self.load_batch(from, to).await?;
			let selected = plugin.select(&transactions);
			if !selected.is_empty() {
				plugin
					.plugin()
					.on_transactions_saved(&selected)
					.await
					.map_err(|source| SyncError::PluginCallback {
						plugin: plugin.name().to_string(),
						source,
					})?;
			}

			self.store.write_plugin(plugin.name(), to)?;
			report.batches += 1;
			report.delivered += selected.len();
			report.cursor = to;
			debug!(plugin = plugin.name(), from, to, delivered = selected.len(), "Backfill batch done");
		}

		Ok(report)
	}

	/// Transactions of `from..=to`, from the local mirror when it covers the range.
	async fn load_batch(&self, from: u64, to: u64) -> Result<Vec<Transaction>, SyncError> {
		let mirrored = self
			.store
			.lowest_block_height()?
			.is_some_and(|lowest| lowest <= from);
		if mirrored {
			return Ok(self.store.transactions_in_range(from, to)?);
		}

		debug!(from, to, "Batch predates the local mirror, fetching from middleware");
		let mut transactions =
			collect_transactions(self.source.as_ref(), TransactionQuery::heights(from, to)).await?;
		transactions.retain(|tx| (from..=to).contains(&tx.block_height));
		sort_chain_order(&mut transactions);
		Ok(transactions)
	}
}
