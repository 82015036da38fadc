//! Progress tracking for ledger synchronization.
//!
//! `SyncProgressTracker` counts what the sync loop has mirrored and delivered since the
//! process started, and logs a summary at regular height intervals.

use tracing::info;

/// Heights between two progress log lines.
const LOG_EVERY_HEIGHTS: u64 = 1000;

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
	/// Global cursor when the session started
	start_height: u64,
	/// The highest height mirrored in this session
	highest_synced_height: u64,
	blocks_synced: u64,
	transactions_synced: u64,
	/// Transactions handed to plugins, summed over plugins
	transactions_delivered: u64,
	reorgs: u64,
	last_fork_height: Option<u64>,
	failed_ticks: u64,
	/// Height at which we last logged progress
	last_logged_height: u64,
}

impl SyncProgressTracker {
	/// Create a new progress tracker starting from the given height.
	pub fn new(start_height: u64) -> Self {
		Self {
			start_height,
			highest_synced_height: start_height,
			blocks_synced: 0,
			transactions_synced: 0,
			transactions_delivered: 0,
			reorgs: 0,
			last_fork_height: None,
			failed_ticks: 0,
			last_logged_height: start_height,
		}
	}

	/// Record a persisted batch of blocks ending at `to_height`.
	pub fn record_blocks(&mut self, blocks: u64, transactions: u64, to_height: u64) {
		self.blocks_synced += blocks;
		self.transactions_synced += transactions;
		self.highest_synced_height = self.highest_synced_height.max(to_height);
	}

	pub fn record_delivered(&mut self, transactions: usize) {
		self.transactions_delivered += transactions as u64;
	}

	/// Record a rollback; later progress is measured from the fork point.
	pub fn record_reorg(&mut self, fork_height: u64) {
		self.reorgs += 1;
		self.last_fork_height = Some(fork_height);
		self.highest_synced_height = self.highest_synced_height.min(fork_height);
		self.last_logged_height = self.last_logged_height.min(fork_height);
	}

	pub fn record_failure(&mut self) {
		self.failed_ticks += 1;
	}

	/// Log progress every 1000 heights or when forced
	pub fn log_progress(&mut self, force: bool) {
		let heights_since_last_log = self
			.highest_synced_height
			.saturating_sub(self.last_logged_height);
		if force || heights_since_last_log >= LOG_EVERY_HEIGHTS {
			info!("{}", self.get_stats().summary());
			self.last_logged_height = self.highest_synced_height;
		}
	}

	pub fn get_stats(&self) -> SyncStats {
		SyncStats {
			start_height: self.start_height,
			highest_synced_height: self.highest_synced_height,
			blocks_synced: self.blocks_synced,
			transactions_synced: self.transactions_synced,
			transactions_delivered: self.transactions_delivered,
			reorgs: self.reorgs,
			last_fork_height: self.last_fork_height,
			failed_ticks: self.failed_ticks,
		}
	}
}

/// Statistics about the sync progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
	pub start_height: u64,
	pub highest_synced_height: u64,
	pub blocks_synced: u64,
	pub transactions_synced: u64,
	pub transactions_delivered: u64,
	pub reorgs: u64,
	pub last_fork_height: Option<u64>,
	pub failed_ticks: u64,
}

impl SyncStats {
	/// Get a human-readable summary of the sync statistics
	pub fn summary(&self) -> String {
		format!(
			"Sync from {} to {}: {} blocks, {} transactions, {} deliveries{}{}",
			self.start_height,
			self.highest_synced_height,
			self.blocks_synced,
			self.transactions_synced,
			self.transactions_delivered,
			match self.last_fork_height {
				Some(fork) => format!(", {} reorgs (last at {})", self.reorgs, fork),
				None => String::new(),
			},
			if self.failed_ticks == 0 {
				String::new()
			} else {
				format!(" ({} failed ticks)", self.failed_ticks)
			}
		)
	}
}
