//! Delivery of confirmed transactions and reorg notifications to plugins.
//!
//! The [`Dispatcher`] fans each batch out to every plugin concurrently. A failing plugin is
//! logged and left behind at its previous cursor; the other plugins are not affected by it.

use crate::middleware::Transaction;
use crate::sync::plugins::RegisteredPlugin;
use crate::sync::repositories::LedgerStore;
use crate::sync::types::{PluginSyncState, SyncError};

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result of delivering one batch to the caught-up plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
	/// Plugins whose cursor moved to the end of the batch.
	pub advanced: Vec<String>,
	/// Plugins whose callback failed.
	pub failed: Vec<String>,
	/// Transactions handed to plugins, summed over plugins.
	pub delivered: usize,
}

enum Delivery {
	Delivered { name: String, count: usize },
	Failed { name: String },
}

/// Invokes plugin callbacks and commits the resulting cursors.
pub struct Dispatcher {
	store: Arc<dyn LedgerStore>,
}

impl Dispatcher {
	pub fn new(store: Arc<dyn LedgerStore>) -> Self {
		Self { store }
	}

	/// Deliver the unacknowledged reorg notifications.
	///
	/// Returns the plugins that still have a pending notification; nothing above the fork may
	/// be delivered to them until it succeeds.
	pub async fn settle_rollbacks(
		&self,
		plugins: &[Arc<RegisteredPlugin>],
		states: &HashMap<String, PluginSyncState>,
	) -> HashSet<String> {
		let pending = plugins.iter().filter_map(|plugin| {
			let state = states.get(plugin.name())?;
			let fork_height = state.pending_rollback?;
			state.is_active.then_some((plugin, fork_height))
		});

		let results = join_all(pending.map(|(plugin, fork_height)| async move {
			match plugin.plugin().on_reorg(fork_height).await {
				Ok(()) => match self.store.clear_pending_rollback(plugin.name(), fork_height) {
					Ok(()) => {
						info!(plugin = plugin.name(), fork_height, "Plugin rolled back");
						None
					}
					Err(e) => {
						error!(plugin = plugin.name(), error = %e, "Failed to acknowledge rollback");
						Some(plugin.name().to_string())
					}
				},
				Err(source) => {
					let e = SyncError::PluginCallback {
						plugin: plugin.name().to_string(),
						source,
					};
					error!(fork_height, error = %e, "Reorg notification failed, will retry");
					Some(plugin.name().to_string())
				}
			}
		}))
		.await;

		results.into_iter().flatten().collect()
	}

	/// Deliver `transactions`, the contents of heights up to `to_height`, to caught-up plugins.
	///
	/// Every plugin is called concurrently with its matching subset; plugins without a match
	/// advance without a call. Successful cursors are written in one transaction once every
	/// plugin has finished.
	pub async fn dispatch(
		&self,
		plugins: &[Arc<RegisteredPlugin>],
		transactions: &[Transaction],
		to_height: u64,
	) -> Result<DispatchReport, SyncError> {
		let deliveries = join_all(plugins.iter().map(|plugin| async move {
			let selected = plugin.select(transactions);
			if selected.is_empty() {
				return Delivery::Delivered {
					name: plugin.name().to_string(),
					count: 0,
				};
			}

			debug!(plugin = plugin.name(), count = selected.len(), "Dispatching transactions");
			match plugin.plugin().on_transactions_saved(&selected).await {
				Ok(()) => Delivery::Delivered {
					name: plugin.name().to_string(),
					count: selected.len(),
				},
				Err(source) => {
					let e = SyncError::PluginCallback {
						plugin: plugin.name().to_string(),
						source,
					};
					error!(to_height, error = %e, "Plugin failed, cursor not advanced");
					Delivery::Failed {
						name: plugin.name().to_string(),
					}
				}
			}
		}))
		.await;

		let mut report = DispatchReport::default();
		for delivery in deliveries {
			match delivery {
				Delivery::Delivered { name, count } => {
					report.delivered += count;
					report.advanced.push(name);
				}
				Delivery::Failed { name } => report.failed.push(name),
			}
		}

		let cursors: Vec<(String, u64)> = report
			.advanced
			.iter()
			.map(|name| (name.clone(), to_height))
			.collect();
		self.store.write_plugins(&cursors)?;

		Ok(report)
	}
}
