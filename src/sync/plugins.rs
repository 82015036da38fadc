//! Plugin contract, transaction filters and the plugin registry.
//!
//! A plugin declares which transactions it cares about through a list of
//! [`TransactionFilter`] entries and receives them in chain order through
//! [`SyncPlugin::on_transactions_saved`]. The registry keeps every plugin together with the
//! filters it declared at registration time, and owns the mapping to its persisted cursor.

use crate::middleware::{Transaction, sort_chain_order};
use crate::sync::repositories::LedgerStore;
use crate::sync::types::{PluginError, PluginSyncState, SyncError};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Extra condition evaluated after the structural fields of a filter.
pub type TransactionPredicate = Arc<dyn Fn(&Transaction) -> bool + Send + Sync>;

/// One filter entry. Every field that is set must match; an entry with no fields matches
/// every transaction.
#[derive(Clone, Default)]
pub struct TransactionFilter {
	pub tx_type: Option<String>,
	pub contract_ids: Option<Vec<String>>,
	pub functions: Option<Vec<String>>,
	pub predicate: Option<TransactionPredicate>,
}

impl fmt::Debug for TransactionFilter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TransactionFilter")
			.field("tx_type", &self.tx_type)
			.field("contract_ids", &self.contract_ids)
			.field("functions", &self.functions)
			.field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
			.finish()
	}
}

impl TransactionFilter {
	/// Matches everything.
	pub fn any() -> Self {
		Self::default()
	}

	pub fn with_type(mut self, tx_type: impl Into<String>) -> Self {
		self.tx_type = Some(tx_type.into());
		self
	}

	pub fn with_contract_ids<I, S>(mut self, contract_ids: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.contract_ids = Some(contract_ids.into_iter().map(Into::into).collect());
		self
	}

	pub fn with_functions<I, S>(mut self, functions: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.functions = Some(functions.into_iter().map(Into::into).collect());
		self
	}

	pub fn with_predicate(
		mut self,
		predicate: impl Fn(&Transaction) -> bool + Send + Sync + 'static,
	) -> Self {
		self.predicate = Some(Arc::new(predicate));
		self
	}

	pub fn matches(&self, tx: &Transaction) -> bool {
		let contains = |allowed: &Option<Vec<String>>, value: &Option<String>| match allowed {
			None => true,
			Some(allowed) => value
				.as_ref()
				.is_some_and(|value| allowed.iter().any(|candidate| candidate == value)),
		};

		self.tx_type.as_ref().is_none_or(|t| *t == tx.tx_type)
			&& contains(&self.contract_ids, &tx.contract_id)
			&& contains(&self.functions, &tx.function)
			&& self.predicate.as_ref().is_none_or(|predicate| predicate(tx))
	}
}

/// A transaction is wanted when any entry matches. No entries means nothing is wanted.
pub fn matches_any(filters: &[TransactionFilter], tx: &Transaction) -> bool {
	filters.iter().any(|filter| filter.matches(tx))
}

/// A consumer of confirmed transactions.
///
/// Delivery is at-least-once: after a crash or a failed callback the same transactions may be
/// delivered again, so implementations should deduplicate by `tx_hash`.
#[async_trait]
pub trait SyncPlugin: Send + Sync {
	/// Unique name; keys the persisted cursor.
	fn name(&self) -> &str;

	/// First height this plugin wants to see.
	fn start_from_height(&self) -> u64;

	fn filters(&self) -> Vec<TransactionFilter>;

	/// Called with the matching transactions of one batch, in chain order.
	async fn on_transactions_saved(&self, transactions: &[Transaction]) -> Result<(), PluginError>;

	/// Called after everything above `fork_height` was rolled back.
	async fn on_reorg(&self, _fork_height: u64) -> Result<(), PluginError> {
		Ok(())
	}
}

/// A plugin as held by the registry, with the filters it declared when it was registered.
pub struct RegisteredPlugin {
	name: String,
	start_from_height: u64,
	filters: Vec<TransactionFilter>,
	plugin: Arc<dyn SyncPlugin>,
}

impl RegisteredPlugin {
	fn new(plugin: Arc<dyn SyncPlugin>) -> Self {
		Self {
			name: plugin.name().to_string(),
			start_from_height: plugin.start_from_height(),
			filters: plugin.filters(),
			plugin,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn start_from_height(&self) -> u64 {
		self.start_from_height
	}

	pub fn plugin(&self) -> &dyn SyncPlugin {
		self.plugin.as_ref()
	}

	/// The subset of `transactions` this plugin should receive, in chain order.
	pub fn select(&self, transactions: &[Transaction]) -> Vec<Transaction> {
		let mut selected: Vec<Transaction> = transactions
			.iter()
			.filter(|tx| tx.block_height >= self.start_from_height)
			.filter(|tx| matches_any(&self.filters, tx))
			.cloned()
			.collect();
		sort_chain_order(&mut selected);
		selected
	}
}

impl fmt::Debug for RegisteredPlugin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RegisteredPlugin")
			.field("name", &self.name)
			.field("start_from_height", &self.start_from_height)
			.field("filters", &self.filters)
			.finish()
	}
}

/// Registered plugins, keyed by name.
pub struct PluginRegistry {
	store: Arc<dyn LedgerStore>,
	plugins: RwLock<BTreeMap<String, Arc<RegisteredPlugin>>>,
}

impl PluginRegistry {
	pub fn new(store: Arc<dyn LedgerStore>) -> Self {
		Self {
			store,
			plugins: RwLock::new(BTreeMap::new()),
		}
	}

	/// Register `plugin` and make sure it has a persisted cursor.
	///
	/// # Errors
	/// `SyncError::DuplicatePlugin` if a plugin with the same name is already registered, in
	/// which case nothing changes.
	pub async fn register(
		&self,
		plugin: Arc<dyn SyncPlugin>,
	) -> Result<PluginSyncState, SyncError> {
		let registered = RegisteredPlugin::new(plugin);
		let mut plugins = self.plugins.write().await;
		if plugins.contains_key(registered.name()) {
			return Err(SyncError::DuplicatePlugin(registered.name().to_string()));
		}

		let state = self
			.store
			.register_plugin(registered.name(), registered.start_from_height())?;
		info!(
			plugin = registered.name(),
			cursor = state.last_synced_height,
			active = state.is_active,
			"Registered plugin"
		);
		plugins.insert(registered.name().to_string(), Arc::new(registered));
		Ok(state)
	}

	pub async fn activate(&self, name: &str) -> Result<(), SyncError> {
		self.set_active(name, true).await
	}

	/// Stop delivering to `name`. Its cursor is kept and still follows rollbacks.
	pub async fn deactivate(&self, name: &str) -> Result<(), SyncError> {
		self.set_active(name, false).await
	}

	async fn set_active(&self, name: &str, active: bool) -> Result<(), SyncError> {
		if !self.plugins.read().await.contains_key(name) {
			return Err(SyncError::UnknownPlugin(name.to_string()));
		}
		self.store.set_plugin_active(name, active)?;
		info!(plugin = name, active, "Plugin activation changed");
		Ok(())
	}

	pub async fn get(&self, name: &str) -> Option<Arc<RegisteredPlugin>> {
		self.plugins.read().await.get(name).cloned()
	}

	/// Every registered plugin, ordered by name.
	pub async fn snapshot(&self) -> Vec<Arc<RegisteredPlugin>> {
		self.plugins.read().await.values().cloned().collect()
	}

	pub async fn len(&self) -> usize {
		self.plugins.read().await.len()
	}
}
