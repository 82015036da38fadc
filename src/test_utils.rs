//! Shared fixtures for unit tests: an in-memory ledger source, recording plugins and builders
//! for blocks and transactions.

use crate::middleware::{
	Block, LedgerSource, MiddlewareError, PageCursor, Transaction, TransactionPage,
	TransactionQuery, sort_chain_order,
};
use crate::sync::plugins::{SyncPlugin, TransactionFilter};
use crate::sync::repositories::{LedgerStore, SqliteLedgerStore};
use crate::sync::types::PluginError;

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn block_hash(tag: &str, height: u64) -> String {
	format!("kh_{tag}_{height}")
}

/// Parent-linked blocks `from..=to`, the first one pointing at `parent_of_first`.
pub fn linked_blocks(from: u64, to: u64, tag: &str, parent_of_first: String) -> Vec<Block> {
	let mut parent = parent_of_first;
	(from..=to)
		.map(|height| {
			let block = Block {
				height,
				hash: block_hash(tag, height),
				parent_hash: parent.clone(),
				timestamp: 1_700_000_000_000 + height as i64 * 180_000,
			};
			parent = block.hash.clone();
			block
		})
		.collect()
}

pub fn main_chain(to: u64) -> Vec<Block> {
	linked_blocks(1, to, "main", block_hash("main", 0))
}

/// A transaction at `height` whose hash is `th_{tag}_{height}_{index}`.
pub fn transaction(tag: &str, height: u64, index: u64, tx_type: &str) -> Transaction {
	Transaction {
		tx_hash: format!("th_{tag}_{height}_{index}"),
		block_height: height,
		block_hash: format!("mh_{tag}_{height}"),
		tx_index: height * 1_000 + index,
		micro_time: (height * 1_000 + index) as i64,
		tx_type: tx_type.to_string(),
		contract_id: None,
		function: None,
		caller_id: None,
		sender_id: None,
		recipient_id: None,
		payload: json!({ "type": tx_type }),
	}
}

pub fn contract_call(
	tag: &str,
	height: u64,
	index: u64,
	contract_id: &str,
	function: &str,
) -> Transaction {
	let mut tx = transaction(tag, height, index, "ContractCallTx");
	tx.contract_id = Some(contract_id.to_string());
	tx.function = Some(function.to_string());
	tx.caller_id = Some("ak_caller".to_string());
	tx.payload = json!({
		"type": "ContractCallTx",
		"contract_id": contract_id,
		"function": function,
		"caller_id": "ak_caller",
	});
	tx
}

pub fn memory_store() -> Arc<dyn LedgerStore> {
	Arc::new(SqliteLedgerStore::open_in_memory(1).unwrap())
}

struct MockChain {
	blocks: BTreeMap<u64, Block>,
	tags: BTreeMap<u64, String>,
	transactions: BTreeMap<u64, Vec<Transaction>>,
	tip: u64,
}

impl MockChain {
	fn append(&mut self, to: u64, tag: &str) {
		let from = self.blocks.keys().next_back().map_or(1, |height| height + 1);
		if from > to {
			return;
		}
		let parent = self
			.blocks
			.get(&(from - 1))
			.map_or_else(|| block_hash(tag, from - 1), |block| block.hash.clone());
		for block in linked_blocks(from, to, tag, parent) {
			self.tags.insert(block.height, tag.to_string());
			self.blocks.insert(block.height, block);
		}
	}
}

/// In-memory [`LedgerSource`] with a mutable chain.
pub struct MockLedger {
	chain: Mutex<MockChain>,
	page_limit: usize,
	latency: Option<Duration>,
	page_requests: AtomicUsize,
	pending_failures: AtomicU32,
}

impl MockLedger {
	/// Main chain `1..=tip`, remote tip at `tip`.
	pub fn with_chain(tip: u64) -> Self {
		let mut chain = MockChain {
			blocks: BTreeMap::new(),
			tags: BTreeMap::new(),
			transactions: BTreeMap::new(),
			tip,
		};
		chain.append(tip, "main");
		Self {
			chain: Mutex::new(chain),
			page_limit: 100,
			latency: None,
			page_requests: AtomicUsize::new(0),
			pending_failures: AtomicU32::new(0),
		}
	}

	pub fn with_page_limit(mut self, page_limit: usize) -> Self {
		self.page_limit = page_limit;
		self
	}

	/// Delay every call, so concurrent callers overlap.
	pub fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = Some(latency);
		self
	}

	/// Append `count` `SpendTx` transactions to the block at `height`.
	pub fn add_transactions(&self, height: u64, count: u64) {
		let mut chain = self.chain.lock().unwrap();
		let tag = chain
			.tags
			.get(&height)
			.cloned()
			.unwrap_or_else(|| "main".to_string());
		let existing = chain.transactions.get(&height).map_or(0, Vec::len) as u64;
		let txs = chain.transactions.entry(height).or_default();
		for index in existing..existing + count {
			txs.push(transaction(&tag, height, index, "SpendTx"));
		}
	}

	pub fn push_transaction(&self, tx: Transaction) {
		let mut chain = self.chain.lock().unwrap();
		chain.transactions.entry(tx.block_height).or_default().push(tx);
	}

	/// Grow the current chain up to `tip`.
	pub fn extend_chain(&self, tip: u64) {
		let mut chain = self.chain.lock().unwrap();
		let tag = chain
			.tags
			.values()
			.next_back()
			.cloned()
			.unwrap_or_else(|| "main".to_string());
		chain.append(tip, &tag);
		chain.tip = chain.tip.max(tip);
	}

	/// Replace everything above `fork_height` with a branch tagged `tag` reaching `tip`.
	pub fn fork_from(&self, fork_height: u64, tag: &str, tip: u64) {
		let mut chain = self.chain.lock().unwrap();
		chain.blocks.retain(|height, _| *height <= fork_height);
		chain.tags.retain(|height, _| *height <= fork_height);
		chain.transactions.retain(|height, _| *height <= fork_height);
		chain.append(tip, tag);
		chain.tip = tip;
	}

	/// Make the next `count` calls fail with a 503.
	pub fn fail_next(&self, count: u32) {
		self.pending_failures.store(count, Ordering::SeqCst);
	}

	pub fn page_requests(&self) -> usize {
		self.page_requests.load(Ordering::SeqCst)
	}

	async fn enter(&self, endpoint: &str) -> Result<(), MiddlewareError> {
		if let Some(latency) = self.latency {
			tokio::time::sleep(latency).await;
		}
		let failed = self
			.pending_failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();
		if failed {
			return Err(MiddlewareError::Status {
				status: 503,
				url: format!("mock://{endpoint}"),
			});
		}
		Ok(())
	}
}

#[async_trait]
impl LedgerSource for MockLedger {
	async fn tip_height(&self) -> Result<u64, MiddlewareError> {
		self.enter("status").await?;
		Ok(self.chain.lock().unwrap().tip)
	}

	async fn blocks_range(
		&self,
		from_height: u64,
		count: u64,
	) -> Result<Vec<Block>, MiddlewareError> {
		self.enter("key-blocks").await?;
		let chain = self.chain.lock().unwrap();
		let to_height = (from_height + count).saturating_sub(1).min(chain.tip);
		if count == 0 || from_height > to_height {
			return Ok(Vec::new());
		}
		Ok(chain
			.blocks
			.range(from_height..=to_height)
			.map(|(_, block)| block.clone())
			.collect())
	}

	async fn transactions_page(
		&self,
		query: &TransactionQuery,
		cursor: Option<&PageCursor>,
	) -> Result<TransactionPage, MiddlewareError> {
		self.page_requests.fetch_add(1, Ordering::SeqCst);
		self.enter("transactions").await?;

		let chain = self.chain.lock().unwrap();
		let mut matching: Vec<Transaction> = chain
			.transactions
			.range(query.from_height..=query.to_height.min(chain.tip))
			.flat_map(|(_, txs)| txs.iter().cloned())
			.filter(|tx| query.tx_type.as_ref().is_none_or(|t| *t == tx.tx_type))
			.filter(|tx| {
				query
					.contract_id
					.as_ref()
					.is_none_or(|id| tx.contract_id.as_ref() == Some(id))
			})
			.collect();
		sort_chain_order(&mut matching);

		let offset = match cursor {
			Some(cursor) => cursor
				.as_str()
				.parse::<usize>()
				.map_err(|e| MiddlewareError::Decode(e.to_string()))?,
			None => 0,
		};
		let end = (offset + self.page_limit).min(matching.len());
		let transactions = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
		let next = (end < matching.len()).then(|| PageCursor(end.to_string()));
		Ok(TransactionPage { transactions, next })
	}
}

/// Plugin that records what it is given and can be told to fail.
pub struct RecordingPlugin {
	name: String,
	start_from_height: u64,
	filters: Vec<TransactionFilter>,
	received: Mutex<Vec<Transaction>>,
	batches: AtomicUsize,
	reorgs: Mutex<Vec<u64>>,
	failing_batches: AtomicU32,
	failing_reorgs: AtomicU32,
}

impl RecordingPlugin {
	/// Plugin accepting every transaction from `start_from_height` on.
	pub fn new(name: &str, start_from_height: u64) -> Self {
		Self {
			name: name.to_string(),
			start_from_height,
			filters: vec![TransactionFilter::any()],
			received: Mutex::new(Vec::new()),
			batches: AtomicUsize::new(0),
			reorgs: Mutex::new(Vec::new()),
			failing_batches: AtomicU32::new(0),
			failing_reorgs: AtomicU32::new(0),
		}
	}

	pub fn with_filters(mut self, filters: Vec<TransactionFilter>) -> Self {
		self.filters = filters;
		self
	}

	/// Fail the next `count` deliveries.
	pub fn failing_batches(self, count: u32) -> Self {
		self.failing_batches.store(count, Ordering::SeqCst);
		self
	}

	pub fn fail_next_batches(&self, count: u32) {
		self.failing_batches.store(count, Ordering::SeqCst);
	}

	/// Fail the next `count` reorg notifications.
	pub fn failing_reorgs(self, count: u32) -> Self {
		self.failing_reorgs.store(count, Ordering::SeqCst);
		self
	}

	pub fn received_hashes(&self) -> Vec<String> {
		self.received
			.lock()
			.unwrap()
			.iter()
			.map(|tx| tx.tx_hash.clone())
			.collect()
	}

	/// What a consumer deduplicating by hash ends up with.
	pub fn unique_hashes(&self) -> BTreeSet<String> {
		self.received_hashes().into_iter().collect()
	}

	pub fn received_heights(&self) -> Vec<u64> {
		self.received
			.lock()
			.unwrap()
			.iter()
			.map(|tx| tx.block_height)
			.collect()
	}

	pub fn batch_count(&self) -> usize {
		self.batches.load(Ordering::SeqCst)
	}

	pub fn reorgs(&self) -> Vec<u64> {
		self.reorgs.lock().unwrap().clone()
	}
}

fn take_failure(counter: &AtomicU32) -> bool {
	counter
		.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
		.is_ok()
}

#[async_trait]
impl SyncPlugin for RecordingPlugin {
	fn name(&self) -> &str {
		&self.name
	}

	fn start_from_height(&self) -> u64 {
		self.start_from_height
	}

	fn filters(&self) -> Vec<TransactionFilter> {
		self.filters.clone()
	}

	async fn on_transactions_saved(&self, transactions: &[Transaction]) -> Result<(), PluginError> {
		if take_failure(&self.failing_batches) {
			return Err(format!("{} rejected {} transactions", self.name, transactions.len()).into());
		}
		self.batches.fetch_add(1, Ordering::SeqCst);
		self.received
			.lock()
			.unwrap()
			.extend(transactions.iter().cloned());
		Ok(())
	}

	async fn on_reorg(&self, fork_height: u64) -> Result<(), PluginError> {
		if take_failure(&self.failing_reorgs) {
			return Err(format!("{} could not roll back to {}", self.name, fork_height).into());
		}
		self.reorgs.lock().unwrap().push(fork_height);
		// Forget everything above the fork, the way a real consumer would.
		self.received
			.lock()
			.unwrap()
			.retain(|tx| tx.block_height <= fork_height);
		Ok(())
	}
}
