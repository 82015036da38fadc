//! Types for the middleware HTTP API and the ledger records mirrored from it.

use serde::{Deserialize, Serialize};

/// A key block as mirrored locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
	/// Block height, unique along the canonical chain.
	pub height: u64,
	/// Block hash.
	pub hash: String,
	/// Hash of the block at `height - 1`.
	pub parent_hash: String,
	/// Block time in milliseconds since the epoch.
	pub timestamp: i64,
}

impl Block {
	/// Whether `self` directly extends `parent`.
	pub fn extends(&self, parent: &Block) -> bool {
		self.height == parent.height + 1 && self.parent_hash == parent.hash
	}
}

/// A confirmed transaction as mirrored locally.
///
/// The transaction references its block by height and hash only; the block itself is looked
/// up through the store when needed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
	/// The transaction hash.
	pub tx_hash: String,
	/// Height of the key block generation the transaction was included in.
	pub block_height: u64,
	/// Hash of the (micro) block the transaction was included in.
	pub block_hash: String,
	/// Monotonically increasing index assigned by the middleware.
	pub tx_index: u64,
	/// Time of the including micro block in milliseconds.
	pub micro_time: i64,
	/// Transaction type, e.g. `ContractCallTx`.
	pub tx_type: String,
	pub contract_id: Option<String>,
	pub function: Option<String>,
	pub caller_id: Option<String>,
	pub sender_id: Option<String>,
	pub recipient_id: Option<String>,
	/// The raw `tx` document exactly as the middleware returned it.
	pub payload: serde_json::Value,
}

impl Transaction {
	/// Chain order: block height first, then position within the block.
	pub fn chain_position(&self) -> (u64, u64) {
		(self.block_height, self.tx_index)
	}
}

/// Sorts transactions into chain order. The sort is stable, so equal positions keep their
/// fetch order.
pub fn sort_chain_order(transactions: &mut [Transaction]) {
	transactions.sort_by_key(Transaction::chain_position);
}

/// Opaque pagination cursor returned by the middleware as a `next` link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(pub String);

impl PageCursor {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

/// Selects the transactions returned by [`LedgerSource::transactions_page`](super::LedgerSource::transactions_page).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
	/// First generation (inclusive).
	pub from_height: u64,
	/// Last generation (inclusive).
	pub to_height: u64,
	/// Restrict to a single transaction type.
	pub tx_type: Option<String>,
	/// Restrict to transactions touching a single contract.
	pub contract_id: Option<String>,
}

impl TransactionQuery {
	/// All transactions in the inclusive height range.
	pub fn heights(from_height: u64, to_height: u64) -> Self {
		Self {
			from_height,
			to_height,
			..Self::default()
		}
	}
}

/// One page of transactions and the cursor for the following page.
#[derive(Debug, Clone, Default)]
pub struct TransactionPage {
	pub transactions: Vec<Transaction>,
	/// `None` once the sequence is exhausted.
	pub next: Option<PageCursor>,
}

/// Response of `GET v3/status`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StatusResponse {
	pub mdw_height: u64,
}

/// Envelope shared by every paginated middleware endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Paginated<T> {
	pub data: Vec<T>,
	#[serde(default)]
	pub next: Option<String>,
}

/// Key block record from `GET v3/key-blocks`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct KeyBlockRecord {
	pub height: u64,
	pub hash: String,
	pub prev_key_hash: String,
	pub time: i64,
}

impl From<KeyBlockRecord> for Block {
	fn from(record: KeyBlockRecord) -> Self {
		Self {
			height: record.height,
			hash: record.hash,
			parent_hash: record.prev_key_hash,
			timestamp: record.time,
		}
	}
}

/// Transaction record from `GET v3/transactions`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TransactionRecord {
	pub hash: String,
	pub block_height: u64,
	pub block_hash: String,
	#[serde(default)]
	pub tx_index: u64,
	#[serde(default)]
	pub micro_time: i64,
	pub tx: serde_json::Value,
}

impl TryFrom<TransactionRecord> for Transaction {
	type Error = MiddlewareError;

	fn try_from(record: TransactionRecord) -> Result<Self, Self::Error> {
		let field = |name: &str| {
			record
				.tx
				.get(name)
				.and_then(|value| value.as_str())
				.map(str::to_string)
		};

		let tx_type = field("type").ok_or_else(|| {
			MiddlewareError::Decode(format!("transaction {} has no type", record.hash))
		})?;

		Ok(Self {
			tx_type,
			contract_id: field("contract_id"),
			function: field("function"),
			caller_id: field("caller_id"),
			sender_id: field("sender_id"),
			recipient_id: field("recipient_id"),
			tx_hash: record.hash,
			block_height: record.block_height,
			block_hash: record.block_hash,
			tx_index: record.tx_index,
			micro_time: record.micro_time,
			payload: record.tx,
		})
	}
}

/// Errors raised while talking to the middleware.
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("middleware returned status {status} for {url}")]
	Status { status: u16, url: String },

	#[error("JSON parse error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("invalid middleware URL: {0}")]
	InvalidUrl(String),

	#[error("unexpected middleware data: {0}")]
	Decode(String),
}

impl MiddlewareError {
	/// Transport failures, timeouts, rate limiting and server errors are worth retrying.
	pub fn is_transient(&self) -> bool {
		match self {
			MiddlewareError::Http(e) => {
				e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
			}
			MiddlewareError::Status { status, .. } => *status == 429 || *status >= 500,
			_ => false,
		}
	}
}
