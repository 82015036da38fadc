//! Persistence for the mirrored ledger and the sync cursors.
//!
//! The [`LedgerStore`] trait is the only way the synchronizer touches local state. Every
//! method that changes more than one row runs inside a single SQLite transaction, so a tick
//! phase either commits completely or leaves nothing behind.

use crate::middleware::{Block, Transaction};
use crate::sync::types::{GlobalSyncState, PluginSyncState};

use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA: &str = "
	CREATE TABLE IF NOT EXISTS blocks (
		height INTEGER PRIMARY KEY,
		hash TEXT NOT NULL UNIQUE,
		parent_hash TEXT NOT NULL,
		timestamp INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS transactions (
		tx_hash TEXT PRIMARY KEY,
		block_height INTEGER NOT NULL REFERENCES blocks(height) ON DELETE CASCADE,
		block_hash TEXT NOT NULL,
		tx_index INTEGER NOT NULL,
		micro_time INTEGER NOT NULL,
		tx_type TEXT NOT NULL,
		contract_id TEXT,
		function TEXT,
		caller_id TEXT,
		sender_id TEXT,
		recipient_id TEXT,
		payload TEXT NOT NULL
	);
	CREATE INDEX IF NOT EXISTS transactions_by_height ON transactions (block_height, tx_index);
	CREATE TABLE IF NOT EXISTS global_sync_state (
		id INTEGER PRIMARY KEY CHECK (id = 1),
		last_synced_height INTEGER NOT NULL,
		tip_height INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS plugin_sync_state (
		plugin_name TEXT PRIMARY KEY,
		last_synced_height INTEGER NOT NULL,
		start_from_height INTEGER NOT NULL,
		is_active INTEGER NOT NULL DEFAULT 1,
		pending_rollback INTEGER
	);
";

/// Errors raised by the local store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("SQLite error: {0}")]
	Sqlite(#[from] rusqlite::Error),

	#[error("Payload encoding error: {0}")]
	Payload(#[from] serde_json::Error),

	#[error("Store lock poisoned")]
	Poisoned,

	#[error("Plugin {0} has no cursor")]
	MissingPlugin(String),

	#[error("Block at height {height} does not extend the stored chain")]
	BrokenChain { height: u64 },
}

/// What a rollback removed and which plugins must be told about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
	pub fork_height: u64,
	pub removed_blocks: usize,
	pub removed_transactions: usize,
	/// Plugins whose cursor was above the fork height.
	pub rolled_back_plugins: Vec<String>,
}

/// Local mirror of the ledger plus the global and per-plugin cursors.
pub trait LedgerStore: Send + Sync {
	fn read_global(&self) -> Result<GlobalSyncState, StoreError>;
	fn write_global(&self, state: &GlobalSyncState) -> Result<(), StoreError>;

	fn read_plugin(&self, name: &str) -> Result<Option<PluginSyncState>, StoreError>;
	fn read_plugins(&self) -> Result<Vec<PluginSyncState>, StoreError>;
	/// Move a plugin cursor. The value is clamped to the global cursor.
	fn write_plugin(&self, name: &str, last_synced_height: u64) -> Result<(), StoreError>;
	/// Move several plugin cursors in one transaction.
	fn write_plugins(&self, cursors: &[(String, u64)]) -> Result<(), StoreError>;
	/// Create the cursor row for `name` if it does not exist yet, and return it.
	fn register_plugin(
		&self,
		name: &str,
		start_from_height: u64,
	) -> Result<PluginSyncState, StoreError>;
	fn set_plugin_active(&self, name: &str, active: bool) -> Result<(), StoreError>;
	/// Acknowledge the rollback notification for `fork_height`.
	fn clear_pending_rollback(&self, name: &str, fork_height: u64) -> Result<(), StoreError>;

	fn block_hash_at(&self, height: u64) -> Result<Option<String>, StoreError>;
	fn lowest_block_height(&self) -> Result<Option<u64>, StoreError>;
	fn blocks_in_range(&self, from_height: u64, to_height: u64) -> Result<Vec<Block>, StoreError>;
	/// Transactions in chain order.
	fn transactions_in_range(
		&self,
		from_height: u64,
		to_height: u64,
	) -> Result<Vec<Transaction>, StoreError>;

	/// Store new blocks, their transactions and the advanced global cursor atomically.
	fn persist_blocks(
		&self,
		blocks: &[Block],
		transactions: &[Transaction],
		global: &GlobalSyncState,
	) -> Result<(), StoreError>;

	/// Delete everything above `fork_height` and clamp every cursor to it. Idempotent.
	fn rollback_to(&self, fork_height: u64) -> Result<RollbackSummary, StoreError>;
}

/// SQLite implementation of [`LedgerStore`].
pub struct SqliteLedgerStore {
	conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
	/// Open (or create) the database at `path`. An empty database starts its global cursor
	/// just below `start_height`.
	pub fn open(path: impl AsRef<Path>, start_height: u64) -> Result<Self, StoreError> {
		let conn = Connection::open(path.as_ref())?;
		conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
			row.get::<_, String>(0)
		})?;
		let store = Self::initialize(conn, start_height)?;
		info!(path = %path.as_ref().display(), "Opened ledger store");
		Ok(store)
	}

	pub fn open_in_memory(start_height: u64) -> Result<Self, StoreError> {
		Self::initialize(Connection::open_in_memory()?, start_height)
	}

	fn initialize(conn: Connection, start_height: u64) -> Result<Self, StoreError> {
		conn.pragma_update(None, "foreign_keys", "ON")?;
		conn.execute_batch(SCHEMA)?;

		let initial = start_height.saturating_sub(1) as i64;
		conn.execute(
			"INSERT OR IGNORE INTO global_sync_state (id, last_synced_height, tip_height)
			 VALUES (1, ?1, ?1)",
			params![initial],
		)?;

		Ok(Self {
			conn: Mutex::new(conn),
		})
	}

	fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
		self.conn.lock().map_err(|_| StoreError::Poisoned)
	}
}

fn read_global_in(conn: &Connection) -> Result<GlobalSyncState, StoreError> {
	let state = conn.query_row(
		"SELECT last_synced_height, tip_height FROM global_sync_state WHERE id = 1",
		[],
		|row| {
			Ok(GlobalSyncState {
				last_synced_height: row.get::<_, i64>(0)? as u64,
				tip_height: row.get::<_, i64>(1)? as u64,
			})
		},
	)?;
	Ok(state)
}

fn plugin_from_row(row: &Row<'_>) -> rusqlite::Result<PluginSyncState> {
	Ok(PluginSyncState {
		plugin_name: row.get(0)?,
		last_synced_height: row.get::<_, i64>(1)? as u64,
		start_from_height: row.get::<_, i64>(2)? as u64,
		is_active: row.get(3)?,
		pending_rollback: row.get::<_, Option<i64>>(4)?.map(|height| height as u64),
	})
}

const PLUGIN_COLUMNS: &str =
	"plugin_name, last_synced_height, start_from_height, is_active, pending_rollback";

fn update_plugin_cursor(
	conn: &Connection,
	name: &str,
	last_synced_height: u64,
) -> Result<(), StoreError> {
	let updated = conn.execute(
		"UPDATE plugin_sync_state
		 SET last_synced_height =
			MIN(?2, (SELECT last_synced_height FROM global_sync_state WHERE id = 1))
		 WHERE plugin_name = ?1",
		params![name, last_synced_height as i64],
	)?;
	if updated == 0 {
		return Err(StoreError::MissingPlugin(name.to_string()));
	}
	Ok(())
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<Block> {
	Ok(Block {
		height: row.get::<_, i64>(0)? as u64,
		hash: row.get(1)?,
		parent_hash: row.get(2)?,
		timestamp: row.get(3)?,
	})
}

impl LedgerStore for SqliteLedgerStore {
	fn read_global(&self) -> Result<GlobalSyncState, StoreError> {
		let conn = self.conn()?;
		read_global_in(&conn)
	}

	fn write_global(&self, state: &GlobalSyncState) -> Result<(), StoreError> {
		self.conn()?.execute(
			"UPDATE global_sync_state SET last_synced_height = ?1, tip_height = ?2 WHERE id = 1",
			params![state.last_synced_height as i64, state.tip_height as i64],
		)?;
		Ok(())
	}

	fn read_plugin(&self, name: &str) -> Result<Option<PluginSyncState>, StoreError> {
		let conn = self.conn()?;
		let state = conn
			.query_row(
				&format!("SELECT {PLUGIN_COLUMNS} FROM plugin_sync_state WHERE plugin_name = ?1"),
				params![name],
				plugin_from_row,
			)
			.optional()?;
		Ok(state)
	}

	fn read_plugins(&self) -> Result<Vec<PluginSyncState>, StoreError> {
		let conn = self.conn()?;
		let mut stmt = conn.prepare(&format!(
			"SELECT {PLUGIN_COLUMNS} FROM plugin_sync_state ORDER BY plugin_name"
		))?;
		let states = stmt
			.query_map([], plugin_from_row)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(states)
	}

	fn write_plugin(&self, name: &str, last_synced_height: u64) -> Result<(), StoreError> {
		let conn = self.conn()?;
		update_plugin_cursor(&conn, name, last_synced_height)
	}

	fn write_plugins(&self, cursors: &[(String, u64)]) -> Result<(), StoreError> {
		if cursors.is_empty() {
			return Ok(());
		}
		let mut conn = self.conn()?;
		let tx = conn.transaction()?;
		for (name, height) in cursors {
			update_plugin_cursor(&tx, name, *height)?;
		}
		tx.commit()?;
		Ok(())
	}

	fn register_plugin(
		&self,
		name: &str,
		start_from_height: u64,
	) -> Result<PluginSyncState, StoreError> {
		let mut conn = self.conn()?;
		let tx = conn.transaction()?;

		let global = read_global_in(&tx)?;
		let initial_cursor = start_from_height
			.saturating_sub(1)
			.min(global.last_synced_height);
		let inserted = tx.execute(
			"INSERT OR IGNORE INTO plugin_sync_state
				(plugin_name, last_synced_height, start_from_height, is_active, pending_rollback)
			 VALUES (?1, ?2, ?3, 1, NULL)",
			params![name, initial_cursor as i64, start_from_height as i64],
		)?;

		let state = tx.query_row(
			&format!("SELECT {PLUGIN_COLUMNS} FROM plugin_sync_state WHERE plugin_name = ?1"),
			params![name],
			plugin_from_row,
		)?;
		tx.commit()?;

		if inserted == 0 {
			debug!(plugin = name, "Plugin cursor already present, keeping it");
		} else {
			info!(
				plugin = name,
				start_from_height,
				cursor = state.last_synced_height,
				"Created plugin cursor"
			);
		}
		Ok(state)
	}

	fn set_plugin_active(&self, name: &str, active: bool) -> Result<(), StoreError> {
		let updated = self.conn()?.execute(
			"UPDATE plugin_sync_state SET is_active = ?2 WHERE plugin_name = ?1",
			params![name, active],
		)?;
		if updated == 0 {
			return Err(StoreError::MissingPlugin(name.to_string()));
		}
		Ok(())
	}

	fn clear_pending_rollback(&self, name: &str, fork_height: u64) -> Result<(), StoreError> {
		self.conn()?.execute(
			"UPDATE plugin_sync_state SET pending_rollback = NULL
			 WHERE plugin_name = ?1 AND pending_rollback = ?2",
			params![name, fork_height as i64],
		)?;
		Ok(())
	}

	fn block_hash_at(&self, height: u64) -> Result<Option<String>, StoreError> {
		let hash = self
			.conn()?
			.query_row(
				"SELECT hash FROM blocks WHERE height = ?1",
				params![height as i64],
				|row| row.get(0),
			)
			.optional()?;
		Ok(hash)
	}

	fn lowest_block_height(&self) -> Result<Option<u64>, StoreError> {
		let height: Option<i64> =
			self.conn()?
				.query_row("SELECT MIN(height) FROM blocks", [], |row| row.get(0))?;
		Ok(height.map(|height| height as u64))
	}

	fn blocks_in_range(&self, from_height: u64, to_height: u64) -> Result<Vec<Block>, StoreError> {
		let conn = self.conn()?;
		let mut stmt = conn.prepare(
			"SELECT height, hash, parent_hash, timestamp FROM blocks
			 WHERE height BETWEEN ?1 AND ?2 ORDER BY height",
		)?;
		let blocks = stmt
			.query_map(params![from_height as i64, to_height as i64], block_from_row)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(blocks)
	}

	fn transactions_in_range(
		&self,
		from_height: u64,
		to_height: u64,
	) -> Result<Vec<Transaction>, StoreError> {
		let conn = self.conn()?;
		let mut stmt = conn.prepare(
			"SELECT tx_hash, block_height, block_hash, tx_index, micro_time, tx_type,
				contract_id, function, caller_id, sender_id, recipient_id, payload
			 FROM transactions
			 WHERE block_height BETWEEN ?1 AND ?2
			 ORDER BY block_height, tx_index",
		)?;
		let rows = stmt
			.query_map(params![from_height as i64, to_height as i64], |row| {
				let tx = Transaction {
					tx_hash: row.get(0)?,
					block_height: row.get::<_, i64>(1)? as u64,
					block_hash: row.get(2)?,
					tx_index: row.get::<_, i64>(3)? as u64,
					micro_time: row.get(4)?,
					tx_type: row.get(5)?,
					contract_id: row.get(6)?,
					function: row.get(7)?,
					caller_id: row.get(8)?,
					sender_id: row.get(9)?,
					recipient_id: row.get(10)?,
					payload: serde_json::Value::Null,
				};
				let payload: String = row.get(11)?;
				Ok((tx, payload))
			})?
			.collect::<Result<Vec<_>, _>>()?;

		rows.into_iter()
			.map(|(mut tx, payload)| -> Result<Transaction, StoreError> {
				tx.payload = serde_json::from_str(&payload)?;
				Ok(tx)
			})
			.collect()
	}

	fn persist_blocks(
		&self,
		blocks: &[Block],
		transactions: &[Transaction],
		global: &GlobalSyncState,
	) -> Result<(), StoreError> {
		let mut conn = self.conn()?;
		let tx = conn.transaction()?;

		let mut parent: Option<Block> = match blocks.first() {
			Some(first) if first.height > 0 => tx
				.query_row(
					"SELECT height, hash, parent_hash, timestamp FROM blocks WHERE height = ?1",
					params![(first.height - 1) as i64],
					block_from_row,
				)
				.optional()?,
			_ => None,
		};

		for block in blocks {
			if let Some(parent) = &parent {
				if !block.extends(parent) {
					return Err(StoreError::BrokenChain {
						height: block.height,
					});
				}
			}
			tx.execute(
				"INSERT INTO blocks (height, hash, parent_hash, timestamp) VALUES (?1, ?2, ?3, ?4)",
				params![
					block.height as i64,
					block.hash,
					block.parent_hash,
					block.timestamp
				],
			)?;
			parent = Some(block.clone());
		}

		for transaction in transactions {
			tx.execute(
				"INSERT OR REPLACE INTO transactions
					(tx_hash, block_height, block_hash, tx_index, micro_time, tx_type,
					 contract_id, function, caller_id, sender_id, recipient_id, payload)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
				params![
					transaction.tx_hash,
					transaction.block_height as i64,
					transaction.block_hash,
					transaction.tx_index as i64,
					transaction.micro_time,
					transaction.tx_type,
					transaction.contract_id,
					transaction.function,
					transaction.caller_id,
					transaction.sender_id,
					transaction.recipient_id,
					serde_json::to_string(&transaction.payload)?,
				],
			)?;
		}

		tx.execute(
			"UPDATE global_sync_state SET last_synced_height = ?1, tip_height = ?2 WHERE id = 1",
			params![global.last_synced_height as i64, global.tip_height as i64],
		)?;
		tx.commit()?;

		debug!(
			blocks = blocks.len(),
			transactions = transactions.len(),
			last_synced_height = global.last_synced_height,
			"Persisted ledger batch"
		);
		Ok(())
	}

	fn rollback_to(&self, fork_height: u64) -> Result<RollbackSummary, StoreError> {
		let fork = fork_height as i64;
		let mut conn = self.conn()?;
		let tx = conn.transaction()?;

		let rolled_back_plugins = {
			let mut stmt = tx.prepare(
				"SELECT plugin_name FROM plugin_sync_state
				 WHERE last_synced_height > ?1 ORDER BY plugin_name",
			)?;
			stmt.query_map(params![fork], |row| row.get::<_, String>(0))?
				.collect::<Result<Vec<_>, _>>()?
		};

		let removed_transactions = tx.execute(
			"DELETE FROM transactions WHERE block_height > ?1",
			params![fork],
		)?;
		let removed_blocks = tx.execute("DELETE FROM blocks WHERE height > ?1", params![fork])?;
		tx.execute(
			"UPDATE global_sync_state
			 SET last_synced_height = MIN(last_synced_height, ?1) WHERE id = 1",
			params![fork],
		)?;
		tx.execute(
			"UPDATE plugin_sync_state
			 SET last_synced_height = ?1,
				 pending_rollback = MIN(COALESCE(pending_rollback, ?1), ?1)
			 WHERE last_synced_height > ?1",
			params![fork],
		)?;
		tx.commit()?;

		Ok(RollbackSummary {
			fork_height,
			removed_blocks,
			removed_transactions,
			rolled_back_plugins,
		})
	}
}
