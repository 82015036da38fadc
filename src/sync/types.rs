use crate::middleware::MiddlewareError;
use crate::sync::repositories::StoreError;

use serde::Serialize;
use std::fmt;

/// Boxed error returned by plugin callbacks.
pub type PluginError = Box<dyn std::error::Error + Send + Sync>;

/// Global sync cursor (singleton).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSyncState {
	pub last_synced_height: u64,
	pub tip_height: u64,
}

impl GlobalSyncState {
	/// Heights the mirror is behind the remote tip.
	pub fn lag(&self) -> u64 {
		self.tip_height.saturating_sub(self.last_synced_height)
	}
}

/// Per-plugin sync cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSyncState {
	pub plugin_name: String,
	pub last_synced_height: u64,
	pub start_from_height: u64,
	pub is_active: bool,
	/// Fork height whose rollback notification the plugin has not acknowledged yet.
	pub pending_rollback: Option<u64>,
}

/// Phases of a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
	Idle,
	Polling,
	ReorgCheck,
	Persisting,
	Dispatching,
	/// Terminal; requires operator intervention.
	Halted(String),
}

impl SyncPhase {
	pub fn is_halted(&self) -> bool {
		matches!(self, SyncPhase::Halted(_))
	}
}

impl fmt::Display for SyncPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SyncPhase::Idle => "IDLE",
			SyncPhase::Polling => "POLLING",
			SyncPhase::ReorgCheck => "REORG_CHECK",
			SyncPhase::Persisting => "PERSISTING",
			SyncPhase::Dispatching => "DISPATCHING",
			SyncPhase::Halted(_) => "HALTED",
		};
		f.write_str(name)
	}
}

/// Errors surfaced by the sync components.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Network error: {0}")]
	Network(#[from] MiddlewareError),

	#[error(
		"Reorg below height {mismatch_height} not resolved within {max_depth} blocks; operator intervention required"
	)]
	ReorgTooDeep { mismatch_height: u64, max_depth: u64 },

	#[error("Plugin {0} is already registered")]
	DuplicatePlugin(String),

	#[error("Plugin {0} is not registered")]
	UnknownPlugin(String),

	#[error("Plugin {plugin} callback failed: {source}")]
	PluginCallback {
		plugin: String,
		#[source]
		source: PluginError,
	},

	#[error("Persistence error: {0}")]
	Persistence(#[from] StoreError),

	#[error("Remote chain inconsistent: {0}")]
	InconsistentRemote(String),

	#[error("Synchronizer halted: {0}")]
	Halted(String),
}

impl SyncError {
	/// Only an unresolvable reorg stops the synchronizer.
	pub fn is_fatal(&self) -> bool {
		matches!(self, SyncError::ReorgTooDeep { .. } | SyncError::Halted(_))
	}
}
