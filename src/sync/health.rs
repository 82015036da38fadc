//! Health report exposed by the orchestrator.

use crate::sync::types::{GlobalSyncState, PluginSyncState, SyncPhase};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Ok,
	/// The last tick failed; the loop keeps retrying.
	Degraded,
	Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateReport {
	pub last_synced_height: u64,
	pub tip_height: u64,
	pub lag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHealth {
	pub name: String,
	pub last_synced_height: u64,
	pub start_from_height: u64,
	pub is_active: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pending_rollback: Option<u64>,
}

impl From<PluginSyncState> for PluginHealth {
	fn from(state: PluginSyncState) -> Self {
		Self {
			name: state.plugin_name,
			last_synced_height: state.last_synced_height,
			start_from_height: state.start_from_height,
			is_active: state.is_active,
			pending_rollback: state.pending_rollback,
		}
	}
}

/// Snapshot of the synchronizer, serialized as camelCase JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
	pub status: HealthStatus,
	pub phase: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub halted_reason: Option<String>,
	pub sync_state: SyncStateReport,
	pub plugins: Vec<PluginHealth>,
	pub checked_at: DateTime<Utc>,
}

impl HealthReport {
	pub fn new(
		phase: &SyncPhase,
		consecutive_failures: u32,
		global: GlobalSyncState,
		plugins: Vec<PluginSyncState>,
	) -> Self {
		let (status, halted_reason) = match phase {
			SyncPhase::Halted(reason) => (HealthStatus::Halted, Some(reason.clone())),
			_ if consecutive_failures > 0 => (HealthStatus::Degraded, None),
			_ => (HealthStatus::Ok, None),
		};

		Self {
			status,
			phase: phase.to_string(),
			halted_reason,
			sync_state: SyncStateReport {
				last_synced_height: global.last_synced_height,
				tip_height: global.tip_height,
				lag: global.lag(),
			},
			plugins: plugins.into_iter().map(PluginHealth::from).collect(),
			checked_at: Utc::now(),
		}
	}
}
