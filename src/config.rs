//! Service configuration, sourced from `MDW_SYNC_*` environment variables.

use crate::middleware::RetryPolicy;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable prefix, e.g. `MDW_SYNC_REORG_DEPTH=50`.
pub const ENV_PREFIX: &str = "MDW_SYNC";

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
	/// Middleware base URL.
	#[serde(default = "default_middleware_url")]
	pub middleware_url: String,
	/// How far below a mismatching block the fork point is searched for.
	#[serde(default = "default_reorg_depth")]
	pub reorg_depth: u64,
	#[serde(default = "default_sync_interval_ms")]
	pub sync_interval_ms: u64,
	/// Transactions requested per middleware page.
	#[serde(default = "default_page_limit")]
	pub page_limit: u64,
	/// Heights per plugin backfill batch.
	#[serde(default = "default_backfill_batch_blocks")]
	pub backfill_batch_blocks: u64,
	#[serde(default = "default_max_blocks_per_tick")]
	pub max_blocks_per_tick: u64,
	/// First height mirrored when the store is empty.
	#[serde(default = "default_start_height")]
	pub start_height: u64,
	/// SQLite database file, or `:memory:`.
	#[serde(default = "default_database_path")]
	pub database_path: String,
	#[serde(default = "default_request_timeout_ms")]
	pub request_timeout_ms: u64,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_retry_initial_interval_ms")]
	pub retry_initial_interval_ms: u64,
	#[serde(default = "default_retry_max_interval_ms")]
	pub retry_max_interval_ms: u64,
	/// Default tracing directive, used when `RUST_LOG` is unset.
	#[serde(default = "default_log_filter")]
	pub log_filter: String,
}

fn default_middleware_url() -> String {
	"https://mainnet.aeternity.io/mdw".to_string()
}
fn default_reorg_depth() -> u64 {
	100
}
fn default_sync_interval_ms() -> u64 {
	5_000
}
fn default_page_limit() -> u64 {
	100
}
fn default_backfill_batch_blocks() -> u64 {
	100
}
fn default_max_blocks_per_tick() -> u64 {
	100
}
fn default_start_height() -> u64 {
	1
}
fn default_database_path() -> String {
	"mdw-sync.sqlite".to_string()
}
fn default_request_timeout_ms() -> u64 {
	30_000
}
fn default_max_retries() -> u32 {
	5
}
fn default_retry_initial_interval_ms() -> u64 {
	500
}
fn default_retry_max_interval_ms() -> u64 {
	10_000
}
fn default_log_filter() -> String {
	"info".to_string()
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			middleware_url: default_middleware_url(),
			reorg_depth: default_reorg_depth(),
			sync_interval_ms: default_sync_interval_ms(),
			page_limit: default_page_limit(),
			backfill_batch_blocks: default_backfill_batch_blocks(),
			max_blocks_per_tick: default_max_blocks_per_tick(),
			start_height: default_start_height(),
			database_path: default_database_path(),
			request_timeout_ms: default_request_timeout_ms(),
			max_retries: default_max_retries(),
			retry_initial_interval_ms: default_retry_initial_interval_ms(),
			retry_max_interval_ms: default_retry_max_interval_ms(),
			log_filter: default_log_filter(),
		}
	}
}

impl SyncConfig {
	/// Load the configuration from the process environment.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_environment(Environment::with_prefix(ENV_PREFIX))
	}

	fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
		let config: SyncConfig = Config::builder()
			.add_source(environment.try_parsing(true))
			.build()?
			.try_deserialize()?;
		config.validate()?;
		Ok(config)
	}

	/// Reject settings the synchronizer cannot run with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let positive = [
			("reorg_depth", self.reorg_depth),
			("sync_interval_ms", self.sync_interval_ms),
			("page_limit", self.page_limit),
			("backfill_batch_blocks", self.backfill_batch_blocks),
			("max_blocks_per_tick", self.max_blocks_per_tick),
		];
		if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
			return Err(ConfigError::Message(format!("{} must be greater than zero", name)));
		}
		if self.page_limit > crate::middleware::MAX_PAGE_LIMIT {
			return Err(ConfigError::Message(format!(
				"page_limit must not exceed {}",
				crate::middleware::MAX_PAGE_LIMIT
			)));
		}
		if self.middleware_url.trim().is_empty() {
			return Err(ConfigError::Message("middleware_url must be set".to_string()));
		}
		Ok(())
	}

	pub fn sync_interval(&self) -> Duration {
		Duration::from_millis(self.sync_interval_ms)
	}

	pub fn retry_policy(&self) -> RetryPolicy {
		RetryPolicy {
			max_attempts: self.max_retries.max(1),
			initial_interval: Duration::from_millis(self.retry_initial_interval_ms),
			max_interval: Duration::from_millis(self.retry_max_interval_ms),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn load(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
		let source: HashMap<String, String> = vars
			.iter()
			.map(|(key, value)| (key.to_string(), value.to_string()))
			.collect();
		SyncConfig::from_environment(Environment::with_prefix(ENV_PREFIX).source(Some(source)))
	}

	#[test]
	fn defaults_apply_without_environment() {
		let config = load(&[]).unwrap();
		assert_eq!(config.reorg_depth, 100);
		assert_eq!(config.page_limit, 100);
		assert_eq!(config.start_height, 1);
		assert_eq!(config.sync_interval(), Duration::from_secs(5));
	}

	#[test]
	fn environment_overrides_defaults() {
		let config = load(&[
			("MDW_SYNC_REORG_DEPTH", "12"),
			("MDW_SYNC_SYNC_INTERVAL_MS", "250"),
			("MDW_SYNC_BACKFILL_BATCH_BLOCKS", "7"),
			("MDW_SYNC_MIDDLEWARE_URL", "http://localhost:4000/mdw"),
		])
		.unwrap();

		assert_eq!(config.reorg_depth, 12);
		assert_eq!(config.sync_interval_ms, 250);
		assert_eq!(config.backfill_batch_blocks, 7);
		assert_eq!(config.middleware_url, "http://localhost:4000/mdw");
	}

	#[test]
	fn zero_reorg_depth_is_rejected() {
		assert!(load(&[("MDW_SYNC_REORG_DEPTH", "0")]).is_err());
	}

	#[test]
	fn oversized_page_limit_is_rejected() {
		let config = SyncConfig {
			page_limit: 500,
			..SyncConfig::default()
		};
		assert!(config.validate().is_err());
	}
}
