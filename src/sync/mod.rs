//! Ledger Synchronization Module
//!
//! This module keeps the local mirror of the remote ledger current and feeds plugins from it:
//!
//! - `orchestrator`: The sync loop. It wires together all services below and drives one
//!   poll, reorg-check, persist and dispatch cycle per tick.
//! - `repositories`: SQLite persistence for blocks, transactions and cursors.
//! - `reorg`: Detects forks and locates the fork point.
//! - `plugins`: The plugin contract, transaction filters and the plugin registry.
//! - `events`: Delivers transactions and reorg notifications to plugins.
//! - `backfill`: Batched catch-up for plugins that lag the global cursor.
//! - `progress_tracker`: Counters and periodic progress logging.
//! - `health`: The health report.

/// Batched catch-up for lagging plugins
pub mod backfill;
/// Transaction and reorg delivery to plugins
pub mod events;
/// Health report types
pub mod health;
/// Main coordinator for the sync loop
pub mod orchestrator;
/// Plugin contract and registry
pub mod plugins;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Fork detection
pub mod reorg;
/// Local persistence
pub mod repositories;
/// Cursors, phases and errors
pub mod types;

pub use orchestrator::{SyncOrchestrator, TickOutcome};
pub use plugins::{SyncPlugin, TransactionFilter};
pub use repositories::{LedgerStore, SqliteLedgerStore};
pub use types::*;
