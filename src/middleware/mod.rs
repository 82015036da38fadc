//! Middleware integration module
//!
//! This module provides the client and types for reading the remote ledger from the chain
//! middleware's paginated HTTP API: the current tip, key block ranges and cursor-paginated
//! transaction lists.

/// HTTP client and the `LedgerSource` abstraction
mod client;
/// Lazy page sequences over transaction queries
mod pagination;
/// Ledger records and wire types
mod types;

pub use client::{LedgerSource, MAX_PAGE_LIMIT, MiddlewareClient, RetryPolicy};
pub use pagination::{collect_transactions, transaction_pages};
pub use types::*;
