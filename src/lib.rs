//! Keeps a local SQLite mirror of an aeternity middleware ledger up to date, repairs chain
//! reorganizations and feeds confirmed transactions to independently paced plugins.

pub mod config;
pub mod middleware;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_utils;
