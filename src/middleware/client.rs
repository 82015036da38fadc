//!
//! HTTP client for the chain middleware with bounded retries.
//!
//! This module provides the [`LedgerSource`] trait the synchronizer consumes and its
//! reqwest-based implementation, [`MiddlewareClient`]. Every request is retried with
//! exponential backoff while the failure is transient, up to a bounded number of attempts.

use super::types::*;
use crate::config::SyncConfig;

use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, future::retry};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Largest page the middleware serves.
pub const MAX_PAGE_LIMIT: u64 = 100;

/// Read access to the remote ledger.
#[async_trait]
pub trait LedgerSource: Send + Sync {
	/// Current remote tip height.
	async fn tip_height(&self) -> Result<u64, MiddlewareError>;

	/// Up to `count` blocks starting at `from_height`, in ascending height order.
	async fn blocks_range(&self, from_height: u64, count: u64)
	-> Result<Vec<Block>, MiddlewareError>;

	/// One page of transactions. Passing the `next` cursor of a page yields the following
	/// page; passing `None` starts at the beginning of `query`.
	async fn transactions_page(
		&self,
		query: &TransactionQuery,
		cursor: Option<&PageCursor>,
	) -> Result<TransactionPage, MiddlewareError>;
}

/// Retry settings for middleware requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	/// Total attempts per request, including the first one.
	pub max_attempts: u32,
	pub initial_interval: Duration,
	pub max_interval: Duration,
}

impl RetryPolicy {
	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial_interval)
			.with_max_interval(self.max_interval)
			.with_max_elapsed_time(None)
			.build()
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_interval: Duration::from_millis(500),
			max_interval: Duration::from_secs(10),
		}
	}
}

/// Middleware HTTP client
#[derive(Clone)]
pub struct MiddlewareClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL every endpoint and `next` link is resolved against. Always ends with `/`.
	base_url: Url,
	/// Transactions requested per page.
	page_limit: u64,
	retry: RetryPolicy,
}

impl MiddlewareClient {
	/// Create a new middleware client.
	///
	/// # Arguments
	/// * `base_url` - The middleware root, e.g. `https://mainnet.aeternity.io/mdw`.
	/// * `page_limit` - Transactions per page, capped at [`MAX_PAGE_LIMIT`].
	/// * `timeout` - Per-request timeout.
	/// * `retry` - Retry policy applied to every request.
	///
	/// # Errors
	/// Returns `MiddlewareError::InvalidUrl` if `base_url` cannot be parsed.
	pub fn new(
		base_url: &str,
		page_limit: u64,
		timeout: Duration,
		retry: RetryPolicy,
	) -> Result<Self, MiddlewareError> {
		let normalized = format!("{}/", base_url.trim_end_matches('/'));
		let base_url = Url::parse(&normalized)
			.map_err(|e| MiddlewareError::InvalidUrl(format!("{}: {}", normalized, e)))?;

		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			base_url,
			page_limit: page_limit.clamp(1, MAX_PAGE_LIMIT),
			retry,
		})
	}

	/// Build a client from the service configuration.
	pub fn from_config(config: &SyncConfig) -> Result<Self, MiddlewareError> {
		Self::new(
			&config.middleware_url,
			config.page_limit,
			Duration::from_millis(config.request_timeout_ms),
			config.retry_policy(),
		)
	}

	fn endpoint(&self, path: &str) -> Result<Url, MiddlewareError> {
		self.base_url
			.join(path)
			.map_err(|e| MiddlewareError::InvalidUrl(format!("{}: {}", path, e)))
	}

	fn key_blocks_url(&self, from_height: u64, to_height: u64, limit: u64) -> Result<Url, MiddlewareError> {
		let mut url = self.endpoint("v3/key-blocks")?;
		url.query_pairs_mut()
			.append_pair("scope", &format!("gen:{}-{}", from_height, to_height))
			.append_pair("direction", "forward")
			.append_pair("limit", &limit.to_string());
		Ok(url)
	}

	fn transactions_url(&self, query: &TransactionQuery) -> Result<Url, MiddlewareError> {
		let mut url = self.endpoint("v3/transactions")?;
		{
			let mut pairs = url.query_pairs_mut();
			pairs
				.append_pair(
					"scope",
					&format!("gen:{}-{}", query.from_height, query.to_height),
				)
				.append_pair("direction", "forward")
				.append_pair("limit", &self.page_limit.to_string());
			if let Some(tx_type) = &query.tx_type {
				pairs.append_pair("type", tx_type);
			}
			if let Some(contract_id) = &query.contract_id {
				pairs.append_pair("contract_id", contract_id);
			}
		}
		Ok(url)
	}

	/// GET `url` and decode the JSON body, retrying transient failures.
	async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, MiddlewareError> {
		let attempts = AtomicU32::new(0);
		let attempts = &attempts;
		let max_attempts = self.retry.max_attempts.max(1);

		retry(self.retry.backoff(), || {
			let url = url.clone();
			async move {
				let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
				match self.fetch_once::<T>(url.clone()).await {
					Ok(value) => Ok(value),
					Err(e) if e.is_transient() && attempt < max_attempts => {
						warn!(%url, attempt, error = %e, "Middleware request failed, retrying");
						Err(backoff::Error::transient(e))
					}
					Err(e) => Err(backoff::Error::permanent(e)),
				}
			}
		})
		.await
	}

	async fn fetch_once<T: DeserializeOwned>(&self, url: Url) -> Result<T, MiddlewareError> {
		debug!(%url, "GET");
		let response = self.http_client.get(url.clone()).send().await?;

		let status = response.status();
		if !status.is_success() {
			return Err(MiddlewareError::Status {
				status: status.as_u16(),
				url: url.to_string(),
			});
		}

		let body = response.bytes().await?;
		Ok(serde_json::from_slice(&body)?)
	}
}

#[async_trait]
impl LedgerSource for MiddlewareClient {
	async fn tip_height(&self) -> Result<u64, MiddlewareError> {
		let status: StatusResponse = self.get_json(self.endpoint("v3/status")?).await?;
		Ok(status.mdw_height)
	}

	async fn blocks_range(
		&self,
		from_height: u64,
		count: u64,
	) -> Result<Vec<Block>, MiddlewareError> {
		if count == 0 {
			return Ok(Vec::new());
		}
		let to_height = from_height + count - 1;

		let mut blocks: Vec<Block> = Vec::new();
		let mut url = self.key_blocks_url(from_height, to_height, count.min(MAX_PAGE_LIMIT))?;
		loop {
			let page: Paginated<KeyBlockRecord> = self.get_json(url).await?;
			blocks.extend(page.data.into_iter().map(Block::from));

			match page.next {
				Some(next) if (blocks.len() as u64) < count => url = self.endpoint(&next)?,
				_ => break,
			}
		}

		blocks.sort_by_key(|block| block.height);
		blocks.dedup_by_key(|block| block.height);
		blocks.retain(|block| (from_height..=to_height).contains(&block.height));
		Ok(blocks)
	}

	async fn transactions_page(
		&self,
		query: &TransactionQuery,
		cursor: Option<&PageCursor>,
	) -> Result<TransactionPage, MiddlewareError> {
		let url = match cursor {
			Some(cursor) => self.endpoint(cursor.as_str())?,
			None => self.transactions_url(query)?,
		};

		let page: Paginated<TransactionRecord> = self.get_json(url).await?;
		let transactions = page
			.data
			.into_iter()
			.map(Transaction::try_from)
			.collect::<Result<Vec<_>, _>>()?;

		Ok(TransactionPage {
			transactions,
			next: page.next.map(PageCursor),
		})
	}
}
