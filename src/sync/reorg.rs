//! Chain reorganization detection.

use crate::middleware::{Block, LedgerSource};
use crate::sync::repositories::LedgerStore;
use crate::sync::types::SyncError;

use std::collections::HashMap;
use tracing::{debug, warn};

/// How a freshly fetched block relates to the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
	/// The block builds on the locally stored chain (or there is nothing local to compare).
	Extends,
	/// The local chain diverged; everything above `fork_height` is stale.
	Forked { fork_height: u64 },
}

/// Compares fetched headers with the locally stored chain.
#[derive(Debug, Clone)]
pub struct ReorgDetector {
	max_depth: u64,
}

impl ReorgDetector {
	pub fn new(max_depth: u64) -> Self {
		Self { max_depth }
	}

	/// Check whether `header` extends the local chain, locating the fork point if it does not.
	pub async fn check(
		&self,
		header: &Block,
		store: &dyn LedgerStore,
		source: &dyn LedgerSource,
	) -> Result<ChainLink, SyncError> {
		if header.height == 0 {
			return Ok(ChainLink::Extends);
		}

		match store.block_hash_at(header.height - 1)? {
			None => Ok(ChainLink::Extends),
			Some(local) if local == header.parent_hash => Ok(ChainLink::Extends),
			Some(local) => {
				warn!(
					height = header.height,
					parent_hash = %header.parent_hash,
					local_hash = %local,
					"Parent hash mismatch, searching for fork point"
				);
				let fork_height = self.find_fork_point(header, store, source).await?;
				Ok(ChainLink::Forked { fork_height })
			}
		}
	}

	/// Walk down from `header.height - 1` and return the highest height where the remote and the
	/// local chain agree.
	///
	/// # Errors
	/// - `SyncError::ReorgTooDeep` when no agreement is found within `max_depth` heights or the
	///   walk leaves the locally mirrored range.
	/// - `SyncError::InconsistentRemote` when the remote ancestors contradict `header`.
	pub async fn find_fork_point(
		&self,
		header: &Block,
		store: &dyn LedgerStore,
		source: &dyn LedgerSource,
	) -> Result<u64, SyncError> {
		let too_deep = || SyncError::ReorgTooDeep {
			mismatch_height: header.height,
			max_depth: self.max_depth,
		};

		let top = header.height.saturating_sub(1);
		let bottom = top.saturating_sub(self.max_depth);
		let remote: HashMap<u64, String> = source
			.blocks_range(bottom, top - bottom + 1)
			.await?
			.into_iter()
			.map(|block| (block.height, block.hash))
			.collect();

		if remote.get(&top) != Some(&header.parent_hash) {
			return Err(SyncError::InconsistentRemote(format!(
				"block {} at height {} names parent {}, but the remote ancestor is {:?}",
				header.hash,
				header.height,
				header.parent_hash,
				remote.get(&top)
			)));
		}

		for height in (bottom..=top).rev() {
			let Some(local) = store.block_hash_at(height)? else {
				return Err(too_deep());
			};
			let Some(remote_hash) = remote.get(&height) else {
				return Err(SyncError::InconsistentRemote(format!(
					"remote ancestor window is missing height {}",
					height
				)));
			};
			if *remote_hash == local {
				debug!(fork_height = height, "Found fork point");
				return Ok(height);
			}
		}

		Err(too_deep())
	}
}
