//! Lazy, restartable sequences over paginated middleware results.

use super::client::LedgerSource;
use super::types::{MiddlewareError, PageCursor, Transaction, TransactionPage, TransactionQuery};

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

enum PageState {
	Pending(Option<PageCursor>),
	Exhausted,
}

/// Stream the pages of `query`, starting at `resume_from` (or the beginning when `None`).
///
/// Nothing is fetched until the stream is polled. Each yielded page carries the cursor of the
/// page after it, so a consumer that remembers the cursor of the last page it processed can
/// restart the sequence from there.
pub fn transaction_pages<'a>(
	source: &'a dyn LedgerSource,
	query: TransactionQuery,
	resume_from: Option<PageCursor>,
) -> BoxStream<'a, Result<TransactionPage, MiddlewareError>> {
	stream::try_unfold(PageState::Pending(resume_from), move |state| {
		let query = query.clone();
		async move {
			let cursor = match state {
				PageState::Pending(cursor) => cursor,
				PageState::Exhausted => return Ok(None),
			};

			let page = source.transactions_page(&query, cursor.as_ref()).await?;
			let next_state = match &page.next {
				Some(next) => PageState::Pending(Some(next.clone())),
				None => PageState::Exhausted,
			};
			Ok(Some((page, next_state)))
		}
	})
	.boxed()
}

/// Drain every page of `query` into a single vector, in the order the middleware returned them.
pub async fn collect_transactions(
	source: &dyn LedgerSource,
	query: TransactionQuery,
) -> Result<Vec<Transaction>, MiddlewareError> {
	transaction_pages(source, query, None)
		.try_fold(Vec::new(), |mut acc, page| async move {
			acc.extend(page.transactions);
			Ok(acc)
		})
		.await
}
