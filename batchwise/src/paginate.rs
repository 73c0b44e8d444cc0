//! Cursor-based pagination as a lazy stream.
//!
//! A [`Paginator`] wraps a [`PageFetcher`] and hands out a fresh stream on
//! every call to [`Paginator::pages`] or [`Paginator::items`]. Pages are
//! fetched on demand, one at a time, and every fetch goes through the retry
//! engine.

use std::future::Future;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classify::{ClassifiedError, FailureDetails};
use crate::config::RetryConfig;
use crate::retry::Retrier;

/// Position within a listing as reported by the last fetched page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Opaque token to pass to the next fetch.
    pub token: Option<String>,
    /// Whether the service has more pages after this one.
    pub has_more: bool,
}

impl PageCursor {
    /// Cursor pointing at a following page.
    pub fn next(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            has_more: true,
        }
    }

    /// Cursor of the final page.
    pub const fn end() -> Self {
        Self {
            token: None,
            has_more: false,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Entities on this page, in service order.
    pub items: Vec<T>,
    /// Where the listing continues.
    pub cursor: PageCursor,
}

impl<T> Page<T> {
    /// Page followed by another one at `token`.
    pub fn more(items: Vec<T>, token: impl Into<String>) -> Self {
        Self {
            items,
            cursor: PageCursor::next(token),
        }
    }

    /// Final page.
    pub const fn last(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: PageCursor::end(),
        }
    }
}

/// Fetches a single page given the cursor of the previous one.
///
/// Implemented for every `Fn(Option<String>) -> impl Future<Output =
/// Result<Page<T>, E>>` closure.
pub trait PageFetcher {
    /// Entity type on each page.
    type Item;
    /// Failure handed to the classifier.
    type Failure: FailureDetails;

    /// Fetch the page after `cursor`; `None` requests the first page.
    fn fetch(
        &self,
        cursor: Option<String>,
    ) -> impl Future<Output = Result<Page<Self::Item>, Self::Failure>> + Send;
}

impl<F, Fut, T, E> PageFetcher for F
where
    F: Fn(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>> + Send,
    E: FailureDetails,
{
    type Item = T;
    type Failure = E;

    fn fetch(&self, cursor: Option<String>) -> impl Future<Output = Result<Page<T>, E>> + Send {
        self(cursor)
    }
}

enum Position {
    Start,
    After(String),
    Finished,
}

/// Restartable lazy iteration over a paginated listing.
#[derive(Debug, Clone)]
pub struct Paginator<F> {
    fetcher: F,
    config: RetryConfig,
    cancellation: Option<CancellationToken>,
    item_limit: Option<usize>,
}

impl<F> Paginator<F>
where
    F: PageFetcher,
{
    /// Paginate with `fetcher`, retrying each page fetch under `config`.
    pub fn new(fetcher: F, config: &RetryConfig) -> Self {
        Self {
            fetcher,
            config: config.clone(),
            cancellation: None,
            item_limit: None,
        }
    }

    /// Yield at most `limit` items in total, then stop without fetching
    /// further pages. The page that reaches the limit is truncated and
    /// reported as the last one.
    #[must_use]
    pub const fn with_item_limit(mut self, limit: usize) -> Self {
        self.item_limit = Some(limit);
        self
    }

    /// Stop fetching once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Stream of pages from the start of the listing.
    ///
    /// Ends after the page whose cursor has no more pages, after the first
    /// failure, once the item limit is reached, or when cancelled. A page
    /// announcing more results with a missing or repeated cursor token is
    /// reported as a `Fatal` failure.
    pub fn pages(&self) -> impl Stream<Item = Result<Page<F::Item>, ClassifiedError>> + '_ {
        stream::unfold(
            (Position::Start, self.item_limit),
            move |(position, remaining)| async move {
                let cursor = match position {
                    Position::Finished => return None,
                    Position::Start => None,
                    Position::After(token) => Some(token),
                };
                if remaining == Some(0) {
                    return None;
                }
                if self.is_cancelled() {
                    debug!("[paginate.pages] cancelled, no further pages fetched");
                    return None;
                }

                match self.fetch_page(cursor.as_deref()).await {
                    Ok(mut page) => match next_position(cursor.as_deref(), &page.cursor) {
                        Ok(mut next) => {
                            let remaining = remaining.map(|left| {
                                page.items.truncate(left);
                                left - page.items.len()
                            });
                            if remaining == Some(0) {
                                page.cursor = PageCursor::end();
                                next = Position::Finished;
                            }
                            Some((Ok(page), (next, remaining)))
                        }
                        Err(stalled) => Some((Err(stalled), (Position::Finished, remaining))),
                    },
                    Err(error) => Some((Err(error), (Position::Finished, remaining))),
                }
            },
        )
    }

    /// Stream of individual entities across all pages.
    pub fn items(&self) -> impl Stream<Item = Result<F::Item, ClassifiedError>> + '_ {
        self.pages().flat_map(|page| {
            let flattened: Vec<_> = match page {
                Ok(page) => page.items.into_iter().map(Ok).collect(),
                Err(error) => vec![Err(error)],
            };
            stream::iter(flattened)
        })
    }

    /// Drain the listing into memory.
    pub async fn collect_all(&self) -> Result<Vec<F::Item>, ClassifiedError> {
        self.items().try_collect().await
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<Page<F::Item>, ClassifiedError> {
        debug!(cursor, "[paginate.pages] fetching page");
        let mut retrier = Retrier::new(&self.config);
        if let Some(token) = &self.cancellation {
            retrier = retrier.with_cancellation(token.clone());
        }
        let fetch = || self.fetcher.fetch(cursor.map(ToString::to_string));
        retrier.run(&fetch).await.into_result()
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Where to continue after a page fetched at `previous`.
fn next_position(previous: Option<&str>, cursor: &PageCursor) -> Result<Position, ClassifiedError> {
    if !cursor.has_more {
        return Ok(Position::Finished);
    }
    match cursor.token.as_deref() {
        None => Err(ClassifiedError::fatal(
            "page reported more results without a cursor",
        )),
        Some(token) if Some(token) == previous => Err(ClassifiedError::fatal(format!(
            "pagination made no progress: cursor {token:?} repeated"
        ))),
        Some(token) => Ok(Position::After(token.to_string())),
    }
}

/// Shorthand for [`Paginator::new`].
pub fn paginate<F>(fetcher: F, config: &RetryConfig) -> Paginator<F>
where
    F: PageFetcher,
{
    Paginator::new(fetcher, config)
}
