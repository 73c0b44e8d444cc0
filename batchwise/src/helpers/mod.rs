//! Domain helpers for documents, files and users.
//!
//! Each helper borrows a [`Client`] and turns single-entity endpoints into
//! listing streams and bulk operations. Listings hand a page fetcher to the
//! [`Paginator`]; bulk operations hand one closure per entity to the
//! [`BatchExecutor`](crate::batch::BatchExecutor). Retrying happens in exactly
//! one of those layers, so the closures issue single attempts.

pub mod databases;
pub mod storage;
pub mod users;

pub use databases::{Databases, OffsetPage};
pub use storage::{FileUpload, Storage};
pub use users::{NewUser, ProfileUpdate, Users};

use serde_json::{json, Value};

use crate::batch::{BatchExecutor, BatchItem, BatchResult};
use crate::classify::{classify, ClassifiedError, ErrorKind};
use crate::client::Client;
use crate::paginate::{Page, PageCursor, PageFetcher, Paginator};
use crate::query::Query;
use crate::retry::Operation;
use crate::transport::{Method, TransportFailure};

/// Placeholder id asking the service to generate one.
pub const UNIQUE_ID: &str = "unique()";

/// Attribute holding an entity's id.
pub const ID_FIELD: &str = "$id";

/// The `$id` of an entity, if present.
pub fn entity_id(entity: &Value) -> Option<&str> {
    entity.get(ID_FIELD).and_then(Value::as_str)
}

/// Listing body for `queries`.
pub(crate) fn list_payload(queries: &[Query]) -> Value {
    json!({ "queries": queries })
}

/// Caller queries for a listing, split by how the paginator treats them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ListingQueries {
    filters: Vec<Query>,
    ordering: Vec<Query>,
    limit: Option<u32>,
    offset: Option<u32>,
    cursor: Option<Query>,
}

impl ListingQueries {
    /// Later `limit`/`offset` queries replace earlier ones.
    fn split(queries: Vec<Query>) -> Self {
        let mut split = Self::default();
        for query in queries {
            match query {
                Query::Limit(n) => split.limit = Some(n),
                Query::Offset(n) => split.offset = Some(n),
                Query::CursorAfter(_) | Query::CursorBefore(_) => split.cursor = Some(query),
                query if query.is_filter() => split.filters.push(query),
                query => split.ordering.push(query),
            }
        }
        split
    }

    /// Queries for the page after `cursor`; the offset only applies to the
    /// first page.
    fn for_page(&self, cursor: Option<String>, page_size: u32) -> Result<Vec<Query>, ClassifiedError> {
        if let Some(query) = &self.cursor {
            return Err(ClassifiedError::new(
                ErrorKind::InvalidInput,
                format!("listings manage their own cursor; remove `{query}`"),
            ));
        }
        let mut queries: Vec<Query> = self.filters.iter().chain(&self.ordering).cloned().collect();
        match cursor {
            Some(cursor) => queries.push(Query::cursor_after(cursor)),
            None => {
                if let Some(offset) = self.offset.filter(|offset| *offset > 0) {
                    queries.push(Query::offset(offset));
                }
            }
        }
        queries.push(Query::limit(page_size));
        Ok(queries)
    }
}

/// Paginator over a listing endpoint whose response holds its entities
/// under `items_key`.
///
/// Filters and ordering from `queries` go on every page request, followed by
/// `cursorAfter(<last $id>)` and `limit(page size)`; a full page means more
/// may follow. A caller `limit` caps the total number of items, a caller
/// `offset` skips items before the first page, and a caller cursor is
/// rejected as invalid input.
pub(crate) fn listing<'a>(
    client: &'a Client,
    path: String,
    queries: Vec<Query>,
    items_key: &'static str,
) -> Paginator<impl PageFetcher<Item = Value, Failure = ClassifiedError> + 'a> {
    let page_size = client.config().page_size().into_inner();
    let queries = ListingQueries::split(queries);
    let item_limit = queries.limit;
    let fetcher = move |cursor: Option<String>| {
        let page_queries = queries.for_page(cursor, page_size);
        let path = path.clone();
        async move {
            let page_queries = page_queries?;
            let response = client
                .request_once(Method::Get, &path, Some(list_payload(&page_queries)))
                .await
                .map_err(|failure| classify(&failure))?;
            parse_page(response, items_key, page_size as usize)
        }
    };
    let paginator = Paginator::new(fetcher, client.config().retry());
    match item_limit {
        Some(limit) => paginator.with_item_limit(limit as usize),
        None => paginator,
    }
}

/// Entities listed under `items_key` in a listing response.
pub(crate) fn listed_items(
    mut response: Value,
    items_key: &'static str,
) -> Result<Vec<Value>, ClassifiedError> {
    match response.get_mut(items_key).map(Value::take) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(ClassifiedError::fatal(format!(
            "listing response has no `{items_key}` array"
        ))),
    }
}

/// The `total` reported by a listing response.
pub(crate) fn listed_total(response: &Value) -> Result<u64, ClassifiedError> {
    response
        .get("total")
        .and_then(Value::as_u64)
        .ok_or_else(|| ClassifiedError::fatal("listing response has no `total`"))
}

fn parse_page(
    response: Value,
    items_key: &'static str,
    page_size: usize,
) -> Result<Page<Value>, ClassifiedError> {
    let items = listed_items(response, items_key)?;
    if items.len() < page_size {
        return Ok(Page::last(items));
    }
    let last_id = items.last().and_then(entity_id).map(ToString::to_string);
    Ok(match last_id {
        Some(id) => Page::more(items, id),
        None => Page {
            items,
            cursor: PageCursor {
                token: None,
                has_more: true,
            },
        },
    })
}

/// Batch item issuing one `method` request to `path` per attempt.
pub(crate) fn request_item<K>(
    client: &Client,
    key: K,
    method: Method,
    path: String,
    payload: Option<Value>,
) -> BatchItem<K, impl Operation<Output = Value, Failure = TransportFailure> + '_> {
    BatchItem::new(key, move || {
        let path = path.clone();
        let payload = payload.clone();
        async move { client.request_once(method, &path, payload).await }
    })
}

/// Run `items` under the client's retry policy and concurrency limit.
pub(crate) async fn run_batch<K, O>(
    client: &Client,
    items: Vec<BatchItem<K, O>>,
) -> BatchResult<K, O::Output>
where
    O: Operation,
{
    BatchExecutor::new(client.config().retry())
        .with_concurrency(client.config().concurrency())
        .execute(items)
        .await
}
