//! Document helpers.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{entity_id, list_payload, listed_items, listed_total, listing, request_item, run_batch, UNIQUE_ID};
use crate::batch::BatchResult;
use crate::classify::{ClassifiedError, ErrorKind};
use crate::client::Client;
use crate::paginate::{PageFetcher, Paginator};
use crate::query::Query;
use crate::transport::Method;

const ITEMS_KEY: &str = "documents";

fn documents_path(database_id: &str, collection_id: &str) -> String {
    format!("/databases/{database_id}/collections/{collection_id}/documents")
}

fn document_path(database_id: &str, collection_id: &str, document_id: &str) -> String {
    format!("{}/{document_id}", documents_path(database_id, collection_id))
}

/// One offset-addressed window of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetPage {
    /// Documents in the window.
    pub documents: Vec<Value>,
    /// Documents matching the filters, across all windows.
    pub total: u64,
    /// Position of the first document in the window.
    pub offset: u32,
    /// Requested window size.
    pub limit: u32,
    /// True when documents remain past this window.
    pub has_more: bool,
}

impl OffsetPage {
    fn new(documents: Vec<Value>, total: u64, offset: u32, limit: u32) -> Self {
        Self {
            documents,
            total,
            offset,
            limit,
            has_more: u64::from(offset) + u64::from(limit) < total,
        }
    }
}

/// Document operations on one client.
#[derive(Debug, Clone, Copy)]
pub struct Databases<'a> {
    client: &'a Client,
}

impl<'a> Databases<'a> {
    /// Helpers bound to `client`.
    pub const fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Every document matching `filters`, page by page.
    pub fn list_documents(
        &self,
        database_id: &str,
        collection_id: &str,
        filters: Vec<Query>,
    ) -> Paginator<impl PageFetcher<Item = Value, Failure = ClassifiedError> + 'a> {
        listing(
            self.client,
            documents_path(database_id, collection_id),
            filters,
            ITEMS_KEY,
        )
    }

    /// Every document matching `filters`, collected into memory.
    pub async fn get_all_documents(
        &self,
        database_id: &str,
        collection_id: &str,
        filters: Vec<Query>,
    ) -> Result<Vec<Value>, ClassifiedError> {
        self.list_documents(database_id, collection_id, filters)
            .collect_all()
            .await
    }

    /// The `limit` documents matching `filters` that start at `offset`,
    /// fetched in one request. `limit` and `offset` replace any window
    /// queries in `filters`.
    pub async fn get_documents_paginated(
        &self,
        database_id: &str,
        collection_id: &str,
        filters: Vec<Query>,
        limit: u32,
        offset: u32,
    ) -> Result<OffsetPage, ClassifiedError> {
        let mut queries = filters;
        queries.extend([Query::limit(limit), Query::offset(offset)]);
        let response = self
            .client
            .request_with_retry(
                Method::Get,
                &documents_path(database_id, collection_id),
                Some(list_payload(&queries)),
            )
            .await?;
        let total = listed_total(&response)?;
        let documents = listed_items(response, ITEMS_KEY)?;
        Ok(OffsetPage::new(documents, total, offset, limit))
    }

    /// One document by id.
    pub async fn get_document(
        &self,
        database_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(
                Method::Get,
                &document_path(database_id, collection_id, document_id),
                None,
            )
            .await
    }

    /// First document whose `attribute` equals `value`.
    pub async fn find_document(
        &self,
        database_id: &str,
        collection_id: &str,
        attribute: &str,
        value: &str,
    ) -> Result<Option<Value>, ClassifiedError> {
        let queries = [Query::equal(attribute, value), Query::limit(1)];
        let response = self
            .client
            .request_with_retry(
                Method::Get,
                &documents_path(database_id, collection_id),
                Some(list_payload(&queries)),
            )
            .await?;
        Ok(listed_items(response, ITEMS_KEY)?.into_iter().next())
    }

    /// Number of documents matching `filters`.
    pub async fn count_documents(
        &self,
        database_id: &str,
        collection_id: &str,
        filters: Vec<Query>,
    ) -> Result<u64, ClassifiedError> {
        let mut queries = filters;
        queries.push(Query::limit(1));
        let response = self
            .client
            .request_with_retry(
                Method::Get,
                &documents_path(database_id, collection_id),
                Some(list_payload(&queries)),
            )
            .await?;
        listed_total(&response)
    }

    /// Whether a document exists. Any failure other than not-found is
    /// returned as an error.
    pub async fn document_exists(
        &self,
        database_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<bool, ClassifiedError> {
        match self
            .get_document(database_id, collection_id, document_id)
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if error.kind == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Create one document with a generated id.
    pub async fn create_document(
        &self,
        database_id: &str,
        collection_id: &str,
        data: Value,
    ) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(
                Method::Post,
                &documents_path(database_id, collection_id),
                Some(json!({ "documentId": UNIQUE_ID, "data": data })),
            )
            .await
    }

    /// Merge `data` into one document.
    pub async fn update_document(
        &self,
        database_id: &str,
        collection_id: &str,
        document_id: &str,
        data: Value,
    ) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(
                Method::Patch,
                &document_path(database_id, collection_id, document_id),
                Some(json!({ "data": data })),
            )
            .await
    }

    /// Delete one document.
    pub async fn delete_document(
        &self,
        database_id: &str,
        collection_id: &str,
        document_id: &str,
    ) -> Result<(), ClassifiedError> {
        self.client
            .request_with_retry(
                Method::Delete,
                &document_path(database_id, collection_id, document_id),
                None,
            )
            .await
            .map(drop)
    }

    /// Create every document in `documents`, keyed by input position.
    #[instrument(
        name = "databases.bulk_create",
        skip(self, documents),
        fields(count = documents.len())
    )]
    pub async fn bulk_create_documents(
        &self,
        database_id: &str,
        collection_id: &str,
        documents: Vec<Value>,
    ) -> BatchResult<usize, Value> {
        let path = documents_path(database_id, collection_id);
        let items = documents
            .into_iter()
            .enumerate()
            .map(|(index, data)| {
                request_item(
                    self.client,
                    index,
                    Method::Post,
                    path.clone(),
                    Some(json!({ "documentId": UNIQUE_ID, "data": data })),
                )
            })
            .collect();
        run_batch(self.client, items).await
    }

    /// Merge `data` into every document matching `filters`, keyed by id.
    ///
    /// Fails only if the matching documents cannot be listed.
    #[instrument(name = "databases.bulk_update", skip(self, filters, data))]
    pub async fn bulk_update_documents(
        &self,
        database_id: &str,
        collection_id: &str,
        filters: Vec<Query>,
        data: Value,
    ) -> Result<BatchResult<String, Value>, ClassifiedError> {
        let ids = self
            .matching_ids(database_id, collection_id, filters)
            .await?;
        info!(matched = ids.len(), "[databases.bulk_update] updating matches");
        let payload = json!({ "data": data });
        let items = ids
            .into_iter()
            .map(|id| {
                let path = document_path(database_id, collection_id, &id);
                request_item(self.client, id, Method::Patch, path, Some(payload.clone()))
            })
            .collect();
        Ok(run_batch(self.client, items).await)
    }

    /// Delete every document matching `filters`, keyed by id.
    ///
    /// Fails only if the matching documents cannot be listed.
    #[instrument(name = "databases.bulk_delete", skip(self, filters))]
    pub async fn bulk_delete_documents(
        &self,
        database_id: &str,
        collection_id: &str,
        filters: Vec<Query>,
    ) -> Result<BatchResult<String, ()>, ClassifiedError> {
        let ids = self
            .matching_ids(database_id, collection_id, filters)
            .await?;
        info!(matched = ids.len(), "[databases.bulk_delete] deleting matches");
        let items = ids
            .into_iter()
            .map(|id| {
                let path = document_path(database_id, collection_id, &id);
                request_item(self.client, id, Method::Delete, path, None)
            })
            .collect();
        Ok(run_batch(self.client, items).await.map_values(drop))
    }

    async fn matching_ids(
        &self,
        database_id: &str,
        collection_id: &str,
        filters: Vec<Query>,
    ) -> Result<Vec<String>, ClassifiedError> {
        self.get_all_documents(database_id, collection_id, filters)
            .await?
            .iter()
            .map(|document| {
                entity_id(document)
                    .map(ToString::to_string)
                    .ok_or_else(|| ClassifiedError::fatal("listed document has no `$id`"))
            })
            .collect()
    }
}
