//! File helpers.

use std::fmt;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{listing, request_item, run_batch, UNIQUE_ID};
use crate::batch::BatchResult;
use crate::classify::ClassifiedError;
use crate::client::Client;
use crate::paginate::{PageFetcher, Paginator};
use crate::query::Query;
use crate::transport::Method;

const ITEMS_KEY: &str = "files";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

fn files_path(bucket_id: &str) -> String {
    format!("/storage/buckets/{bucket_id}/files")
}

fn file_path(bucket_id: &str, file_id: &str) -> String {
    format!("{}/{file_id}", files_path(bucket_id))
}

fn download_path(bucket_id: &str, file_id: &str) -> String {
    format!("{}/download", file_path(bucket_id, file_id))
}

/// Bytes of a download response, sent as `{"content": [u8, ..]}`.
fn downloaded_bytes(response: &Value) -> Result<Vec<u8>, ClassifiedError> {
    let malformed = || ClassifiedError::fatal("download response has no `content` bytes");
    response
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(malformed)?
        .iter()
        .map(|byte| {
            byte.as_u64()
                .and_then(|byte| u8::try_from(byte).ok())
                .ok_or_else(malformed)
        })
        .collect()
}

/// A file to upload.
#[derive(Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// File name shown by the service.
    pub name: String,
    /// Content type.
    pub mime_type: String,
    /// Raw bytes.
    pub content: Vec<u8>,
}

impl FileUpload {
    /// Upload of `content` named `name` with a content type guessed from the
    /// extension.
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        let mime_type = guess_mime_type(&name).to_string();
        Self {
            name,
            mime_type,
            content: content.into(),
        }
    }

    /// Override the content type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    fn payload(&self) -> Value {
        json!({
            "fileId": UNIQUE_ID,
            "name": self.name,
            "mimeType": self.mime_type,
            "content": self.content,
        })
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.content.len())
            .finish()
    }
}

fn guess_mime_type(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// File operations on one client.
#[derive(Debug, Clone, Copy)]
pub struct Storage<'a> {
    client: &'a Client,
}

impl<'a> Storage<'a> {
    /// Helpers bound to `client`.
    pub const fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Every file in `bucket_id` matching `filters`, page by page.
    pub fn list_files(
        &self,
        bucket_id: &str,
        filters: Vec<Query>,
    ) -> Paginator<impl PageFetcher<Item = Value, Failure = ClassifiedError> + 'a> {
        listing(self.client, files_path(bucket_id), filters, ITEMS_KEY)
    }

    /// Metadata of one file.
    pub async fn get_file(&self, bucket_id: &str, file_id: &str) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(Method::Get, &file_path(bucket_id, file_id), None)
            .await
    }

    /// Raw content of one file.
    #[instrument(name = "storage.download", skip(self))]
    pub async fn download_file(&self, bucket_id: &str, file_id: &str) -> Result<Vec<u8>, ClassifiedError> {
        let response = self
            .client
            .request_with_retry(Method::Get, &download_path(bucket_id, file_id), None)
            .await?;
        let content = downloaded_bytes(&response)?;
        debug!(bytes = content.len(), "[storage.download] file downloaded");
        Ok(content)
    }

    /// Browser-viewable URL of one file. Built locally; no request is made
    /// and the file is not checked for existence.
    pub fn get_file_url(&self, bucket_id: &str, file_id: &str) -> String {
        let config = self.client.config();
        format!(
            "{}{}/view?project={}",
            config.endpoint().trim_end_matches('/'),
            file_path(bucket_id, file_id),
            config.project_id()
        )
    }

    /// Upload one file with a generated id.
    pub async fn upload_file(
        &self,
        bucket_id: &str,
        file: &FileUpload,
    ) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(Method::Post, &files_path(bucket_id), Some(file.payload()))
            .await
    }

    /// Delete one file.
    pub async fn delete_file(&self, bucket_id: &str, file_id: &str) -> Result<(), ClassifiedError> {
        self.client
            .request_with_retry(Method::Delete, &file_path(bucket_id, file_id), None)
            .await
            .map(drop)
    }

    /// Upload every file, keyed by file name.
    #[instrument(name = "storage.bulk_upload", skip(self, files), fields(count = files.len()))]
    pub async fn bulk_upload_files(
        &self,
        bucket_id: &str,
        files: Vec<FileUpload>,
    ) -> BatchResult<String, Value> {
        let path = files_path(bucket_id);
        let items = files
            .into_iter()
            .map(|file| {
                let payload = file.payload();
                request_item(self.client, file.name, Method::Post, path.clone(), Some(payload))
            })
            .collect();
        run_batch(self.client, items).await
    }

    /// Delete every file in `file_ids`, keyed by id.
    #[instrument(name = "storage.bulk_delete", skip(self, file_ids), fields(count = file_ids.len()))]
    pub async fn bulk_delete_files(
        &self,
        bucket_id: &str,
        file_ids: Vec<String>,
    ) -> BatchResult<String, ()> {
        let items = file_ids
            .into_iter()
            .map(|id| {
                let path = file_path(bucket_id, &id);
                request_item(self.client, id, Method::Delete, path, None)
            })
            .collect();
        run_batch(self.client, items).await.map_values(drop)
    }
}
