//! In-memory simulation of the remote service for `batchwise`
//!
//! This crate provides an implementation of the [`Transport`] trait that
//! serves documents, files and users from process memory, useful for
//! testing and development where a real service is not available.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod listing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use batchwise::helpers::{ID_FIELD, UNIQUE_ID};
use batchwise::{Method, Transport, TransportFailure};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

const MAX_ID_LEN: usize = 36;

type CollectionKey = (String, String);

enum Route<'p> {
    Health,
    Documents { database: &'p str, collection: &'p str },
    Document { database: &'p str, collection: &'p str, id: &'p str },
    Files { bucket: &'p str },
    File { bucket: &'p str, id: &'p str },
    FileDownload { bucket: &'p str, id: &'p str },
    Users,
    User { id: &'p str },
    UserStatus { id: &'p str },
    UserSessions { id: &'p str },
}

fn route(path: &str) -> Option<Route<'_>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    Some(match segments[..] {
        ["health"] => Route::Health,
        ["databases", database, "collections", collection, "documents"] => Route::Documents {
            database,
            collection,
        },
        ["databases", database, "collections", collection, "documents", id] => Route::Document {
            database,
            collection,
            id,
        },
        ["storage", "buckets", bucket, "files"] => Route::Files { bucket },
        ["storage", "buckets", bucket, "files", id] => Route::File { bucket, id },
        ["storage", "buckets", bucket, "files", id, "download"] => Route::FileDownload { bucket, id },
        ["users"] => Route::Users,
        ["users", id] => Route::User { id },
        ["users", id, "status"] => Route::UserStatus { id },
        ["users", id, "sessions"] => Route::UserSessions { id },
        _ => return None,
    })
}

/// Thread-safe in-memory service for testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryService {
    // Documents per (database, collection), in creation order
    documents: Arc<RwLock<HashMap<CollectionKey, Vec<Value>>>>,
    // Files per bucket, in creation order
    files: Arc<RwLock<HashMap<String, Vec<Value>>>>,
    // Uploaded bytes per (bucket, file id)
    contents: Arc<RwLock<HashMap<CollectionKey, Vec<u8>>>>,
    users: Arc<RwLock<Vec<Value>>>,
    // Sessions per user id
    sessions: Arc<RwLock<HashMap<String, Vec<Value>>>>,
    requests: Arc<AtomicUsize>,
}

impl InMemoryService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests handled so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Snapshot of a collection.
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Value> {
        self.documents
            .read()
            .get(&(database.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of a bucket.
    pub fn files(&self, bucket: &str) -> Vec<Value> {
        self.files.read().get(bucket).cloned().unwrap_or_default()
    }

    /// Snapshot of all users.
    pub fn users(&self) -> Vec<Value> {
        self.users.read().clone()
    }

    /// Open a session for an existing user, as a login would. `None` when
    /// the user does not exist.
    pub fn open_session(&self, user_id: &str) -> Option<Value> {
        if find(&self.users.read(), user_id).is_none() {
            return None;
        }
        let session = json!({
            ID_FIELD: generated_id(),
            "userId": user_id,
            "$createdAt": timestamp(),
        });
        self.sessions
            .write()
            .entry(user_id.to_string())
            .or_default()
            .push(session.clone());
        Some(session)
    }

    fn handle(
        &self,
        method: Method,
        route: Route<'_>,
        payload: Option<Value>,
    ) -> Result<Value, TransportFailure> {
        match (method, route) {
            (Method::Get, Route::Health) => Ok(json!({ "status": "pass" })),

            (Method::Get, Route::Documents { database, collection }) => {
                let documents = self.documents.read();
                let listed = documents
                    .get(&(database.to_string(), collection.to_string()))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                listing::list(listed, payload.as_ref(), "documents")
            }
            (Method::Post, Route::Documents { database, collection }) => {
                let body = object_body(payload)?;
                let id = requested_id(&body, "documentId")?;
                let mut entity = match body.get("data") {
                    Some(Value::Object(data)) => data.clone(),
                    _ => return Err(bad_request("`data` must be a JSON object")),
                };
                let now = timestamp();
                entity.insert(ID_FIELD.to_string(), json!(id));
                entity.insert("$databaseId".to_string(), json!(database));
                entity.insert("$collectionId".to_string(), json!(collection));
                entity.insert("$createdAt".to_string(), json!(now));
                entity.insert("$updatedAt".to_string(), json!(now));

                let mut documents = self.documents.write();
                let stored = documents
                    .entry((database.to_string(), collection.to_string()))
                    .or_default();
                insert_unique(stored, entity, "Document with the requested ID already exists")
            }
            (Method::Get, Route::Document { database, collection, id }) => {
                let documents = self.documents.read();
                documents
                    .get(&(database.to_string(), collection.to_string()))
                    .and_then(|stored| find(stored, id))
                    .cloned()
                    .ok_or_else(|| not_found("Document", id))
            }
            (Method::Patch | Method::Put, Route::Document { database, collection, id }) => {
                let data = match object_body(payload)?.remove("data") {
                    Some(Value::Object(data)) => data,
                    _ => return Err(bad_request("`data` must be a JSON object")),
                };
                let mut documents = self.documents.write();
                let entity = documents
                    .get_mut(&(database.to_string(), collection.to_string()))
                    .and_then(|stored| find_mut(stored, id))
                    .ok_or_else(|| not_found("Document", id))?;
                merge(entity, data);
                Ok(entity.clone())
            }
            (Method::Delete, Route::Document { database, collection, id }) => {
                let mut documents = self.documents.write();
                documents
                    .get_mut(&(database.to_string(), collection.to_string()))
                    .and_then(|stored| remove(stored, id))
                    .map(|_| json!({}))
                    .ok_or_else(|| not_found("Document", id))
            }

            (Method::Get, Route::Files { bucket }) => {
                let files = self.files.read();
                let listed = files.get(bucket).map(Vec::as_slice).unwrap_or_default();
                listing::list(listed, payload.as_ref(), "files")
            }
            (Method::Post, Route::Files { bucket }) => {
                let body = object_body(payload)?;
                let id = requested_id(&body, "fileId")?;
                let name = required_text(&body, "name")?;
                let content = match body.get("content") {
                    Some(Value::Array(bytes)) => bytes
                        .iter()
                        .map(|byte| byte.as_u64().and_then(|byte| u8::try_from(byte).ok()))
                        .collect::<Option<Vec<u8>>>()
                        .ok_or_else(|| bad_request("`content` must be an array of bytes"))?,
                    None => Vec::new(),
                    Some(_) => return Err(bad_request("`content` must be an array of bytes")),
                };
                let mime_type = body
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("application/octet-stream");
                let entity = json!({
                    ID_FIELD: id,
                    "bucketId": bucket,
                    "name": name,
                    "mimeType": mime_type,
                    "sizeOriginal": content.len(),
                    "$createdAt": timestamp(),
                });

                let mut files = self.files.write();
                let stored = files.entry(bucket.to_string()).or_default();
                let created =
                    insert_unique(stored, into_object(entity), "File with the requested ID already exists")?;
                self.contents
                    .write()
                    .insert((bucket.to_string(), id), content);
                Ok(created)
            }
            (Method::Get, Route::File { bucket, id }) => {
                let files = self.files.read();
                files
                    .get(bucket)
                    .and_then(|stored| find(stored, id))
                    .cloned()
                    .ok_or_else(|| not_found("File", id))
            }
            (Method::Get, Route::FileDownload { bucket, id }) => {
                let contents = self.contents.read();
                contents
                    .get(&(bucket.to_string(), id.to_string()))
                    .map(|content| json!({ "content": content }))
                    .ok_or_else(|| not_found("File", id))
            }
            (Method::Delete, Route::File { bucket, id }) => {
                let mut files = self.files.write();
                files
                    .get_mut(bucket)
                    .and_then(|stored| remove(stored, id))
                    .ok_or_else(|| not_found("File", id))?;
                self.contents
                    .write()
                    .remove(&(bucket.to_string(), id.to_string()));
                Ok(json!({}))
            }

            (Method::Get, Route::Users) => {
                let users = self.users.read();
                listing::list(&users, payload.as_ref(), "users")
            }
            (Method::Post, Route::Users) => {
                let body = object_body(payload)?;
                let id = requested_id(&body, "userId")?;
                let email = required_text(&body, "email")?;
                if !email.contains('@') {
                    return Err(bad_request(format!("invalid email `{email}`")));
                }
                let entity = json!({
                    ID_FIELD: id,
                    "email": email,
                    "name": body.get("name").cloned().unwrap_or(Value::Null),
                    "phone": body.get("phone").cloned().unwrap_or(Value::Null),
                    "status": true,
                    "$createdAt": timestamp(),
                });

                let mut users = self.users.write();
                if users.iter().any(|user| user["email"] == email) {
                    return Err(TransportFailure::from_status(
                        409,
                        "A user with the same email already exists",
                    ));
                }
                insert_unique(&mut users, into_object(entity), "User with the requested ID already exists")
            }
            (Method::Get, Route::User { id }) => {
                let users = self.users.read();
                find(&users, id).cloned().ok_or_else(|| not_found("User", id))
            }
            (Method::Patch | Method::Put, Route::User { id }) => {
                let mut data = object_body(payload)?;
                data.remove(ID_FIELD);
                data.remove("password");
                let mut users = self.users.write();
                if let Some(email) = data.get("email") {
                    let Some(text) = email.as_str().filter(|text| text.contains('@')) else {
                        return Err(bad_request(format!("invalid email {email}")));
                    };
                    if users.iter().any(|user| user["email"] == text && id_of(user) != Some(id)) {
                        return Err(TransportFailure::from_status(
                            409,
                            "A user with the same email already exists",
                        ));
                    }
                }
                let entity = find_mut(&mut users, id).ok_or_else(|| not_found("User", id))?;
                merge(entity, data);
                Ok(entity.clone())
            }
            (Method::Patch | Method::Put, Route::UserStatus { id }) => {
                let status = match object_body(payload)?.remove("status") {
                    Some(Value::Bool(status)) => status,
                    _ => return Err(bad_request("`status` must be a boolean")),
                };
                let mut users = self.users.write();
                let entity = find_mut(&mut users, id).ok_or_else(|| not_found("User", id))?;
                let mut data = Map::new();
                data.insert("status".to_string(), json!(status));
                merge(entity, data);
                Ok(entity.clone())
            }
            (Method::Delete, Route::User { id }) => {
                let mut users = self.users.write();
                remove(&mut users, id).ok_or_else(|| not_found("User", id))?;
                self.sessions.write().remove(id);
                Ok(json!({}))
            }
            (Method::Get, Route::UserSessions { id }) => {
                if find(&self.users.read(), id).is_none() {
                    return Err(not_found("User", id));
                }
                let sessions = self.sessions.read();
                let listed = sessions.get(id).cloned().unwrap_or_default();
                Ok(json!({ "total": listed.len(), "sessions": listed }))
            }
            (Method::Delete, Route::UserSessions { id }) => {
                if find(&self.users.read(), id).is_none() {
                    return Err(not_found("User", id));
                }
                self.sessions.write().remove(id);
                Ok(json!({}))
            }

            (method, _) => Err(TransportFailure::from_status(
                405,
                format!("method {method} not allowed on this route"),
            )),
        }
    }
}

#[async_trait]
impl Transport for InMemoryService {
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value, TransportFailure> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        debug!(method = %method, path, "[memory.request] handling request");
        let route = route(path).ok_or_else(|| {
            TransportFailure::from_status(404, format!("route `{path}` not found"))
        })?;
        self.handle(method, route, payload)
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn bad_request(message: impl Into<String>) -> TransportFailure {
    TransportFailure::from_status(400, message)
}

fn not_found(entity: &str, id: &str) -> TransportFailure {
    TransportFailure::from_status(404, format!("{entity} with the requested ID `{id}` could not be found"))
}

fn object_body(payload: Option<Value>) -> Result<Map<String, Value>, TransportFailure> {
    match payload {
        Some(Value::Object(body)) => Ok(body),
        _ => Err(bad_request("request body must be a JSON object")),
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn required_text(body: &Map<String, Value>, field: &str) -> Result<String, TransportFailure> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| bad_request(format!("`{field}` is required")))
}

/// Id requested in `field`: generated for `unique()` or when absent.
fn requested_id(body: &Map<String, Value>, field: &str) -> Result<String, TransportFailure> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(generated_id()),
        Some(Value::String(id)) if id == UNIQUE_ID => Ok(generated_id()),
        Some(Value::String(id)) if is_valid_id(id) => Ok(id.clone()),
        Some(other) => Err(bad_request(format!("invalid `{field}`: {other}"))),
    }
}

fn generated_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with(['.', '-', '_'])
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn id_of(entity: &Value) -> Option<&str> {
    entity.get(ID_FIELD).and_then(Value::as_str)
}

fn find<'v>(stored: &'v [Value], id: &str) -> Option<&'v Value> {
    stored.iter().find(|entity| id_of(entity) == Some(id))
}

fn find_mut<'v>(stored: &'v mut [Value], id: &str) -> Option<&'v mut Value> {
    stored.iter_mut().find(|entity| id_of(entity) == Some(id))
}

fn remove(stored: &mut Vec<Value>, id: &str) -> Option<Value> {
    let position = stored.iter().position(|entity| id_of(entity) == Some(id))?;
    Some(stored.remove(position))
}

fn insert_unique(
    stored: &mut Vec<Value>,
    entity: Map<String, Value>,
    conflict: &str,
) -> Result<Value, TransportFailure> {
    let entity = Value::Object(entity);
    if let Some(id) = id_of(&entity) {
        if find(stored, id).is_some() {
            return Err(TransportFailure::from_status(409, conflict));
        }
    }
    stored.push(entity.clone());
    Ok(entity)
}

fn merge(entity: &mut Value, data: Map<String, Value>) {
    if let Value::Object(fields) = entity {
        for (key, value) in data {
            if !key.starts_with('$') {
                fields.insert(key, value);
            }
        }
        if fields.contains_key("$updatedAt") {
            fields.insert("$updatedAt".to_string(), json!(timestamp()));
        }
    }
}
