//! User helpers.

use std::fmt;

use serde_json::{json, Value};
use tracing::instrument;

use super::{list_payload, listed_items, listing, request_item, run_batch, UNIQUE_ID};
use crate::batch::BatchResult;
use crate::classify::{ClassifiedError, ErrorKind};
use crate::client::Client;
use crate::paginate::{PageFetcher, Paginator};
use crate::query::Query;
use crate::transport::Method;

const USERS_PATH: &str = "/users";
const ITEMS_KEY: &str = "users";

const SESSIONS_KEY: &str = "sessions";

fn user_path(user_id: &str) -> String {
    format!("{USERS_PATH}/{user_id}")
}

fn status_path(user_id: &str) -> String {
    format!("{}/status", user_path(user_id))
}

fn sessions_path(user_id: &str) -> String {
    format!("{}/{SESSIONS_KEY}", user_path(user_id))
}

/// Account to create.
#[derive(Clone, PartialEq, Eq)]
pub struct NewUser {
    /// Login email, unique per project.
    pub email: String,
    /// Initial password.
    pub password: String,
    /// Display name.
    pub name: Option<String>,
    /// Phone number.
    pub phone: Option<String>,
}

impl NewUser {
    /// Account with `email` and `password`.
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            name: None,
            phone: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    fn payload(&self) -> Value {
        json!({
            "userId": UNIQUE_ID,
            "email": self.email,
            "password": self.password,
            "name": self.name,
            "phone": self.phone,
        })
    }
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("email", &self.email)
            .field("password", &"***")
            .field("name", &self.name)
            .field("phone", &self.phone)
            .finish()
    }
}

/// Changes to an existing account. Unset fields are left alone.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New login email.
    pub email: Option<String>,
    /// New phone number.
    pub phone: Option<String>,
    /// New password.
    pub password: Option<String>,
}

impl ProfileUpdate {
    /// An update that changes nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Change the login email.
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Change the phone number.
    #[must_use]
    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Change the password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// True when no field is set.
    pub const fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.password.is_none()
    }

    fn payload(&self) -> Value {
        let fields = [
            ("name", &self.name),
            ("email", &self.email),
            ("phone", &self.phone),
            ("password", &self.password),
        ];
        Value::Object(
            fields
                .into_iter()
                .filter_map(|(field, value)| value.as_ref().map(|value| (field.to_string(), json!(value))))
                .collect(),
        )
    }
}

impl fmt::Debug for ProfileUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileUpdate")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("phone", &self.phone)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// User operations on one client.
#[derive(Debug, Clone, Copy)]
pub struct Users<'a> {
    client: &'a Client,
}

impl<'a> Users<'a> {
    /// Helpers bound to `client`.
    pub const fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Every user matching `filters`, page by page.
    pub fn list_users(
        &self,
        filters: Vec<Query>,
    ) -> Paginator<impl PageFetcher<Item = Value, Failure = ClassifiedError> + 'a> {
        listing(self.client, USERS_PATH.to_string(), filters, ITEMS_KEY)
    }

    /// One user by id.
    pub async fn get_user(&self, user_id: &str) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(Method::Get, &user_path(user_id), None)
            .await
    }

    /// Create one user with a generated id.
    pub async fn create_user(&self, user: &NewUser) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(Method::Post, USERS_PATH, Some(user.payload()))
            .await
    }

    /// The user registered with `email`, if any.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<Value>, ClassifiedError> {
        self.find_user_by("email", email).await
    }

    /// The user registered with `phone`, if any.
    pub async fn find_user_by_phone(&self, phone: &str) -> Result<Option<Value>, ClassifiedError> {
        self.find_user_by("phone", phone).await
    }

    async fn find_user_by(&self, attribute: &str, value: &str) -> Result<Option<Value>, ClassifiedError> {
        let queries = [Query::equal(attribute, value), Query::limit(1)];
        let response = self
            .client
            .request_with_retry(Method::Get, USERS_PATH, Some(list_payload(&queries)))
            .await?;
        Ok(listed_items(response, ITEMS_KEY)?.into_iter().next())
    }

    /// Apply `update` to one user. An empty update is rejected without a
    /// request.
    #[instrument(name = "users.update_profile", skip(self, update))]
    pub async fn update_user_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Value, ClassifiedError> {
        if update.is_empty() {
            return Err(ClassifiedError::new(
                ErrorKind::InvalidInput,
                "profile update sets no fields",
            ));
        }
        self.client
            .request_with_retry(Method::Patch, &user_path(user_id), Some(update.payload()))
            .await
    }

    /// Enable or block one user.
    pub async fn update_user_status(
        &self,
        user_id: &str,
        enabled: bool,
    ) -> Result<Value, ClassifiedError> {
        self.client
            .request_with_retry(
                Method::Patch,
                &status_path(user_id),
                Some(json!({ "status": enabled })),
            )
            .await
    }

    /// Active sessions of one user.
    pub async fn get_user_sessions(&self, user_id: &str) -> Result<Vec<Value>, ClassifiedError> {
        let response = self
            .client
            .request_with_retry(Method::Get, &sessions_path(user_id), None)
            .await?;
        listed_items(response, SESSIONS_KEY)
    }

    /// End every session of one user.
    pub async fn delete_user_sessions(&self, user_id: &str) -> Result<(), ClassifiedError> {
        self.client
            .request_with_retry(Method::Delete, &sessions_path(user_id), None)
            .await
            .map(drop)
    }

    /// Delete one user.
    pub async fn delete_user(&self, user_id: &str) -> Result<(), ClassifiedError> {
        self.client
            .request_with_retry(Method::Delete, &user_path(user_id), None)
            .await
            .map(drop)
    }

    /// Create every user, keyed by email.
    #[instrument(name = "users.bulk_create", skip_all, fields(count = users.len()))]
    pub async fn bulk_create_users(&self, users: Vec<NewUser>) -> BatchResult<String, Value> {
        let items = users
            .into_iter()
            .map(|user| {
                let payload = user.payload();
                request_item(self.client, user.email, Method::Post, USERS_PATH.to_string(), Some(payload))
            })
            .collect();
        run_batch(self.client, items).await
    }

    /// Delete every user in `user_ids`, keyed by id.
    #[instrument(name = "users.bulk_delete", skip_all, fields(count = user_ids.len()))]
    pub async fn bulk_delete_users(&self, user_ids: Vec<String>) -> BatchResult<String, ()> {
        let items = user_ids
            .into_iter()
            .map(|id| {
                let path = user_path(&id);
                request_item(self.client, id, Method::Delete, path, None)
            })
            .collect();
        run_batch(self.client, items).await.map_values(drop)
    }
}
