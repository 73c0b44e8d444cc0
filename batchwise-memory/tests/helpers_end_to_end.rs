//! End-to-end behavior of the entity helpers against the in-memory service.

use std::time::Duration;

use batchwise::{
    Client, ClientConfig, ConcurrencyLimit, ErrorKind, FileUpload, ItemOutcome, NewUser,
    PageSize, ProfileUpdate, Query, RetryConfig,
};
use batchwise_memory::InMemoryService;
use futures::TryStreamExt;
use serde_json::{json, Value};

const DB: &str = "main";
const COL: &str = "tasks";

fn client_with_page_size(page_size: u32) -> (InMemoryService, Client) {
    let service = InMemoryService::new();
    let retry = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter_fraction(0.0)
        .build()
        .unwrap();
    let config = ClientConfig::new("https://memory.test/v1", "project", "secret")
        .with_retry(retry)
        .with_concurrency(ConcurrencyLimit::try_new(3).unwrap())
        .with_page_size(PageSize::try_new(page_size).unwrap());
    let client = Client::new(service.clone(), config).unwrap();
    (service, client)
}

fn tasks(count: usize) -> Vec<Value> {
    (0..count)
        .map(|n| json!({ "n": n, "parity": if n % 2 == 0 { "even" } else { "odd" } }))
        .collect()
}

#[tokio::test]
async fn bulk_created_documents_are_listed_across_pages_in_order() {
    // Given: seven documents created in bulk
    let (service, client) = client_with_page_size(3);
    let created = client
        .databases()
        .bulk_create_documents(DB, COL, tasks(7))
        .await;
    assert!(created.all_succeeded());
    let requests_before_listing = service.request_count();

    // When: listing every document with a page size of three
    let listed = client
        .databases()
        .get_all_documents(DB, COL, Vec::new())
        .await
        .unwrap();

    // Then: all seven come back in creation order from three page fetches
    let numbers: Vec<u64> = listed.iter().map(|doc| doc["n"].as_u64().unwrap()).collect();
    assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(service.request_count() - requests_before_listing, 3);
}

#[tokio::test]
async fn exactly_full_last_page_is_followed_by_an_empty_page() {
    // Given: six documents and a page size of three
    let (_service, client) = client_with_page_size(3);
    client
        .databases()
        .bulk_create_documents(DB, COL, tasks(6))
        .await;

    // When: collecting the pages themselves
    let pages: Vec<_> = client
        .databases()
        .list_documents(DB, COL, Vec::new())
        .pages()
        .try_collect()
        .await
        .unwrap();

    // Then: two full pages and a final empty one end the listing
    let sizes: Vec<usize> = pages.iter().map(|page| page.items.len()).collect();
    assert_eq!(sizes, vec![3, 3, 0]);
    assert!(!pages[2].cursor.has_more);
}

#[tokio::test]
async fn bulk_create_keys_outcomes_by_input_position() {
    // Given: a document that the service rejects in the middle of a batch
    let (service, client) = client_with_page_size(10);
    let documents = vec![json!({ "n": 0 }), json!("not an object"), json!({ "n": 2 })];

    // When: creating the batch
    let result = client
        .databases()
        .bulk_create_documents(DB, COL, documents)
        .await;

    // Then: only the malformed entry fails, as invalid input
    assert_eq!(result.counts.succeeded, 2);
    assert_eq!(result.counts.failed, 1);
    let keys: Vec<usize> = result.entries.iter().map(|entry| entry.key).collect();
    assert_eq!(keys, vec![0, 1, 2]);
    let error = result.entries[1].outcome.error().unwrap();
    assert_eq!(error.kind, ErrorKind::InvalidInput);
    assert_eq!(service.documents(DB, COL).len(), 2);
}

#[tokio::test]
async fn filtered_count_find_and_exists_agree_with_the_store() {
    // Given: five documents, three of them even
    let (_service, client) = client_with_page_size(2);
    let created = client
        .databases()
        .bulk_create_documents(DB, COL, tasks(5))
        .await;
    let databases = client.databases();

    // When: counting, finding and probing
    let evens = databases
        .count_documents(DB, COL, vec![Query::equal("parity", "even")])
        .await
        .unwrap();
    let found = databases
        .find_document(DB, COL, "parity", "odd")
        .await
        .unwrap();
    let missing = databases
        .find_document(DB, COL, "parity", "prime")
        .await
        .unwrap();
    let first_id = created.entries[0].outcome.clone();
    let ItemOutcome::Succeeded(first) = first_id else {
        panic!("first document was not created");
    };
    let exists = databases
        .document_exists(DB, COL, first["$id"].as_str().unwrap())
        .await
        .unwrap();
    let absent = databases
        .document_exists(DB, COL, "does-not-exist")
        .await
        .unwrap();

    // Then: every helper reflects the stored data
    assert_eq!(evens, 3);
    assert_eq!(found.unwrap()["n"], 1);
    assert!(missing.is_none());
    assert!(exists);
    assert!(!absent);
}

#[tokio::test]
async fn bulk_update_by_filter_touches_only_matches() {
    // Given: four documents
    let (service, client) = client_with_page_size(3);
    client
        .databases()
        .bulk_create_documents(DB, COL, tasks(4))
        .await;

    // When: flagging the odd ones
    let result = client
        .databases()
        .bulk_update_documents(
            DB,
            COL,
            vec![Query::equal("parity", "odd")],
            json!({ "flagged": true }),
        )
        .await
        .unwrap();

    // Then: two updates succeed and the store shows exactly those flagged
    assert_eq!(result.counts.succeeded, 2);
    let flagged: Vec<u64> = service
        .documents(DB, COL)
        .iter()
        .filter(|doc| doc["flagged"] == true)
        .map(|doc| doc["n"].as_u64().unwrap())
        .collect();
    assert_eq!(flagged, vec![1, 3]);
}

#[tokio::test]
async fn bulk_delete_by_filter_removes_matches_across_pages() {
    // Given: nine documents listed two per page
    let (service, client) = client_with_page_size(2);
    client
        .databases()
        .bulk_create_documents(DB, COL, tasks(9))
        .await;

    // When: deleting the even ones
    let result = client
        .databases()
        .bulk_delete_documents(DB, COL, vec![Query::equal("parity", "even")])
        .await
        .unwrap();

    // Then: five deletions succeed and only odd documents remain
    assert_eq!(result.counts.succeeded, 5);
    assert!(result.all_succeeded());
    let remaining = service.documents(DB, COL);
    assert_eq!(remaining.len(), 4);
    assert!(remaining.iter().all(|doc| doc["parity"] == "odd"));
}

#[tokio::test]
async fn single_document_calls_surface_not_found() {
    // Given: an empty collection
    let (_service, client) = client_with_page_size(5);
    let databases = client.databases();

    // When: reading, updating and deleting a missing document
    let read = databases.get_document(DB, COL, "ghost").await.unwrap_err();
    let update = databases
        .update_document(DB, COL, "ghost", json!({ "x": 1 }))
        .await
        .unwrap_err();
    let delete = databases
        .delete_document(DB, COL, "ghost")
        .await
        .unwrap_err();

    // Then: each fails as not-found without retrying into success
    assert_eq!(read.kind, ErrorKind::NotFound);
    assert_eq!(update.kind, ErrorKind::NotFound);
    assert_eq!(delete.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn single_document_round_trip_merges_updates() {
    // Given: one created document
    let (_service, client) = client_with_page_size(5);
    let databases = client.databases();
    let created = databases
        .create_document(DB, COL, json!({ "title": "draft", "done": false }))
        .await
        .unwrap();
    let id = created["$id"].as_str().unwrap().to_string();

    // When: updating one field
    databases
        .update_document(DB, COL, &id, json!({ "done": true }))
        .await
        .unwrap();
    let fetched = databases.get_document(DB, COL, &id).await.unwrap();

    // Then: the update merged into the existing fields
    assert_eq!(fetched["title"], "draft");
    assert_eq!(fetched["done"], true);
}

#[tokio::test]
async fn bulk_file_delete_reports_missing_files_individually() {
    // Given: three uploaded files
    let (service, client) = client_with_page_size(2);
    let uploads = vec![
        FileUpload::new("a.txt", b"alpha".to_vec()),
        FileUpload::new("b.csv", b"1,2".to_vec()),
        FileUpload::new("c.png", vec![0x89, 0x50]),
    ];
    let uploaded = client.storage().bulk_upload_files("media", uploads).await;
    assert!(uploaded.all_succeeded());
    let names: Vec<&str> = uploaded.entries.iter().map(|entry| entry.key.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.csv", "c.png"]);

    let listed: Vec<Value> = client
        .storage()
        .list_files("media", Vec::new())
        .collect_all()
        .await
        .unwrap();
    assert_eq!(listed.len(), 3);
    let first_id = listed[0]["$id"].as_str().unwrap().to_string();

    // When: deleting one real file and one that never existed
    let deleted = client
        .storage()
        .bulk_delete_files("media", vec![first_id.clone(), "missing".to_string()])
        .await;

    // Then: the real file is gone and the missing one fails as not-found
    assert_eq!(deleted.counts.succeeded, 1);
    assert_eq!(deleted.counts.failed, 1);
    assert_eq!(deleted.entries[0].key, first_id);
    let error = deleted.entries[1].outcome.error().unwrap();
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert_eq!(service.files("media").len(), 2);
}

#[tokio::test]
async fn file_metadata_reflects_the_upload() {
    // Given: one uploaded file
    let (_service, client) = client_with_page_size(5);
    let file = FileUpload::new("notes.txt", b"hello".to_vec());
    let stored = client.storage().upload_file("docs", &file).await.unwrap();

    // When: reading its metadata back
    let fetched = client
        .storage()
        .get_file("docs", stored["$id"].as_str().unwrap())
        .await
        .unwrap();

    // Then: name, type and size match what was sent
    assert_eq!(fetched["name"], "notes.txt");
    assert_eq!(fetched["mimeType"], "text/plain");
    assert_eq!(fetched["sizeOriginal"], 5);
}

#[tokio::test]
async fn duplicate_email_is_a_per_item_conflict() {
    // Given: an existing account
    let (service, client) = client_with_page_size(2);
    client
        .users()
        .create_user(&NewUser::new("ada@example.test", "pw-1"))
        .await
        .unwrap();

    // When: bulk creating that email again alongside a new one
    let result = client
        .users()
        .bulk_create_users(vec![
            NewUser::new("ada@example.test", "pw-2"),
            NewUser::new("alan@example.test", "pw-3").with_name("Alan"),
        ])
        .await;

    // Then: only the duplicate conflicts
    assert_eq!(result.entries[0].key, "ada@example.test");
    assert_eq!(
        result.entries[0].outcome.error().unwrap().kind,
        ErrorKind::Conflict
    );
    assert!(result.entries[1].outcome.is_success());
    assert_eq!(service.users().len(), 2);
}

#[tokio::test]
async fn users_are_found_by_email_listed_and_bulk_deleted() {
    // Given: three accounts
    let (service, client) = client_with_page_size(2);
    let emails = ["a@example.test", "b@example.test", "c@example.test"];
    client
        .users()
        .bulk_create_users(emails.iter().map(|email| NewUser::new(*email, "pw")).collect())
        .await;

    // When: looking one up, listing them all and deleting the listed ids
    let found = client
        .users()
        .find_user_by_email("b@example.test")
        .await
        .unwrap();
    let unknown = client
        .users()
        .find_user_by_email("z@example.test")
        .await
        .unwrap();
    let listed = client.users().list_users(Vec::new()).collect_all().await.unwrap();
    let ids: Vec<String> = listed
        .iter()
        .map(|user| user["$id"].as_str().unwrap().to_string())
        .collect();
    let deleted = client.users().bulk_delete_users(ids).await;

    // Then: lookups match and every listed account is removed
    assert_eq!(found.unwrap()["email"], "b@example.test");
    assert!(unknown.is_none());
    assert_eq!(listed.len(), 3);
    assert_eq!(deleted.counts.succeeded, 3);
    assert!(service.users().is_empty());
}

#[tokio::test]
async fn health_check_reaches_the_service() {
    // Given: a client on a live service
    let (_service, client) = client_with_page_size(5);

    // When: probing it
    let health = client.health_check().await.unwrap();

    // Then: the service reports healthy and the connection test passes
    assert_eq!(health["status"], "pass");
    assert!(client.test_connection().await);
}

#[tokio::test]
async fn caller_limit_caps_the_whole_listing() {
    // Given: five documents listed two per page
    let (service, client) = client_with_page_size(2);
    client
        .databases()
        .bulk_create_documents(DB, COL, tasks(5))
        .await;
    let requests_before_listing = service.request_count();

    // When: asking for at most three
    let listed = client
        .databases()
        .get_all_documents(DB, COL, vec![Query::limit(3)])
        .await
        .unwrap();

    // Then: the first three come back and no third page is fetched
    let numbers: Vec<u64> = listed.iter().map(|doc| doc["n"].as_u64().unwrap()).collect();
    assert_eq!(numbers, vec![0, 1, 2]);
    assert_eq!(service.request_count() - requests_before_listing, 2);
}

#[tokio::test]
async fn caller_offset_skips_only_before_the_first_page() {
    // Given: five documents listed two per page
    let (_service, client) = client_with_page_size(2);
    client
        .databases()
        .bulk_create_documents(DB, COL, tasks(5))
        .await;

    // When: ordering by `n` and skipping the first one
    let listed = client
        .databases()
        .get_all_documents(DB, COL, vec![Query::order_asc("n"), Query::offset(1)])
        .await
        .unwrap();

    // Then: every document after the first is listed, none dropped between pages
    let numbers: Vec<u64> = listed.iter().map(|doc| doc["n"].as_u64().unwrap()).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn caller_cursor_is_rejected_before_any_request() {
    // Given: a populated collection
    let (service, client) = client_with_page_size(2);
    client
        .databases()
        .bulk_create_documents(DB, COL, tasks(3))
        .await;
    let requests_before_listing = service.request_count();

    // When: listing from a caller-chosen cursor
    let error = client
        .databases()
        .get_all_documents(DB, COL, vec![Query::cursor_after("anything")])
        .await
        .unwrap_err();

    // Then: it fails as invalid input without reaching the service
    assert_eq!(error.kind, ErrorKind::InvalidInput);
    assert_eq!(service.request_count(), requests_before_listing);
}

#[tokio::test]
async fn bulk_delete_with_offset_and_limit_removes_exactly_that_window() {
    // Given: six documents, three of them even, listed two per page
    let (service, client) = client_with_page_size(2);
    client
        .databases()
        .bulk_create_documents(DB, COL, tasks(6))
        .await;

    // When: deleting the second and third even documents
    let result = client
        .databases()
        .bulk_delete_documents(
            DB,
            COL,
            vec![
                Query::equal("parity", "even"),
                Query::order_asc("n"),
                Query::offset(1),
                Query::limit(2),
            ],
        )
        .await
        .unwrap();

    // Then: documents 2 and 4 are gone and everything else remains
    assert_eq!(result.counts.succeeded, 2);
    let remaining: Vec<u64> = service
        .documents(DB, COL)
        .iter()
        .map(|doc| doc["n"].as_u64().unwrap())
        .collect();
    assert_eq!(remaining, vec![0, 1, 3, 5]);
}

#[tokio::test]
async fn offset_pages_report_totals_and_whether_more_remain() {
    // Given: five even and five odd documents
    let (service, client) = client_with_page_size(100);
    assert!(client
        .databases()
        .bulk_create_documents(DB, COL, tasks(10))
        .await
        .all_succeeded());
    let requests_before = service.request_count();
    let even = || vec![Query::equal("parity", "even"), Query::order_asc("n")];

    // When: reading the even documents two at a time by offset
    let first = client
        .databases()
        .get_documents_paginated(DB, COL, even(), 2, 0)
        .await
        .unwrap();
    let last = client
        .databases()
        .get_documents_paginated(DB, COL, even(), 2, 4)
        .await
        .unwrap();

    // Then: each window is one request and `has_more` tracks the total
    let numbers = |page: &batchwise::OffsetPage| -> Vec<u64> {
        page.documents.iter().map(|doc| doc["n"].as_u64().unwrap()).collect()
    };
    assert_eq!(numbers(&first), vec![0, 2]);
    assert_eq!((first.total, first.offset, first.limit, first.has_more), (5, 0, 2, true));
    assert_eq!(numbers(&last), vec![8]);
    assert!(!last.has_more);
    assert_eq!(service.request_count() - requests_before, 2);
}

#[tokio::test]
async fn users_are_found_by_phone_and_profiles_updated() {
    // Given: a user with a phone number
    let (service, client) = client_with_page_size(10);
    let created = client
        .users()
        .create_user(&NewUser::new("ada@example.test", "pw").with_phone("+15550100"))
        .await
        .unwrap();
    let id = created["$id"].as_str().unwrap().to_string();

    // When: finding them by phone and changing their name
    let found = client.users().find_user_by_phone("+15550100").await.unwrap();
    let missing = client.users().find_user_by_phone("+15550199").await.unwrap();
    let updated = client
        .users()
        .update_user_profile(&id, &ProfileUpdate::new().name("Ada L."))
        .await
        .unwrap();

    // Then: the lookup matches and the new name is stored
    assert_eq!(found.unwrap()["$id"], id.as_str());
    assert!(missing.is_none());
    assert_eq!(updated["name"], "Ada L.");
    assert_eq!(service.users()[0]["name"], "Ada L.");
}

#[tokio::test]
async fn empty_profile_update_is_rejected_without_a_request() {
    // Given: a client with no prior traffic
    let (service, client) = client_with_page_size(10);

    // When: sending an update that sets nothing
    let error = client
        .users()
        .update_user_profile("u1", &ProfileUpdate::new())
        .await
        .unwrap_err();

    // Then: it fails as invalid input before reaching the service
    assert_eq!(error.kind, ErrorKind::InvalidInput);
    assert_eq!(service.request_count(), 0);
}

#[tokio::test]
async fn user_status_and_sessions_round_trip() {
    // Given: a user with two open sessions
    let (service, client) = client_with_page_size(10);
    let created = client
        .users()
        .create_user(&NewUser::new("ada@example.test", "pw"))
        .await
        .unwrap();
    let id = created["$id"].as_str().unwrap().to_string();
    assert!(service.open_session(&id).is_some());
    assert!(service.open_session(&id).is_some());

    // When: blocking the user and ending their sessions
    let blocked = client.users().update_user_status(&id, false).await.unwrap();
    let before = client.users().get_user_sessions(&id).await.unwrap();
    client.users().delete_user_sessions(&id).await.unwrap();
    let after = client.users().get_user_sessions(&id).await.unwrap();

    // Then: the status flips and every session is gone
    assert_eq!(blocked["status"], false);
    assert_eq!(before.len(), 2);
    assert!(after.is_empty());
}

#[tokio::test]
async fn sessions_of_an_unknown_user_are_not_found() {
    // Given: an empty service
    let (_service, client) = client_with_page_size(10);

    // When: listing and deleting sessions for a user that does not exist
    let listed = client.users().get_user_sessions("ghost").await.unwrap_err();
    let deleted = client.users().delete_user_sessions("ghost").await.unwrap_err();

    // Then: both fail as not found after one attempt each
    assert_eq!(listed.kind, ErrorKind::NotFound);
    assert_eq!(deleted.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn uploaded_bytes_download_intact() {
    // Given: an uploaded text file
    let (_service, client) = client_with_page_size(10);
    let uploaded = client
        .storage()
        .upload_file("docs", &FileUpload::new("notes.txt", b"remember the milk".to_vec()))
        .await
        .unwrap();
    let id = uploaded["$id"].as_str().unwrap().to_string();

    // When: downloading it and asking for its view URL
    let bytes = client.storage().download_file("docs", &id).await.unwrap();
    let url = client.storage().get_file_url("docs", &id);

    // Then: the bytes match and the URL points at the file in this project
    assert_eq!(bytes, b"remember the milk".to_vec());
    assert_eq!(
        url,
        format!("https://memory.test/v1/storage/buckets/docs/files/{id}/view?project=project")
    );
}

#[tokio::test]
async fn downloading_a_missing_file_is_not_found() {
    // Given: an empty bucket
    let (_service, client) = client_with_page_size(10);

    // When: downloading a file that was never uploaded
    let error = client.storage().download_file("docs", "nope").await.unwrap_err();

    // Then: the failure is classified as not found
    assert_eq!(error.kind, ErrorKind::NotFound);
}
