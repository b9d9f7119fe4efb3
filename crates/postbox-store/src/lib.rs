//! Postbox persistence layer storing users, posts and files in an object store.
//!
//! There is no database engine underneath: every record is a JSON document
//! written to its own object under a per-collection prefix (`users/`, `posts/`,
//! `files/`), and uploaded file contents live under `blobs/`. Lookups by id
//! read a single key; everything else (find by email, listings, pagination)
//! lists the prefix and scans the decoded documents.

pub mod s3;
pub mod storage;

use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub use s3::{S3Config, S3Store};
pub use storage::{MemoryStore, ObjectData, ObjectStore, StorageError, StorageResult};

const USERS_PREFIX: &str = "users/";
const POSTS_PREFIX: &str = "posts/";
const FILES_PREFIX: &str = "files/";
const BLOBS_PREFIX: &str = "blobs/";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Number of documents fetched concurrently while scanning a prefix.
const SCAN_CONCURRENCY: usize = 16;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Primary entry point to the persistence layer.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn ObjectStore>,
    // Serializes the scan-then-write uniqueness check on user documents.
    user_writes: Arc<Mutex<()>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            user_writes: Arc::new(Mutex::new(())),
        }
    }

    /// Database backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store
            .health_check()
            .await
            .context("object store health check failed")
    }

    /// Registers a user. Email and username must be unique (case-insensitive).
    pub async fn insert_user(&self, data: NewUser<'_>) -> Result<UserRecord> {
        let _guard = self.user_writes.lock().await;
        let existing: Vec<UserRecord> = self.load_all(USERS_PREFIX).await?;
        ensure_unique_user(&existing, None, data.email, data.username)?;

        let now = Utc::now();
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: data.username.to_owned(),
            email: data.email.to_owned(),
            password_hash: data.password_hash.to_owned(),
            created_at: now,
            updated_at: now,
        };
        self.put_json(&user_key(record.id), &record).await?;
        Ok(record)
    }

    pub async fn fetch_user(&self, id: Uuid) -> Result<Option<UserRecord>> {
        self.get_json(&user_key(id)).await
    }

    /// Scans every user document for a matching email.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let users: Vec<UserRecord> = self.load_all(USERS_PREFIX).await?;
        Ok(users
            .into_iter()
            .find(|user| user.email.eq_ignore_ascii_case(email)))
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let users: Vec<UserRecord> = self.load_all(USERS_PREFIX).await?;
        Ok(users
            .into_iter()
            .find(|user| user.username.eq_ignore_ascii_case(username)))
    }

    /// Lists users ordered by registration time, newest first.
    pub async fn list_users(&self, page: PageRequest) -> Result<Page<UserRecord>> {
        let users = self.load_all(USERS_PREFIX).await?;
        Ok(paginate(users, page))
    }

    /// Applies the given changes. Returns `None` if the user does not exist.
    pub async fn update_user(&self, id: Uuid, changes: UserChanges) -> Result<Option<UserRecord>> {
        let _guard = self.user_writes.lock().await;
        let Some(mut record) = self.fetch_user(id).await? else {
            return Ok(None);
        };

        if changes.email.is_some() || changes.username.is_some() {
            let existing: Vec<UserRecord> = self.load_all(USERS_PREFIX).await?;
            ensure_unique_user(
                &existing,
                Some(id),
                changes.email.as_deref().unwrap_or(""),
                changes.username.as_deref().unwrap_or(""),
            )?;
        }

        if let Some(username) = changes.username {
            record.username = username;
        }
        if let Some(email) = changes.email {
            record.email = email;
        }
        if let Some(password_hash) = changes.password_hash {
            record.password_hash = password_hash;
        }
        record.updated_at = Utc::now();

        self.put_json(&user_key(id), &record).await?;
        Ok(Some(record))
    }

    pub async fn delete_user(&self, id: Uuid) -> Result<bool> {
        let _guard = self.user_writes.lock().await;
        self.store
            .delete(&user_key(id))
            .await
            .with_context(|| format!("deleting user {id}"))
    }

    pub async fn insert_post(&self, data: NewPost<'_>) -> Result<PostRecord> {
        let now = Utc::now();
        let record = PostRecord {
            id: Uuid::new_v4(),
            author_id: data.author_id,
            title: data.title.to_owned(),
            content: data.content.to_owned(),
            created_at: now,
            updated_at: now,
        };
        self.put_json(&post_key(record.id), &record).await?;
        Ok(record)
    }

    pub async fn fetch_post(&self, id: Uuid) -> Result<Option<PostRecord>> {
        self.get_json(&post_key(id)).await
    }

    /// Lists posts ordered by creation time descending, optionally for one author.
    pub async fn list_posts(&self, filter: PostFilter, page: PageRequest) -> Result<Page<PostRecord>> {
        let mut posts: Vec<PostRecord> = self.load_all(POSTS_PREFIX).await?;
        if let Some(author_id) = filter.author_id {
            posts.retain(|post| post.author_id == author_id);
        }
        Ok(paginate(posts, page))
    }

    pub async fn update_post(&self, id: Uuid, changes: PostChanges) -> Result<Option<PostRecord>> {
        let Some(mut record) = self.fetch_post(id).await? else {
            return Ok(None);
        };

        if let Some(title) = changes.title {
            record.title = title;
        }
        if let Some(content) = changes.content {
            record.content = content;
        }
        record.updated_at = Utc::now();

        self.put_json(&post_key(id), &record).await?;
        Ok(Some(record))
    }

    pub async fn delete_post(&self, id: Uuid) -> Result<bool> {
        self.store
            .delete(&post_key(id))
            .await
            .with_context(|| format!("deleting post {id}"))
    }

    /// Removes every post written by `author_id`, returning how many were deleted.
    pub async fn delete_posts_by_author(&self, author_id: Uuid) -> Result<usize> {
        let posts: Vec<PostRecord> = self.load_all(POSTS_PREFIX).await?;
        let mut removed = 0;
        for post in posts.into_iter().filter(|post| post.author_id == author_id) {
            if self.delete_post(post.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stores the file contents first, then its metadata document.
    pub async fn insert_file(&self, data: NewFile<'_>, bytes: Bytes) -> Result<FileRecord> {
        let id = Uuid::new_v4();
        let object_key = blob_key(id);
        let size_bytes = bytes.len() as u64;

        self.store
            .put(&object_key, bytes, Some(data.content_type))
            .await
            .with_context(|| format!("writing file contents for {id}"))?;

        let record = FileRecord {
            id,
            owner_id: data.owner_id,
            filename: data.filename.to_owned(),
            content_type: data.content_type.to_owned(),
            size_bytes,
            sha256: data.sha256.to_owned(),
            object_key,
            created_at: Utc::now(),
        };

        if let Err(err) = self.put_json(&file_key(id), &record).await {
            if let Err(cleanup) = self.store.delete(&record.object_key).await {
                warn!(file_id = %id, error = %cleanup, "failed to remove orphaned file contents");
            }
            return Err(err);
        }
        Ok(record)
    }

    pub async fn fetch_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        self.get_json(&file_key(id)).await
    }

    pub async fn read_file_content(&self, record: &FileRecord) -> Result<Option<ObjectData>> {
        self.store
            .get(&record.object_key)
            .await
            .with_context(|| format!("reading contents of file {}", record.id))
    }

    /// Lists the files uploaded by `owner_id`, newest first.
    pub async fn list_files(&self, owner_id: Uuid, page: PageRequest) -> Result<Page<FileRecord>> {
        let mut files: Vec<FileRecord> = self.load_all(FILES_PREFIX).await?;
        files.retain(|file| file.owner_id == owner_id);
        Ok(paginate(files, page))
    }

    /// Removes both the metadata document and the stored contents.
    pub async fn delete_file(&self, id: Uuid) -> Result<bool> {
        let Some(record) = self.fetch_file(id).await? else {
            return Ok(false);
        };

        if !self
            .store
            .delete(&record.object_key)
            .await
            .with_context(|| format!("deleting contents of file {id}"))?
        {
            warn!(file_id = %id, key = %record.object_key, "file contents already missing");
        }

        self.store
            .delete(&file_key(id))
            .await
            .with_context(|| format!("deleting file {id}"))
    }

    pub async fn delete_files_by_owner(&self, owner_id: Uuid) -> Result<usize> {
        let files: Vec<FileRecord> = self.load_all(FILES_PREFIX).await?;
        let mut removed = 0;
        for file in files.into_iter().filter(|file| file.owner_id == owner_id) {
            if self.delete_file(file.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value).with_context(|| format!("encoding {key}"))?;
        self.store
            .put(key, Bytes::from(encoded), Some(JSON_CONTENT_TYPE))
            .await
            .with_context(|| format!("writing {key}"))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(object) = self
            .store
            .get(key)
            .await
            .with_context(|| format!("reading {key}"))?
        else {
            return Ok(None);
        };

        let value = serde_json::from_slice(&object.bytes)
            .with_context(|| format!("failed to decode JSON document {key}"))?;
        Ok(Some(value))
    }

    /// Decodes every JSON document under `prefix`. Documents deleted between
    /// listing and reading are skipped.
    async fn load_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let keys = self
            .store
            .list(prefix)
            .await
            .with_context(|| format!("listing {prefix}"))?;

        let documents: Vec<Option<T>> = futures::stream::iter(
            keys.into_iter().filter(|key| key.ends_with(".json")),
        )
        .map(|key| async move { self.get_json::<T>(&key).await })
        .buffered(SCAN_CONCURRENCY)
        .try_collect()
        .await?;

        Ok(documents.into_iter().flatten().collect())
    }
}

fn user_key(id: Uuid) -> String {
    format!("{USERS_PREFIX}{id}.json")
}

fn post_key(id: Uuid) -> String {
    format!("{POSTS_PREFIX}{id}.json")
}

fn file_key(id: Uuid) -> String {
    format!("{FILES_PREFIX}{id}.json")
}

fn blob_key(id: Uuid) -> String {
    format!("{BLOBS_PREFIX}{id}")
}

/// Empty `email`/`username` arguments are not checked.
fn ensure_unique_user(
    existing: &[UserRecord],
    exclude: Option<Uuid>,
    email: &str,
    username: &str,
) -> Result<()> {
    for user in existing.iter().filter(|user| Some(user.id) != exclude) {
        if !email.is_empty() && user.email.eq_ignore_ascii_case(email) {
            return Err(RecordError::DuplicateEmail(email.to_owned()).into());
        }
        if !username.is_empty() && user.username.eq_ignore_ascii_case(username) {
            return Err(RecordError::DuplicateUsername(username.to_owned()).into());
        }
    }
    Ok(())
}

fn paginate<T: Chronological>(mut items: Vec<T>, page: PageRequest) -> Page<T> {
    items.sort_by(|a, b| {
        b.created_at()
            .cmp(&a.created_at())
            .then_with(|| b.id().cmp(&a.id()))
    });

    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect();

    Page {
        items,
        total,
        offset: page.offset,
        limit: page.limit,
    }
}

/// Errors returned by the record layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("email '{0}' is already registered")]
    DuplicateEmail(String),
    #[error("username '{0}' is already taken")]
    DuplicateUsername(String),
}

/// Offset/limit window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: u32,
    pub limit: u32,
}

impl PageRequest {
    /// Applies defaults and clamps `limit` to `1..=MAX_PAGE_LIMIT`.
    pub fn new(offset: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            offset: offset.unwrap_or(0),
            limit: limit
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

impl<T> Page<T> {
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

trait Chronological {
    fn created_at(&self) -> DateTime<Utc>;
    fn id(&self) -> Uuid;
}

/// Input payload for user registration.
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
}

/// Partial update of a user document; `None` fields stay untouched.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
}

/// Persisted user document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chronological for UserRecord {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct NewPost<'a> {
    pub author_id: Uuid,
    pub title: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct PostChanges {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostFilter {
    pub author_id: Option<Uuid>,
}

/// Persisted post document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostRecord {
    pub id: Uuid,
    pub author_id: Uuid,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chronological for PostRecord {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub owner_id: Uuid,
    pub filename: &'a str,
    pub content_type: &'a str,
    pub sha256: &'a str,
}

/// Metadata document describing an uploaded file. The contents live at `object_key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
}

impl Chronological for FileRecord {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> (Database, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Database::new(store.clone()), store)
    }

    fn new_user<'a>(username: &'a str, email: &'a str) -> NewUser<'a> {
        NewUser {
            username,
            email,
            password_hash: "$2b$04$hash",
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_user_roundtrip() {
        let (db, store) = setup_db();
        let record = db
            .insert_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();

        let fetched = db.fetch_user(record.id).await.unwrap().unwrap();
        assert_eq!(fetched, record);

        let keys = store.list("users/").await.unwrap();
        assert_eq!(keys, vec![format!("users/{}.json", record.id)]);
    }

    #[tokio::test]
    async fn duplicate_email_and_username_are_rejected() {
        let (db, _) = setup_db();
        db.insert_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();

        let err = db
            .insert_user(new_user("alice2", "ALICE@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast::<RecordError>().unwrap(),
            RecordError::DuplicateEmail(_)
        ));

        let err = db
            .insert_user(new_user("Alice", "other@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast::<RecordError>().unwrap(),
            RecordError::DuplicateUsername(_)
        ));
    }

    #[tokio::test]
    async fn find_user_by_email_scans_case_insensitively() {
        let (db, _) = setup_db();
        db.insert_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();
        let bob = db
            .insert_user(new_user("bob", "bob@example.com"))
            .await
            .unwrap();

        let found = db.find_user_by_email("Bob@Example.com").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(bob.id));
        assert!(db
            .find_user_by_email("carol@example.com")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            db.find_user_by_username("BOB").await.unwrap().map(|u| u.id),
            Some(bob.id)
        );
    }

    #[tokio::test]
    async fn update_user_checks_uniqueness_against_others_only() {
        let (db, _) = setup_db();
        let alice = db
            .insert_user(new_user("alice", "alice@example.com"))
            .await
            .unwrap();
        db.insert_user(new_user("bob", "bob@example.com"))
            .await
            .unwrap();

        // Re-submitting one's own email is not a conflict.
        let updated = db
            .update_user(
                alice.id,
                UserChanges {
                    email: Some("alice@example.com".into()),
                    username: Some("alice_w".into()),
                    ..UserChanges::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.username, "alice_w");
        assert!(updated.updated_at >= alice.updated_at);

        let err = db
            .update_user(
                alice.id,
                UserChanges {
                    email: Some("bob@example.com".into()),
                    ..UserChanges::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast::<RecordError>().unwrap(),
            RecordError::DuplicateEmail("bob@example.com".into())
        );

        assert!(db
            .update_user(Uuid::new_v4(), UserChanges::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_posts_paginates_newest_first_with_author_filter() {
        let (db, _) = setup_db();
        let author = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut ids = Vec::new();
        for i in 0..5 {
            let title = format!("post {i}");
            let post = db
                .insert_post(NewPost {
                    author_id: author,
                    title: &title,
                    content: "body",
                })
                .await
                .unwrap();
            ids.push(post.id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        db.insert_post(NewPost {
            author_id: other,
            title: "elsewhere",
            content: "body",
        })
        .await
        .unwrap();

        let page = db
            .list_posts(
                PostFilter {
                    author_id: Some(author),
                },
                PageRequest::new(Some(1), Some(2)),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.offset, 1);
        assert_eq!(page.limit, 2);
        assert_eq!(
            page.items.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![ids[3], ids[2]]
        );

        let everything = db
            .list_posts(PostFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(everything.total, 6);
        assert_eq!(everything.items[0].title, "elsewhere");

        let past_end = db
            .list_posts(PostFilter::default(), PageRequest::new(Some(50), None))
            .await
            .unwrap();
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 6);
    }

    #[tokio::test]
    async fn update_and_delete_post() {
        let (db, _) = setup_db();
        let post = db
            .insert_post(NewPost {
                author_id: Uuid::new_v4(),
                title: "draft",
                content: "first version",
            })
            .await
            .unwrap();

        let updated = db
            .update_post(
                post.id,
                PostChanges {
                    title: Some("final".into()),
                    content: None,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "final");
        assert_eq!(updated.content, "first version");

        assert!(db.delete_post(post.id).await.unwrap());
        assert!(!db.delete_post(post.id).await.unwrap());
        assert!(db.fetch_post(post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn files_store_metadata_and_contents_separately() {
        let (db, store) = setup_db();
        let owner = Uuid::new_v4();
        let record = db
            .insert_file(
                NewFile {
                    owner_id: owner,
                    filename: "notes.txt",
                    content_type: "text/plain",
                    sha256: "abc",
                },
                Bytes::from_static(b"hello world"),
            )
            .await
            .unwrap();

        assert_eq!(record.size_bytes, 11);
        assert_eq!(record.object_key, format!("blobs/{}", record.id));

        let content = db.read_file_content(&record).await.unwrap().unwrap();
        assert_eq!(content.bytes, Bytes::from_static(b"hello world"));
        assert_eq!(content.content_type.as_deref(), Some("text/plain"));

        let listed = db
            .list_files(owner, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(listed.total, 1);
        assert!(db
            .list_files(Uuid::new_v4(), PageRequest::default())
            .await
            .unwrap()
            .items
            .is_empty());

        assert!(db.delete_file(record.id).await.unwrap());
        assert!(!db.delete_file(record.id).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cascading_deletes_remove_only_owned_records() {
        let (db, _) = setup_db();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        for author_id in [owner, owner, other] {
            db.insert_post(NewPost {
                author_id,
                title: "t",
                content: "c",
            })
            .await
            .unwrap();
        }
        db.insert_file(
            NewFile {
                owner_id: owner,
                filename: "a.bin",
                content_type: "application/octet-stream",
                sha256: "00",
            },
            Bytes::from_static(b"\x00\x01"),
        )
        .await
        .unwrap();

        assert_eq!(db.delete_posts_by_author(owner).await.unwrap(), 2);
        assert_eq!(db.delete_files_by_owner(owner).await.unwrap(), 1);

        let remaining = db
            .list_posts(PostFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(remaining.total, 1);
        assert_eq!(remaining.items[0].author_id, other);
    }

    #[tokio::test]
    async fn corrupted_documents_surface_as_errors() {
        let (db, store) = setup_db();
        let id = Uuid::new_v4();
        store
            .put(
                &format!("posts/{id}.json"),
                Bytes::from_static(b"not json"),
                None,
            )
            .await
            .unwrap();

        let err = db.fetch_post(id).await.unwrap_err();
        assert!(err.to_string().contains("failed to decode JSON document"));
    }

    #[test]
    fn page_request_clamps_limits() {
        assert_eq!(PageRequest::new(None, None).limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(PageRequest::new(None, Some(0)).limit, 1);
        assert_eq!(PageRequest::new(Some(7), Some(10_000)).limit, MAX_PAGE_LIMIT);
        assert_eq!(PageRequest::new(Some(7), None).offset, 7);
    }
}
