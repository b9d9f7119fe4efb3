//! Service layer sitting between the HTTP handlers and the object-store backed
//! [`Database`].
//!
//! Handlers hand over already authenticated actor ids; this crate validates
//! and normalizes input, enforces ownership of posts, files and accounts,
//! cascades account deletion and writes the audit trail.

mod audit;
pub mod validation;

use std::{fmt, sync::Arc};

use bytes::Bytes;
use postbox_store::{
    Database, FileRecord, NewFile, NewPost, NewUser, ObjectData, Page, PageRequest, PostChanges,
    PostFilter, PostRecord, RecordError, UserChanges, UserRecord,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use audit::{AuditEvent, AuditEventKind, AuditLogWriter};

pub use audit::AuditConfig;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_upload_bytes: u64,
    pub audit: AuditConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            audit: AuditConfig::default(),
        }
    }
}

/// High-level API used by the daemon's handlers.
#[derive(Clone)]
pub struct PostboxService {
    db: Database,
    config: ServiceConfig,
    audit: Option<Arc<AuditLogWriter>>,
}

impl PostboxService {
    pub fn new(db: Database, config: ServiceConfig) -> Self {
        let audit = if config.audit.enabled {
            match AuditLogWriter::try_new(&config.audit) {
                Ok(writer) => Some(Arc::new(writer)),
                Err(err) => {
                    warn!(error = %err, "failed to initialize audit log writer; disabling audits");
                    None
                }
            }
        } else {
            None
        };

        Self { db, config, audit }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Re-reads the owner after a write. `false` means the account was
    /// deleted while the write was in flight.
    async fn ensure_owner_exists(&self, owner: Uuid) -> Result<bool, ServiceError> {
        let exists = self.db.fetch_user(owner).await?.is_some();
        if !exists {
            warn!(owner_id = %owner, "owner deleted during write; rolling back");
        }
        Ok(exists)
    }

    async fn record_audit(&self, event: AuditEvent) {
        if let Some(writer) = self.audit.clone() {
            if let Err(err) = writer.append(&event).await {
                warn!(
                    subject_id = %event.subject_id,
                    error = %err,
                    "failed to append audit log entry"
                );
            }
        }
    }

    /// Creates an account. The password must already be hashed by the caller.
    #[instrument(skip(self, request), fields(username = %request.username))]
    pub async fn register_user(&self, request: RegisterUser) -> Result<UserRecord, ServiceError> {
        let username = validation::normalize_username(&request.username)?;
        let email = validation::normalize_email(&request.email)?;

        let record = self
            .db
            .insert_user(NewUser {
                username: &username,
                email: &email,
                password_hash: &request.password_hash,
            })
            .await?;

        info!(user_id = %record.id, "user registered");
        self.record_audit(AuditEvent::new(
            record.id,
            record.id,
            AuditEventKind::UserRegistered {
                username: record.username.clone(),
            },
        ))
        .await;
        Ok(record)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<UserRecord, ServiceError> {
        self.db
            .fetch_user(id)
            .await?
            .ok_or(ServiceError::NotFound(RecordKind::User, id))
    }

    /// Looks an account up by email. Malformed addresses simply match nothing.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, ServiceError> {
        let Ok(email) = validation::normalize_email(email) else {
            return Ok(None);
        };
        Ok(self.db.find_user_by_email(&email).await?)
    }

    pub async fn list_users(&self, page: PageRequest) -> Result<Page<UserRecord>, ServiceError> {
        Ok(self.db.list_users(page).await?)
    }

    /// Updates an account. Only the account owner may do so.
    #[instrument(skip(self, request))]
    pub async fn update_user(
        &self,
        actor: Uuid,
        id: Uuid,
        request: UpdateUser,
    ) -> Result<UserRecord, ServiceError> {
        if actor != id {
            return Err(ServiceError::Forbidden(
                "users can only modify their own account".into(),
            ));
        }
        if request.is_empty() {
            return Err(ServiceError::Validation("no changes supplied".into()));
        }

        let mut fields = Vec::new();
        let mut changes = UserChanges::default();
        if let Some(username) = request.username.as_deref() {
            changes.username = Some(validation::normalize_username(username)?);
            fields.push("username");
        }
        if let Some(email) = request.email.as_deref() {
            changes.email = Some(validation::normalize_email(email)?);
            fields.push("email");
        }
        if let Some(password_hash) = request.password_hash {
            changes.password_hash = Some(password_hash);
            fields.push("password");
        }

        let record = self
            .db
            .update_user(id, changes)
            .await?
            .ok_or(ServiceError::NotFound(RecordKind::User, id))?;

        info!(user_id = %id, ?fields, "user updated");
        self.record_audit(AuditEvent::new(
            actor,
            id,
            AuditEventKind::UserUpdated { fields },
        ))
        .await;
        Ok(record)
    }

    /// Deletes an account together with every post and file it owns.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, actor: Uuid, id: Uuid) -> Result<DeletedUser, ServiceError> {
        if actor != id {
            return Err(ServiceError::Forbidden(
                "users can only delete their own account".into(),
            ));
        }
        // The account goes first so tokens stop resolving before the cascade
        // scans; writes racing with it are undone in `ensure_owner_exists`.
        if !self.db.delete_user(id).await? {
            return Err(ServiceError::NotFound(RecordKind::User, id));
        }
        let posts_removed = self.db.delete_posts_by_author(id).await?;
        let files_removed = self.db.delete_files_by_owner(id).await?;

        info!(user_id = %id, posts_removed, files_removed, "user deleted");
        self.record_audit(AuditEvent::new(
            actor,
            id,
            AuditEventKind::UserDeleted {
                posts_removed,
                files_removed,
            },
        ))
        .await;
        Ok(DeletedUser {
            posts_removed,
            files_removed,
        })
    }

    #[instrument(skip(self, request))]
    pub async fn create_post(
        &self,
        actor: Uuid,
        request: CreatePost,
    ) -> Result<PostRecord, ServiceError> {
        let title = validation::normalize_title(&request.title)?;
        validation::validate_content(&request.content)?;

        let record = self
            .db
            .insert_post(NewPost {
                author_id: actor,
                title: &title,
                content: &request.content,
            })
            .await?;
        if !self.ensure_owner_exists(actor).await? {
            self.db.delete_post(record.id).await?;
            return Err(ServiceError::NotFound(RecordKind::User, actor));
        }

        info!(post_id = %record.id, author_id = %actor, "post created");
        self.record_audit(AuditEvent::new(
            actor,
            record.id,
            AuditEventKind::PostCreated {
                title: record.title.clone(),
            },
        ))
        .await;
        Ok(record)
    }

    pub async fn get_post(&self, id: Uuid) -> Result<PostRecord, ServiceError> {
        self.db
            .fetch_post(id)
            .await?
            .ok_or(ServiceError::NotFound(RecordKind::Post, id))
    }

    pub async fn list_posts(
        &self,
        author_id: Option<Uuid>,
        page: PageRequest,
    ) -> Result<Page<PostRecord>, ServiceError> {
        Ok(self.db.list_posts(PostFilter { author_id }, page).await?)
    }

    #[instrument(skip(self, request))]
    pub async fn update_post(
        &self,
        actor: Uuid,
        id: Uuid,
        request: UpdatePost,
    ) -> Result<PostRecord, ServiceError> {
        if request.title.is_none() && request.content.is_none() {
            return Err(ServiceError::Validation("no changes supplied".into()));
        }

        let existing = self.get_post(id).await?;
        if existing.author_id != actor {
            return Err(ServiceError::Forbidden(
                "only the author can modify this post".into(),
            ));
        }

        let mut fields = Vec::new();
        let mut changes = PostChanges::default();
        if let Some(title) = request.title.as_deref() {
            changes.title = Some(validation::normalize_title(title)?);
            fields.push("title");
        }
        if let Some(content) = request.content {
            validation::validate_content(&content)?;
            changes.content = Some(content);
            fields.push("content");
        }

        let record = self
            .db
            .update_post(id, changes)
            .await?
            .ok_or(ServiceError::NotFound(RecordKind::Post, id))?;

        self.record_audit(AuditEvent::new(
            actor,
            id,
            AuditEventKind::PostUpdated { fields },
        ))
        .await;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn delete_post(&self, actor: Uuid, id: Uuid) -> Result<(), ServiceError> {
        let existing = self.get_post(id).await?;
        if existing.author_id != actor {
            return Err(ServiceError::Forbidden(
                "only the author can delete this post".into(),
            ));
        }

        if !self.db.delete_post(id).await? {
            return Err(ServiceError::NotFound(RecordKind::Post, id));
        }

        info!(post_id = %id, "post deleted");
        self.record_audit(AuditEvent::new(actor, id, AuditEventKind::PostDeleted))
            .await;
        Ok(())
    }

    /// Stores an uploaded file for `actor`, computing its SHA-256 digest.
    #[instrument(skip(self, request), fields(size = request.bytes.len()))]
    pub async fn upload_file(
        &self,
        actor: Uuid,
        request: UploadFile,
    ) -> Result<FileRecord, ServiceError> {
        let filename = validation::sanitize_filename(&request.filename)?;
        let size = request.bytes.len() as u64;
        if size == 0 {
            return Err(ServiceError::Validation("uploaded file is empty".into()));
        }
        if size > self.config.max_upload_bytes {
            return Err(ServiceError::PayloadTooLarge {
                size,
                limit: self.config.max_upload_bytes,
            });
        }

        let content_type = request
            .content_type
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let sha256 = format!("{:x}", Sha256::digest(&request.bytes));

        let record = self
            .db
            .insert_file(
                NewFile {
                    owner_id: actor,
                    filename: &filename,
                    content_type: &content_type,
                    sha256: &sha256,
                },
                request.bytes,
            )
            .await?;
        if !self.ensure_owner_exists(actor).await? {
            self.db.delete_file(record.id).await?;
            return Err(ServiceError::NotFound(RecordKind::User, actor));
        }

        info!(file_id = %record.id, owner_id = %actor, size, "file uploaded");
        self.record_audit(AuditEvent::new(
            actor,
            record.id,
            AuditEventKind::FileUploaded {
                filename: record.filename.clone(),
                size_bytes: record.size_bytes,
                sha256: record.sha256.clone(),
            },
        ))
        .await;
        Ok(record)
    }

    /// Returns file metadata. Files are private to their owner.
    pub async fn get_file(&self, actor: Uuid, id: Uuid) -> Result<FileRecord, ServiceError> {
        let record = self
            .db
            .fetch_file(id)
            .await?
            .ok_or(ServiceError::NotFound(RecordKind::File, id))?;
        if record.owner_id != actor {
            return Err(ServiceError::Forbidden(
                "files are only accessible to their owner".into(),
            ));
        }
        Ok(record)
    }

    pub async fn download_file(
        &self,
        actor: Uuid,
        id: Uuid,
    ) -> Result<(FileRecord, ObjectData), ServiceError> {
        let record = self.get_file(actor, id).await?;
        let Some(content) = self.db.read_file_content(&record).await? else {
            warn!(file_id = %id, key = %record.object_key, "file metadata without contents");
            return Err(ServiceError::NotFound(RecordKind::FileContents, id));
        };
        Ok((record, content))
    }

    pub async fn list_files(
        &self,
        actor: Uuid,
        page: PageRequest,
    ) -> Result<Page<FileRecord>, ServiceError> {
        Ok(self.db.list_files(actor, page).await?)
    }

    #[instrument(skip(self))]
    pub async fn delete_file(&self, actor: Uuid, id: Uuid) -> Result<(), ServiceError> {
        self.get_file(actor, id).await?;
        if !self.db.delete_file(id).await? {
            return Err(ServiceError::NotFound(RecordKind::File, id));
        }

        info!(file_id = %id, "file deleted");
        self.record_audit(AuditEvent::new(actor, id, AuditEventKind::FileDeleted))
            .await;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(anyhow::Error),
    #[error(transparent)]
    Conflict(RecordError),
    #[error("{0}")]
    Validation(String),
    #[error("{0} {1} not found")]
    NotFound(RecordKind, Uuid),
    #[error("{0}")]
    Forbidden(String),
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },
}

impl From<anyhow::Error> for ServiceError {
    fn from(value: anyhow::Error) -> Self {
        match value.downcast::<RecordError>() {
            Ok(record_err) => ServiceError::Conflict(record_err),
            Err(other) => ServiceError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    User,
    Post,
    File,
    FileContents,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::User => "user",
            RecordKind::Post => "post",
            RecordKind::File => "file",
            RecordKind::FileContents => "contents of file",
        })
    }
}

/// Registration payload; `password_hash` is produced by the auth layer.
#[derive(Debug, Clone)]
pub struct RegisterUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUser {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
}

impl UpdateUser {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.email.is_none() && self.password_hash.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedUser {
    pub posts_removed: usize,
    pub files_removed: usize,
}

#[derive(Debug, Clone)]
pub struct CreatePost {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}
