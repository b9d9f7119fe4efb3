//! Append-only JSONL trail of account, post and file mutations.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    /// When set, every line carries a base64 HMAC-SHA256 of the event JSON.
    pub hmac_key: Option<Vec<u8>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: PathBuf::from("./logs/postbox-audit.jsonl"),
            hmac_key: None,
        }
    }
}

/// Serializes appends through one lazily opened handle.
pub(crate) struct AuditLogWriter {
    path: PathBuf,
    signer: Option<HmacSha256>,
    file: Mutex<Option<File>>,
}

impl AuditLogWriter {
    pub fn try_new(config: &AuditConfig) -> Result<Self> {
        let signer = config
            .hmac_key
            .as_deref()
            .map(HmacSha256::new_from_slice)
            .transpose()
            .map_err(|_| anyhow!("invalid audit HMAC key"))?;

        Ok(Self {
            path: config.log_path.clone(),
            signer,
            file: Mutex::new(None),
        })
    }

    pub async fn append(&self, event: &AuditEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("serializing audit event")?;
        let line = SignedLine {
            event,
            signature: self.sign(&payload),
        };
        let mut encoded = serde_json::to_vec(&line).context("serializing audit line")?;
        encoded.push(b'\n');

        let mut guard = self.file.lock().await;
        let file = match &mut *guard {
            Some(file) => file,
            slot => slot.insert(self.open().await?),
        };
        if let Err(err) = file.write_all(&encoded).await {
            // Reopen on the next append in case the file was rotated away.
            *guard = None;
            return Err(err).with_context(|| format!("writing {}", self.path.display()));
        }
        file.flush().await?;
        Ok(())
    }

    fn sign(&self, payload: &[u8]) -> Option<String> {
        let mut mac = self.signer.clone()?;
        mac.update(payload);
        Some(STANDARD_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    async fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating audit log directory {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening audit log {}", self.path.display()))
    }
}

#[derive(Serialize)]
struct SignedLine<'a> {
    #[serde(flatten)]
    event: &'a AuditEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// One line of the audit log: who did what to which record.
#[derive(Debug, Serialize, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub actor_id: Uuid,
    pub subject_id: Uuid,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

impl AuditEvent {
    pub fn new(actor_id: Uuid, subject_id: Uuid, kind: AuditEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            actor_id,
            subject_id,
            kind,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventKind {
    UserRegistered {
        username: String,
    },
    UserUpdated {
        fields: Vec<&'static str>,
    },
    UserDeleted {
        posts_removed: usize,
        files_removed: usize,
    },
    PostCreated {
        title: String,
    },
    PostUpdated {
        fields: Vec<&'static str>,
    },
    PostDeleted,
    FileUploaded {
        filename: String,
        size_bytes: u64,
        sha256: String,
    },
    FileDeleted,
}
