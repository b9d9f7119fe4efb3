//! S3 compatible backend (MinIO in the default deployment).

use std::fmt;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{http::HttpResponse, BehaviorVersion, Credentials, Region},
    error::SdkError,
    primitives::ByteStream,
    types::{BucketLocationConstraint, CreateBucketConfiguration},
    Client,
};
use bytes::Bytes;
use tracing::{info, instrument};

use crate::storage::{ObjectData, ObjectStore, StorageError, StorageResult};

const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for an S3 compatible endpoint.
#[derive(Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub region: Option<String>,
    /// Optional key prefix, lets several deployments share one bucket.
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// MinIO needs path-style addressing (`endpoint/bucket/key`).
    pub force_path_style: bool,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            bucket: "postbox".to_string(),
            region: None,
            prefix: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    region: String,
    prefix: Option<String>,
}

impl S3Store {
    pub fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::Config("bucket name cannot be empty".into()));
        }

        let region = config
            .region
            .filter(|region| !region.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .force_path_style(config.force_path_style);

        match (config.access_key_id, config.secret_access_key) {
            (Some(key_id), Some(secret)) => {
                builder = builder.credentials_provider(Credentials::new(
                    key_id, secret, None, None, "postbox-config",
                ));
            }
            (None, None) => {
                return Err(StorageError::Config(
                    "S3 access key and secret key must be configured".into(),
                ))
            }
            _ => {
                return Err(StorageError::Config(
                    "S3 config requires both access key and secret key when either is set".into(),
                ))
            }
        }

        if let Some(endpoint) = config.endpoint.filter(|e| !e.trim().is_empty()) {
            builder = builder.endpoint_url(normalize_endpoint(&endpoint));
        }

        let prefix = config
            .prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            region,
            prefix,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Creates the bucket when it does not exist yet.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(StorageError::Backend(Box::new(err))),
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|err| StorageError::Backend(Box::new(err)))?;
        info!("created object storage bucket");
        Ok(())
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(StorageError::Backend(Box::new(err))),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, bytes), fields(backend = "s3", size = bytes.len()))]
    async fn put(&self, key: &str, bytes: Bytes, content_type: Option<&str>) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| StorageError::Backend(Box::new(err)))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Option<ObjectData>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(StorageError::Backend(Box::new(err))),
        };

        let content_type = output.content_type().map(str::to_string);
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Backend(Box::new(err)))?
            .into_bytes();

        Ok(Some(ObjectData {
            bytes,
            content_type,
        }))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<bool> {
        // DeleteObject succeeds on missing keys, so probe first.
        if !self.exists(key).await? {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|err| StorageError::Backend(Box::new(err)))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|err| StorageError::Backend(Box::new(err)))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(self.strip_prefix(key));
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| StorageError::Backend(Box::new(err)))?;
        Ok(())
    }
}

fn is_not_found<E>(err: &SdkError<E, HttpResponse>) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404)
}

/// Bare `host:port` endpoints (e.g. `minio:9000`) get an `http://` scheme.
fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    }
}
