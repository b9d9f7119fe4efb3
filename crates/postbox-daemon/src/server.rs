use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use crate::auth::{AuthConfig, AuthError, AuthService, AuthenticatedUser, Session, DEFAULT_TOKEN_TTL};
use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use anyhow::{bail, Context, Result};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use postbox_core::{
    AuditConfig, CreatePost, PostboxService, ServiceConfig, ServiceError, UpdatePost, UpdateUser,
    UploadFile,
};
use postbox_store::{
    Database, FileRecord, MemoryStore, ObjectStore, Page, PageRequest, PostRecord, S3Config,
    S3Store, UserRecord,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;
const DEFAULT_MAX_UPLOAD_MIB: u64 = 10;
/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let store: Arc<dyn ObjectStore> = match &config.storage {
        StorageBackend::S3(s3) => {
            let store = S3Store::new(s3.clone()).context("failed to configure S3 client")?;
            store
                .ensure_bucket()
                .await
                .with_context(|| format!("failed to prepare bucket {}", store.bucket()))?;
            Arc::new(store)
        }
        StorageBackend::Memory => {
            warn!("using in-memory storage; all data is lost on shutdown");
            Arc::new(MemoryStore::new())
        }
    };

    let db = Database::new(store);
    let service = PostboxService::new(db, config.service.clone());
    let auth = AuthService::new(service.clone(), config.auth.clone())
        .context("failed to initialize authentication")?;
    let state = Arc::new(AppState { service, auth });

    let app = build_app(state, &config.cors_origins, config.rate_limits.clone())?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "postbox-daemon listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server exited")?;
    info!("postbox-daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// The router wrapped in the layers every deployment runs with.
fn build_app(
    state: Arc<AppState>,
    cors_origins: &[String],
    rate_limits: RateLimitConfig,
) -> Result<Router> {
    Ok(build_router(state)
        .layer(cors_layer(cors_origins)?)
        .layer(rate_limit_layer(rate_limits))
        .layer(TraceLayer::new_for_http()))
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state
        .service
        .config()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/me", get(current_user))
        .route("/api/v1/users", get(list_users))
        .route(
            "/api/v1/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/api/v1/users/:id/posts", get(list_user_posts))
        .route("/api/v1/posts", get(list_posts).post(create_post))
        .route(
            "/api/v1/posts/:id",
            get(get_post).put(update_post).delete(delete_post),
        )
        .route("/api/v1/files", get(list_files).post(upload_file))
        .route("/api/v1/files/:id", get(get_file).delete(delete_file))
        .route("/api/v1/files/:id/content", get(download_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_DISPOSITION, header::RETRY_AFTER]);

    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }

    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(origins))
}

#[derive(Clone)]
struct AppState {
    service: PostboxService,
    auth: AuthService,
}

#[derive(Debug, Clone)]
enum StorageBackend {
    S3(S3Config),
    Memory,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    storage: StorageBackend,
    service: ServiceConfig,
    auth: AuthConfig,
    cors_origins: Vec<String>,
    rate_limits: RateLimitConfig,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("POSTBOX_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid POSTBOX_API_ADDR")?;

        let storage = match non_empty_env("POSTBOX_STORAGE")
            .unwrap_or_else(|| "s3".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "s3" | "minio" => StorageBackend::S3(s3_config_from_env()?),
            "memory" => StorageBackend::Memory,
            other => bail!("unsupported POSTBOX_STORAGE '{other}' (expected 's3' or 'memory')"),
        };

        let max_upload_mib = parse_env::<u64>("POSTBOX_MAX_UPLOAD_MIB")?
            .unwrap_or(DEFAULT_MAX_UPLOAD_MIB);
        if max_upload_mib == 0 {
            bail!("POSTBOX_MAX_UPLOAD_MIB must be greater than zero");
        }

        let audit_enabled = bool_env("POSTBOX_AUDIT_LOG_ENABLED").unwrap_or(false);
        let audit_log_path = non_empty_env("POSTBOX_AUDIT_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| AuditConfig::default().log_path);
        let audit_hmac_key = non_empty_env("POSTBOX_AUDIT_LOG_HMAC_KEY")
            .map(|value| {
                STANDARD
                    .decode(value)
                    .context("invalid base64 in POSTBOX_AUDIT_LOG_HMAC_KEY")
            })
            .transpose()?;

        let service = ServiceConfig {
            max_upload_bytes: max_upload_mib.saturating_mul(MIB),
            audit: AuditConfig {
                enabled: audit_enabled,
                log_path: audit_log_path,
                hmac_key: audit_hmac_key,
            },
        };

        let jwt_secret =
            non_empty_env("POSTBOX_JWT_SECRET").context("POSTBOX_JWT_SECRET must be configured")?;
        let token_ttl = parse_env::<u64>("POSTBOX_JWT_TTL_SECONDS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        let bcrypt_cost = parse_env::<u32>("POSTBOX_BCRYPT_COST")?.unwrap_or(bcrypt::DEFAULT_COST);
        let auth = AuthConfig {
            jwt_secret,
            token_ttl,
            bcrypt_cost,
        };

        let cors_origins = parse_string_list_env("POSTBOX_CORS_ORIGINS").unwrap_or_default();

        Ok(Self {
            listen_addr,
            storage,
            service,
            auth,
            cors_origins,
            rate_limits: RateLimitConfig::default(),
        })
    }
}

fn s3_config_from_env() -> Result<S3Config> {
    let defaults = S3Config::default();
    let access_key_id =
        non_empty_env("POSTBOX_S3_ACCESS_KEY").or_else(|| non_empty_env("MINIO_ROOT_USER"));
    let secret_access_key =
        non_empty_env("POSTBOX_S3_SECRET_KEY").or_else(|| non_empty_env("MINIO_ROOT_PASSWORD"));
    if access_key_id.is_some() != secret_access_key.is_some() {
        bail!("POSTBOX_S3_ACCESS_KEY and POSTBOX_S3_SECRET_KEY must be set together");
    }

    Ok(S3Config {
        endpoint: non_empty_env("POSTBOX_S3_ENDPOINT").or(defaults.endpoint),
        bucket: non_empty_env("POSTBOX_S3_BUCKET").unwrap_or(defaults.bucket),
        region: non_empty_env("POSTBOX_S3_REGION"),
        prefix: non_empty_env("POSTBOX_S3_PREFIX"),
        access_key_id,
        secret_access_key,
        force_path_style: bool_env("POSTBOX_S3_FORCE_PATH_STYLE")
            .unwrap_or(defaults.force_path_style),
    })
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service and object store are reachable"),
        (status = 503, description = "Object store unavailable", body = ErrorBody)
    )
)]
async fn healthz(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state
        .service
        .database()
        .health_check()
        .await
        .map_err(|err| {
            warn!(error = %err, "health check failed");
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "object store unavailable")
        })?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterBody,
    responses(
        (status = 201, description = "Account created", body = SessionResponse),
        (status = 400, description = "Invalid username, email or password", body = ErrorBody),
        (status = 409, description = "Username or email already in use", body = ErrorBody)
    )
)]
async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<RegisterBody>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session = state
        .auth
        .register(&payload.username, &payload.email, &payload.password)
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(session))))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Token issued", body = SessionResponse),
        (status = 401, description = "Invalid email or password", body = ErrorBody)
    )
)]
async fn login(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<LoginBody>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.auth.login(&payload.email, &payload.password).await?;
    Ok(Json(SessionResponse::from(session)))
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Authenticated account", body = UserResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn current_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let user = state.service.get_user(actor.id).await?;
    Ok(Json(UserResponse::for_viewer(user, actor.id)))
}

#[utoipa::path(
    get,
    path = "/api/v1/users",
    params(PageQuery),
    responses(
        (status = 200, description = "Registered users, newest first", body = UserPage),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<PageResponse<UserResponse>>, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let page = state.service.list_users(query.page()).await?;
    Ok(Json(PageResponse::from_page(page, |user| {
        UserResponse::for_viewer(user, actor.id)
    })))
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User", body = UserResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 404, description = "Unknown user", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<UserResponse>, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let user = state.service.get_user(id).await?;
    Ok(Json(UserResponse::for_viewer(user, actor.id)))
}

#[utoipa::path(
    put,
    path = "/api/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UpdateUserBody,
    responses(
        (status = 200, description = "Updated account", body = UserResponse),
        (status = 400, description = "Invalid or empty update", body = ErrorBody),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Not the account owner", body = ErrorBody),
        (status = 404, description = "Unknown user", body = ErrorBody),
        (status = 409, description = "Username or email already in use", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn update_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateUserBody>,
) -> Result<Json<UserResponse>, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    if actor.id != id {
        return Err(ApiError::forbidden("users can only modify their own account"));
    }

    let password_hash = match payload.password.as_deref() {
        Some(password) => Some(state.auth.hash_password(password).await?),
        None => None,
    };
    let user = state
        .service
        .update_user(
            actor.id,
            id,
            UpdateUser {
                username: payload.username,
                email: payload.email,
                password_hash,
            },
        )
        .await?;
    Ok(Json(UserResponse::for_viewer(user, actor.id)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 204, description = "Account, posts and files deleted"),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Not the account owner", body = ErrorBody),
        (status = 404, description = "Unknown user", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn delete_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    state.service.delete_user(actor.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{id}/posts",
    params(("id" = Uuid, Path, description = "Author id"), PageQuery),
    responses(
        (status = 200, description = "Posts by the user, newest first", body = PostPage),
        (status = 404, description = "Unknown user", body = ErrorBody)
    )
)]
async fn list_user_posts(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<PageResponse<PostResponse>>, ApiError> {
    state.service.get_user(id).await?;
    let page = state.service.list_posts(Some(id), query.page()).await?;
    Ok(Json(PageResponse::from_page(page, PostResponse::from)))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    params(PostListQuery),
    responses(
        (status = 200, description = "Posts, newest first", body = PostPage),
        (status = 400, description = "Invalid query", body = ErrorBody)
    )
)]
async fn list_posts(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<PostListQuery>,
) -> Result<Json<PageResponse<PostResponse>>, ApiError> {
    let page = state
        .service
        .list_posts(query.author_id, PageRequest::new(query.offset, query.limit))
        .await?;
    Ok(Json(PageResponse::from_page(page, PostResponse::from)))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = CreatePostBody,
    responses(
        (status = 201, description = "Post created", body = PostResponse),
        (status = 400, description = "Invalid title or content", body = ErrorBody),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn create_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreatePostBody>,
) -> Result<(StatusCode, Json<PostResponse>), ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let post = state
        .service
        .create_post(
            actor.id,
            CreatePost {
                title: payload.title,
                content: payload.content,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(PostResponse::from(post))))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Uuid, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post", body = PostResponse),
        (status = 404, description = "Unknown post", body = ErrorBody)
    )
)]
async fn get_post(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<PostResponse>, ApiError> {
    let post = state.service.get_post(id).await?;
    Ok(Json(PostResponse::from(post)))
}

#[utoipa::path(
    put,
    path = "/api/v1/posts/{id}",
    params(("id" = Uuid, Path, description = "Post id")),
    request_body = UpdatePostBody,
    responses(
        (status = 200, description = "Updated post", body = PostResponse),
        (status = 400, description = "Invalid or empty update", body = ErrorBody),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Not the author", body = ErrorBody),
        (status = 404, description = "Unknown post", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn update_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdatePostBody>,
) -> Result<Json<PostResponse>, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let post = state
        .service
        .update_post(
            actor.id,
            id,
            UpdatePost {
                title: payload.title,
                content: payload.content,
            },
        )
        .await?;
    Ok(Json(PostResponse::from(post)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}",
    params(("id" = Uuid, Path, description = "Post id")),
    responses(
        (status = 204, description = "Post deleted"),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Not the author", body = ErrorBody),
        (status = 404, description = "Unknown post", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn delete_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    state.service.delete_post(actor.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/files",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "File stored", body = FileResponse),
        (status = 400, description = "Missing or empty file part", body = ErrorBody),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 413, description = "File exceeds the upload limit", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<FileResponse>), ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let mut multipart = multipart?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(ApiError::from)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        if upload.is_some() {
            return Err(ApiError::bad_request(format!(
                "only one '{UPLOAD_FIELD}' part is allowed"
            )));
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("file part must carry a filename"))?;
        let content_type = field.content_type().map(str::to_string);
        let bytes: Bytes = field.bytes().await.map_err(ApiError::from)?;
        upload = Some(UploadFile {
            filename,
            content_type,
            bytes,
        });
    }

    let upload = upload.ok_or_else(|| {
        ApiError::bad_request(format!("multipart form must contain a '{UPLOAD_FIELD}' part"))
    })?;
    let file = state.service.upload_file(actor.id, upload).await?;
    Ok((StatusCode::CREATED, Json(FileResponse::from(file))))
}

#[utoipa::path(
    get,
    path = "/api/v1/files",
    params(PageQuery),
    responses(
        (status = 200, description = "Files owned by the caller, newest first", body = FilePage),
        (status = 401, description = "Missing or invalid token", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<PageResponse<FileResponse>>, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let page = state.service.list_files(actor.id, query.page()).await?;
    Ok(Json(PageResponse::from_page(page, FileResponse::from)))
}

#[utoipa::path(
    get,
    path = "/api/v1/files/{id}",
    params(("id" = Uuid, Path, description = "File id")),
    responses(
        (status = 200, description = "File metadata", body = FileResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Not the owner", body = ErrorBody),
        (status = 404, description = "Unknown file", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<FileResponse>, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let file = state.service.get_file(actor.id, id).await?;
    Ok(Json(FileResponse::from(file)))
}

#[utoipa::path(
    get,
    path = "/api/v1/files/{id}/content",
    params(("id" = Uuid, Path, description = "File id")),
    responses(
        (status = 200, description = "Raw file contents", content_type = "application/octet-stream"),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Not the owner", body = ErrorBody),
        (status = 404, description = "Unknown file", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn download_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Response, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    let (file, content) = state.service.download_file(actor.id, id).await?;

    let content_type = HeaderValue::from_str(&file.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&content_disposition(&file.filename))
        .map_err(ApiError::internal)?;
    let headers = [
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_LENGTH, HeaderValue::from(content.bytes.len())),
        (header::CONTENT_DISPOSITION, disposition),
    ];
    Ok((headers, content.bytes).into_response())
}

#[utoipa::path(
    delete,
    path = "/api/v1/files/{id}",
    params(("id" = Uuid, Path, description = "File id")),
    responses(
        (status = 204, description = "File deleted"),
        (status = 401, description = "Missing or invalid token", body = ErrorBody),
        (status = 403, description = "Not the owner", body = ErrorBody),
        (status = 404, description = "Unknown file", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn delete_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    let actor = authenticate(&state, &headers).await?;
    state.service.delete_file(actor.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Deserialize, ToSchema)]
struct RegisterBody {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct LoginBody {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct UpdateUserBody {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
struct CreatePostBody {
    title: String,
    content: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct UpdatePostBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Documentation-only shape of the upload form.
#[allow(dead_code)]
#[derive(ToSchema)]
struct UploadForm {
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct PageQuery {
    /// Number of items to skip.
    offset: Option<u32>,
    /// Page size, 1 to 100. Defaults to 20.
    limit: Option<u32>,
}

impl PageQuery {
    fn page(&self) -> PageRequest {
        PageRequest::new(self.offset, self.limit)
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct PostListQuery {
    offset: Option<u32>,
    limit: Option<u32>,
    /// Only return posts written by this user.
    author_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct UserResponse {
    id: Uuid,
    username: String,
    /// Only present on the caller's own account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserResponse {
    fn for_viewer(record: UserRecord, viewer: Uuid) -> Self {
        let email = (record.id == viewer).then_some(record.email);
        Self {
            id: record.id,
            username: record.username,
            email,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct SessionResponse {
    token: String,
    token_type: String,
    expires_at: DateTime<Utc>,
    user: UserResponse,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        let user_id = session.user.id;
        Self {
            token: session.token.token,
            token_type: "Bearer".to_string(),
            expires_at: session.token.expires_at,
            user: UserResponse::for_viewer(session.user, user_id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct PostResponse {
    id: Uuid,
    author_id: Uuid,
    title: String,
    content: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PostRecord> for PostResponse {
    fn from(record: PostRecord) -> Self {
        Self {
            id: record.id,
            author_id: record.author_id,
            title: record.title,
            content: record.content,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct FileResponse {
    id: Uuid,
    owner_id: Uuid,
    filename: String,
    content_type: String,
    size_bytes: u64,
    sha256: String,
    created_at: DateTime<Utc>,
}

impl From<FileRecord> for FileResponse {
    fn from(record: FileRecord) -> Self {
        Self {
            id: record.id,
            owner_id: record.owner_id,
            filename: record.filename,
            content_type: record.content_type,
            size_bytes: record.size_bytes,
            sha256: record.sha256,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[aliases(
    UserPage = PageResponse<UserResponse>,
    PostPage = PageResponse<PostResponse>,
    FilePage = PageResponse<FileResponse>
)]
struct PageResponse<T> {
    items: Vec<T>,
    total: u64,
    offset: u32,
    limit: u32,
}

impl<T> PageResponse<T> {
    fn from_page<R, F>(page: Page<R>, f: F) -> Self
    where
        F: FnMut(R) -> T,
    {
        let page = page.map(f);
        Self {
            items: page.items,
            total: page.total,
            offset: page.offset,
            limit: page.limit,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Storage(inner) => {
                error!(error = ?inner, "storage backend failure");
                ApiError::internal("storage backend failure")
            }
            ServiceError::Conflict(conflict) => {
                ApiError::new(StatusCode::CONFLICT, conflict.to_string())
            }
            ServiceError::Validation(message) => ApiError::bad_request(message),
            err @ ServiceError::NotFound(..) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            ServiceError::Forbidden(message) => ApiError::forbidden(message),
            err @ ServiceError::PayloadTooLarge { .. } => {
                ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => ApiError::unauthorized("invalid email or password"),
            AuthError::InvalidToken => ApiError::unauthorized("invalid or expired token"),
            AuthError::Service(inner) => ApiError::from(inner),
            AuthError::Internal(message) => ApiError::internal(message),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::new(err.status(), err.body_text())
    }
}

/// Extractor rejections keep their status, except that undecodable JSON is
/// reported as a plain 400 like every other invalid payload.
fn rejection_error(status: StatusCode, message: String) -> ApiError {
    let status = match status {
        StatusCode::UNPROCESSABLE_ENTITY => StatusCode::BAD_REQUEST,
        other => other,
    };
    ApiError::new(status, message)
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        rejection_error(rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        rejection_error(rejection.status(), rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        rejection_error(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        rejection_error(rejection.status(), rejection.body_text())
    }
}

// axum's own extractors, with rejections rendered as `ErrorBody`.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(ApiError))]
struct ApiPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
struct ApiQuery<T>(T);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Postbox API", version = "0.1.0"),
        paths(
            healthz,
            register,
            login,
            current_user,
            list_users,
            get_user,
            update_user,
            delete_user,
            list_user_posts,
            list_posts,
            create_post,
            get_post,
            update_post,
            delete_post,
            upload_file,
            list_files,
            get_file,
            download_file,
            delete_file
        ),
        components(
            schemas(
                RegisterBody,
                LoginBody,
                UpdateUserBody,
                CreatePostBody,
                UpdatePostBody,
                UploadForm,
                UserResponse,
                SessionResponse,
                PostResponse,
                FileResponse,
                UserPage,
                PostPage,
                FilePage,
                ErrorBody
            )
        ),
        modifiers(&SecurityAddon),
        tags((name = "postbox", description = "Users, posts and file uploads"))
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some("Token returned by /api/v1/auth/login"))
                        .build(),
                ),
            );
        }
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, ApiError> {
    let token = require_bearer(headers)?;
    Ok(state.auth.authorize(token).await?)
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    bearer_optional(headers)?
        .ok_or_else(|| ApiError::unauthorized("missing Authorization bearer token"))
}

fn bearer_optional(headers: &HeaderMap) -> Result<Option<&str>, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    match header_value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(Some(token.trim())),
        _ => Err(ApiError::unauthorized(
            "Authorization header must be a Bearer token",
        )),
    }
}

/// Builds an `attachment` disposition with an ASCII fallback name and an
/// RFC 5987 encoded `filename*` for everything else.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    let mut encoded = String::with_capacity(filename.len());
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    non_empty_env(key)
        .map(|value| value.parse::<T>().with_context(|| format!("invalid {key}")))
        .transpose()
}

fn bool_env(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn parse_string_list_env(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    })
}
