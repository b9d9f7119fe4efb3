use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use futures::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub auth_per_minute: u64,
    pub files_per_minute: u64,
    pub api_per_minute: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth_per_minute: 20,
            files_per_minute: 60,
            api_per_minute: 600,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Swap in the clone so the instance polled ready is the one that gets called.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let state = self.state.clone();

        // Read everything needed from the request up front; bodies are not Sync.
        let Some(class) = classify(request.uri().path()) else {
            return Box::pin(inner.call(request));
        };
        let identity = identity_fingerprint(class, &request);

        Box::pin(async move {
            match state.check(class, identity).await {
                Ok(()) => inner.call(request).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    counters: Mutex<HashMap<RateKey, Counter>>,
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    async fn check(&self, class: RateClass, identity: String) -> Result<(), RateLimitRejection> {
        let window = self.config.window;
        let limit = self.config.limit_for(class);
        if limit == 0 {
            return Err(RateLimitRejection {
                class,
                limit: 0,
                window,
                retry_after: window,
            });
        }

        let now = Instant::now();
        let mut counters = self.counters.lock().await;

        // Drop windows that have fully elapsed so idle identities don't pile up.
        counters.retain(|_, counter| now.saturating_duration_since(counter.window_start) < window);

        let entry = counters
            .entry(RateKey {
                class,
                identity: identity.clone(),
            })
            .or_insert(Counter {
                window_start: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(entry.window_start);
        if entry.count >= limit {
            let retry_after = window
                .checked_sub(elapsed)
                .unwrap_or_default()
                .max(Duration::from_secs(1));
            warn!(
                category = class.as_str(),
                identity_fingerprint = %identity,
                limit,
                "rate limit exceeded"
            );
            return Err(RateLimitRejection {
                class,
                limit,
                window,
                retry_after,
            });
        }

        entry.count += 1;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RateKey {
    class: RateClass,
    identity: String,
}

#[derive(Clone, Debug)]
struct Counter {
    window_start: Instant,
    count: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum RateClass {
    Auth,
    Files,
    Api,
}

impl RateClass {
    fn as_str(self) -> &'static str {
        match self {
            RateClass::Auth => "auth",
            RateClass::Files => "files",
            RateClass::Api => "api",
        }
    }
}

impl RateLimitConfig {
    fn limit_for(&self, class: RateClass) -> u64 {
        match class {
            RateClass::Auth => self.auth_per_minute,
            RateClass::Files => self.files_per_minute,
            RateClass::Api => self.api_per_minute,
        }
    }
}

#[derive(Debug)]
struct RateLimitRejection {
    class: RateClass,
    limit: u64,
    window: Duration,
    retry_after: Duration,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let retry_after_secs = self.retry_after.as_secs().max(1);
        let body = RateLimitBody {
            error: "rate_limit_exceeded",
            category: self.class.as_str(),
            limit: self.limit,
            window_seconds: self.window.as_secs(),
            retry_after_seconds: retry_after_secs,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        response
    }
}

#[derive(Serialize)]
struct RateLimitBody {
    error: &'static str,
    category: &'static str,
    limit: u64,
    window_seconds: u64,
    retry_after_seconds: u64,
}

fn classify(path: &str) -> Option<RateClass> {
    match path {
        "/api/v1/auth/login" | "/api/v1/auth/register" => Some(RateClass::Auth),
        _ if path == "/api/v1/files" || path.starts_with("/api/v1/files/") => {
            Some(RateClass::Files)
        }
        _ if path.starts_with("/api/v1/") => Some(RateClass::Api),
        _ => None,
    }
}

/// Hashes whichever caller identity is available. Login and registration
/// ignore `Authorization`, which those callers are free to invent.
fn identity_fingerprint<B>(class: RateClass, request: &Request<B>) -> String {
    let headers = request.headers();
    let authorization = match class {
        RateClass::Auth => None,
        RateClass::Files | RateClass::Api => headers.get(header::AUTHORIZATION),
    };
    let source = authorization
        .or_else(|| headers.get(FORWARDED_FOR))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(peer)| peer.ip().to_string())
        });

    match source {
        Some(value) => STANDARD_NO_PAD.encode(Sha256::digest(value.as_bytes())),
        None => "anonymous".to_string(),
    }
}
