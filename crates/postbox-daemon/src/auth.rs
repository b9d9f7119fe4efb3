use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use postbox_core::{validation, PostboxService, RegisterUser, ServiceError};
use postbox_store::UserRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const MIN_JWT_SECRET_BYTES: usize = 32;
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const BCRYPT_MIN_COST: u32 = 4;
const BCRYPT_MAX_COST: u32 = 31;

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub bcrypt_cost: u32,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .finish()
    }
}

/// JWT payload. `sub` carries the user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: IssuedToken,
    pub user: UserRecord,
}

/// Identity resolved from a bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{0}")]
    Internal(String),
}

#[derive(Clone)]
pub struct AuthService {
    service: PostboxService,
    config: Arc<AuthConfig>,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthService {
    pub fn new(service: PostboxService, config: AuthConfig) -> Result<Self, AuthError> {
        if config.jwt_secret.len() < MIN_JWT_SECRET_BYTES {
            return Err(AuthError::Internal(format!(
                "JWT secret must be at least {MIN_JWT_SECRET_BYTES} bytes"
            )));
        }
        if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&config.bcrypt_cost) {
            return Err(AuthError::Internal(format!(
                "bcrypt cost must be between {BCRYPT_MIN_COST} and {BCRYPT_MAX_COST}"
            )));
        }

        let encoding = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        Ok(Self {
            service,
            config: Arc::new(config),
            encoding,
            decoding,
        })
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let password_hash = self.hash_password(password).await?;
        let user = self
            .service
            .register_user(RegisterUser {
                username: username.to_string(),
                email: email.to_string(),
                password_hash,
            })
            .await?;
        let token = self.issue_token(&user)?;
        Ok(Session { token, user })
    }

    /// Unknown emails and wrong passwords are indistinguishable to the caller.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let Some(user) = self.service.find_user_by_email(email).await? else {
            debug!("login attempt for unknown email");
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_password(password, &user.password_hash).await? {
            debug!(user_id = %user.id, "login attempt with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        info!(user_id = %user.id, "user logged in");
        let token = self.issue_token(&user)?;
        Ok(Session { token, user })
    }

    pub fn issue_token(&self, user: &UserRecord) -> Result<IssuedToken, AuthError> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.config.token_ttl)
            .map_err(|err| AuthError::Internal(format!("invalid token lifetime: {err}")))?;
        let expires_at = now + ttl;
        let claims = Claims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| AuthError::Internal(format!("failed to sign token: {err}")))?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Verifies the token and confirms the account still exists.
    pub async fn authorize(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|_| AuthError::InvalidToken)?
            .claims;
        let id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;

        match self.service.get_user(id).await {
            Ok(user) => Ok(AuthenticatedUser {
                id: user.id,
                username: user.username,
            }),
            Err(ServiceError::NotFound(..)) => Err(AuthError::InvalidToken),
            Err(err) => Err(err.into()),
        }
    }

    /// Validates and hashes a password on the blocking pool.
    pub async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        validation::validate_password(password)?;
        let password = password.to_string();
        let cost = self.config.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|err| AuthError::Internal(format!("password hashing task failed: {err}")))?
            .map_err(|err| AuthError::Internal(format!("failed to hash password: {err}")))
    }
}

async fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|err| AuthError::Internal(format!("password check task failed: {err}")))?
        .map_err(|err| AuthError::Internal(format!("failed to verify password: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use postbox_core::ServiceConfig;
    use postbox_store::Database;

    fn auth_service() -> AuthService {
        let service = PostboxService::new(Database::in_memory(), ServiceConfig::default());
        AuthService::new(
            service,
            AuthConfig {
                jwt_secret: "0123456789abcdef0123456789abcdef".into(),
                token_ttl: Duration::from_secs(60),
                bcrypt_cost: 4,
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_short_secrets() {
        let service = PostboxService::new(Database::in_memory(), ServiceConfig::default());
        let result = AuthService::new(
            service,
            AuthConfig {
                jwt_secret: "too-short".into(),
                token_ttl: DEFAULT_TOKEN_TTL,
                bcrypt_cost: 4,
            },
        );
        assert!(matches!(result, Err(AuthError::Internal(_))));
    }

    #[tokio::test]
    async fn register_login_and_authorize() {
        let auth = auth_service();
        let session = auth
            .register("carol", "Carol@example.com", "correct horse")
            .await
            .unwrap();
        assert_ne!(session.user.password_hash, "correct horse");

        let identity = auth.authorize(&session.token.token).await.unwrap();
        assert_eq!(identity.id, session.user.id);
        assert_eq!(identity.username, "carol");

        let login = auth
            .login("carol@example.com", "correct horse")
            .await
            .unwrap();
        assert_eq!(login.user.id, session.user.id);
    }

    #[tokio::test]
    async fn bad_credentials_look_the_same() {
        let auth = auth_service();
        auth.register("dave", "dave@example.com", "password123")
            .await
            .unwrap();

        let wrong_password = auth.login("dave@example.com", "password124").await;
        let unknown_email = auth.login("nobody@example.com", "password123").await;
        assert!(matches!(wrong_password, Err(AuthError::InvalidCredentials)));
        assert!(matches!(unknown_email, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn weak_passwords_are_rejected() {
        let auth = auth_service();
        let err = auth
            .register("erin", "erin@example.com", "short")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Service(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn rejects_tampered_and_expired_tokens() {
        let auth = auth_service();
        let session = auth
            .register("frank", "frank@example.com", "password123")
            .await
            .unwrap();

        let mut tampered = session.token.token.clone();
        tampered.push('x');
        assert!(matches!(
            auth.authorize(&tampered).await,
            Err(AuthError::InvalidToken)
        ));

        let expired = Claims {
            sub: session.user.id.to_string(),
            username: "frank".into(),
            iat: 0,
            exp: 1,
        };
        let token = jsonwebtoken::encode(&Header::default(), &expired, &auth.encoding).unwrap();
        assert!(matches!(
            auth.authorize(&token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn tokens_for_deleted_users_are_rejected() {
        let auth = auth_service();
        let session = auth
            .register("gina", "gina@example.com", "password123")
            .await
            .unwrap();
        auth.service
            .delete_user(session.user.id, session.user.id)
            .await
            .unwrap();

        assert!(matches!(
            auth.authorize(&session.token.token).await,
            Err(AuthError::InvalidToken)
        ));
    }
}
