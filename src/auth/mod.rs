use actix_web::dev::Payload;
use actix_web::error::InternalError;
use actix_web::{web, Error, FromRequest, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use futures_util::future::{ready, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::MAX_SESSION_DAYS;
use crate::models::{ApiResponse, Session, User, UserRole};
use crate::store::{Store, StoreError};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,      // user_id
    pub sid: String,      // session id
    pub exp: i64,         // expiration timestamp
    pub iat: i64,         // issued at
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("Session expired")]
    SessionExpired,
    #[error("Session lifetime out of range")]
    SessionLifetime,
    #[error("Password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AuthService {
    jwt_secret: String,
    session_ttl: Duration,
    store: Arc<Store>,
}

impl AuthService {
    pub fn new(jwt_secret: String, store: Arc<Store>) -> Self {
        Self {
            jwt_secret,
            session_ttl: Duration::days(7),
            store,
        }
    }

    pub fn with_session_days(mut self, days: i64) -> Self {
        self.session_ttl = Duration::days(days.clamp(1, MAX_SESSION_DAYS));
        self
    }

    /// Hash a password using bcrypt
    pub fn hash_password(&self, password: &str) -> Result<String, bcrypt::BcryptError> {
        bcrypt::hash(password, 10)
    }

    /// Verify a password against a bcrypt hash
    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool, bcrypt::BcryptError> {
        bcrypt::verify(password, hash)
    }

    /// Open a session for the user and sign a token bound to it
    pub fn start_session(&self, user: &User) -> Result<String, AuthError> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(self.session_ttl)
            .ok_or(AuthError::SessionLifetime)?;
        let mut session = Session {
            id: String::new(),
            user_id: user.id.clone(),
            expires_at,
            created_at: now,
        };
        self.store.create_session(&mut session)?;

        let token = self.generate_token(&user.id, &session.id)?;
        Ok(token)
    }

    pub fn end_session(&self, session_id: &str) -> Result<(), AuthError> {
        self.store.delete_session(session_id)?;
        Ok(())
    }

    /// Generate a JWT token for a user session
    pub fn generate_token(&self, user_id: &str, session_id: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + self.session_ttl;

        let claims = Claims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
    }

    /// Validate a JWT token and return the claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    /// Resolve a bearer token to the user behind a live session
    pub fn authenticate(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = self.validate_token(token)?;

        let session = self.store.get_session(&claims.sid)?;
        if session.user_id != claims.sub || session.expires_at < Utc::now() {
            return Err(AuthError::SessionExpired);
        }

        let user = self.store.get_user(&claims.sub)?;
        Ok(AuthUser {
            user_id: user.id,
            username: user.username,
            display_name: user.display_name,
            role: user.role,
            session_id: session.id,
        })
    }
}

/// Authenticated user info extracted from request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub role: UserRole,
    pub session_id: String,
}

impl AuthUser {
    pub fn is_owner(&self) -> bool {
        self.role == UserRole::Owner
    }
}

fn unauthorized(msg: &'static str) -> Error {
    InternalError::from_response(
        msg,
        HttpResponse::Unauthorized().json(ApiResponse::<()>::error(msg)),
    )
    .into()
}

/// Extract auth info from request
fn extract_auth(req: &HttpRequest) -> Result<AuthUser, Error> {
    let auth_service = req
        .app_data::<web::Data<Arc<AuthService>>>()
        .ok_or_else(|| unauthorized("Authentication unavailable"))?;

    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Invalid Authorization header format"))?;

    auth_service.authenticate(token).map_err(|e| {
        log::debug!("Rejected token: {}", e);
        match e {
            AuthError::SessionExpired | AuthError::Store(StoreError::NotFound(_)) => {
                unauthorized("Session expired")
            }
            _ => unauthorized("Invalid token"),
        }
    })
}

impl FromRequest for AuthUser {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract_auth(req))
    }
}

/// Check if user may manage the feed owner's images
pub fn require_owner(auth_user: &AuthUser) -> Result<(), HttpResponse> {
    if auth_user.is_owner() {
        Ok(())
    } else {
        Err(HttpResponse::Forbidden().json(ApiResponse::<()>::error("Owner access required")))
    }
}
