use std::sync::Arc;

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand_core::OsRng;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::entities::users;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const MAX_HANDLE_LEN: usize = 50;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub handle: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UserRead {
    pub id: i64,
    pub handle: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

pub fn issue_token(cfg: &RuntimeConfig, user_id: i64) -> ApiResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(cfg.jwt_expires_minutes)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
    .map_err(|_| ApiError::Internal)
}

fn verify_token(cfg: &RuntimeConfig, token: &str) -> Option<i64> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    data.claims.sub.parse().ok()
}

fn validate_credentials(payload: &Credentials) -> ApiResult<()> {
    if payload.handle.is_empty() || payload.handle.len() > MAX_HANDLE_LEN {
        return Err(ApiError::BadRequest(format!(
            "handle must be 1..={MAX_HANDLE_LEN} characters"
        )));
    }
    if payload.password.is_empty() {
        return Err(ApiError::BadRequest("password must not be empty".into()));
    }
    Ok(())
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Credentials>,
) -> ApiResult<Json<TokenResponse>> {
    validate_credentials(&payload)?;
    let taken = users::Entity::find()
        .filter(users::Column::Handle.eq(payload.handle.as_str()))
        .one(&state.db)
        .await?
        .is_some();
    if taken {
        return Err(ApiError::BadRequest("handle already taken".into()));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|_| ApiError::Internal)?
        .to_string();

    let user = users::ActiveModel {
        handle: Set(payload.handle),
        password_hash: Set(password_hash),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    tracing::info!(user_id = user.id, handle = %user.handle, "user registered");
    let access_token = issue_token(&state.cfg, user.id)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Credentials>,
) -> ApiResult<Json<TokenResponse>> {
    let user = users::Entity::find()
        .filter(users::Column::Handle.eq(payload.handle.as_str()))
        .one(&state.db)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let parsed = PasswordHash::new(&user.password_hash).map_err(|_| ApiError::Internal)?;
    Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed)
        .map_err(|_| ApiError::Unauthorized)?;

    let access_token = issue_token(&state.cfg, user.id)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

async fn me(CurrentUser(user): CurrentUser) -> Json<UserRead> {
    Json(UserRead {
        id: user.id,
        handle: user.handle,
        created_at: user.created_at,
    })
}

/// Resolves the `Authorization: Bearer` header to a stored user. The match
/// core treats this as the whole of identity; seat authority is separate
/// (the per-seat `player_token`).
pub struct CurrentUser(pub users::Model);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = header.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
        let user_id = verify_token(&state.cfg, token).ok_or(ApiError::Unauthorized)?;
        users::Entity::find_by_id(user_id)
            .one(&state.db)
            .await?
            .map(CurrentUser)
            .ok_or(ApiError::Unauthorized)
    }
}
