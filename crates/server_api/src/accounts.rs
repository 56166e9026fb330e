use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::{
    domain::UserId,
    error::CoreError,
    protocol::UserProfile,
};
use storage::{NewUser, StoredUser};
use uuid::Uuid;

use crate::ApiContext;

#[derive(Debug, Serialize)]
struct TokenClaims {
    sub: String,
    iat: i64,
    jti: String,
}

/// Bearer tokens are minted as HS256 JWTs but treated as opaque strings:
/// resolution is a store lookup, never signature validation.
fn mint_token(secret: &str, user_id: UserId) -> Result<String, CoreError> {
    let claims = TokenClaims {
        sub: user_id.0.to_string(),
        iat: Utc::now().timestamp(),
        jti: Uuid::new_v4().to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| CoreError::Storage(anyhow::Error::new(err)))
}

pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

pub fn profile(user: &StoredUser) -> UserProfile {
    UserProfile {
        id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
        phone: user.phone.clone(),
        email_verified: user.email_verified,
        phone_verified: user.phone_verified,
    }
}

/// Creates the account and returns its bearer token. Username and email
/// uniqueness is enforced by the store, not a racy pre-check.
pub async fn register(
    ctx: &ApiContext,
    username: &str,
    email: &str,
    phone: Option<&str>,
    password: &str,
) -> Result<String, CoreError> {
    let id = UserId(ctx.sequencer.next_id());
    let token = mint_token(&ctx.token_secret, id)?;
    let password_hash = hash_password(password);

    let inserted = ctx
        .storage
        .insert_user(&NewUser {
            id,
            username,
            email,
            phone: phone.filter(|phone| !phone.is_empty()),
            password_hash: &password_hash,
            token: &token,
        })
        .await?;
    if !inserted {
        return Err(CoreError::IdentityTaken);
    }
    Ok(token)
}

pub async fn login(
    ctx: &ApiContext,
    username: &str,
    password: &str,
) -> Result<StoredUser, CoreError> {
    ctx.storage
        .user_by_credentials(username, &hash_password(password))
        .await?
        .ok_or(CoreError::InvalidCredentials)
}

/// Resolves the current user from a bearer token.
pub async fn authenticate(ctx: &ApiContext, token: &str) -> Result<StoredUser, CoreError> {
    ctx.storage
        .user_by_token(token)
        .await?
        .ok_or(CoreError::Unauthenticated)
}

/// Rotates the user's token, invalidating the previous one.
pub async fn rotate_token(ctx: &ApiContext, user: &StoredUser) -> Result<String, CoreError> {
    let token = mint_token(&ctx.token_secret, user.id)?;
    ctx.storage.set_token(user.id, &token).await?;
    Ok(token)
}

pub async fn user_by_username(ctx: &ApiContext, username: &str) -> Result<StoredUser, CoreError> {
    ctx.storage
        .user_by_username(username)
        .await?
        .ok_or(CoreError::UserNotFound)
}
