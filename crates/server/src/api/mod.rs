use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{accounts, channels, listings, otp, ApiContext};
use shared::{
    domain::{ChannelId, CredentialKind, ListingId},
    error::{ApiError, CoreError, ErrorCode},
    protocol::{
        AuthResponse, ChannelSummary, CreateListingRequest, FinishVerificationRequest,
        IssuedCodeResponse, ListingPayload, LoginRequest, MessageCreatedResponse, MessagePayload,
        NewMessageRequest, OpenChannelRequest, OpenChannelResponse, RegisterRequest,
        StartPhoneVerificationRequest, UserProfile, UserSummary,
    },
};
use storage::StoredUser;
use tracing::error;

pub struct AppState {
    pub api: ApiContext,
}

type Rejection = (StatusCode, Json<ApiError>);

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/me/listings", get(my_listings))
        .route("/users/:username", get(user_by_username))
        .route("/users/:username/listings", get(user_listings))
        .route("/verify/email/start", post(start_email_verification))
        .route("/verify/email/finish", post(finish_email_verification))
        .route("/verify/phone/start", post(start_phone_verification))
        .route("/verify/phone/finish", post(finish_phone_verification))
        .route("/channels", post(open_channel))
        .route("/channels/:channel_id", get(channel_summary))
        .route(
            "/channels/:channel_id/messages",
            get(channel_messages).post(post_message),
        )
        .route("/listings", post(create_listing))
        .route("/listings/:listing_id", get(listing_by_id))
        .route("/ws", get(crate::ws::ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn reject(err: CoreError) -> Rejection {
    let status = match err.code() {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        // A cardinality anomaly in the store is not an ordinary not-found.
        ErrorCode::Consistency => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if matches!(err.code(), ErrorCode::Consistency | ErrorCode::Internal) {
        error!(%err, "request failed on a store anomaly");
    }
    (status, Json(ApiError::from(&err)))
}

fn invalid(message: &str) -> Rejection {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<StoredUser, Rejection> {
    let Some(token) = bearer_token(headers) else {
        return Err(reject(CoreError::Unauthenticated));
    };
    accounts::authenticate(&state.api, token).await.map_err(reject)
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), Rejection> {
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(invalid("username and password are required"));
    }
    if !req.email.contains('@') {
        return Err(invalid("a valid email address is required"));
    }

    let token = accounts::register(
        &state.api,
        req.username.trim(),
        &req.email,
        req.phone.as_deref(),
        &req.password,
    )
    .await
    .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token })))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, Rejection> {
    let user = accounts::login(&state.api, &req.username, &req.password)
        .await
        .map_err(reject)?;
    Ok(Json(AuthResponse { token: user.token }))
}

/// Rotates the caller's token; the presented token stops working.
async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, Rejection> {
    let user = require_user(&state, &headers).await?;
    accounts::rotate_token(&state.api, &user)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, Rejection> {
    let user = require_user(&state, &headers).await?;
    Ok(Json(accounts::profile(&user)))
}

async fn user_by_username(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<Json<UserSummary>, Rejection> {
    require_user(&state, &headers).await?;
    let user = accounts::user_by_username(&state.api, &username)
        .await
        .map_err(reject)?;
    Ok(Json(UserSummary {
        id: user.id,
        username: user.username,
    }))
}

async fn start_email_verification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<IssuedCodeResponse>, Rejection> {
    let user = require_user(&state, &headers).await?;
    let issued = otp::start_email_verification(&state.api, &user)
        .await
        .map_err(reject)?;
    Ok(Json(IssuedCodeResponse {
        code: issued.code,
        timeout_secs: issued.timeout_secs,
    }))
}

async fn finish_email_verification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FinishVerificationRequest>,
) -> Result<StatusCode, Rejection> {
    let user = require_user(&state, &headers).await?;
    otp::finish_verification(&state.api, &user, &req.code, CredentialKind::Email)
        .await
        .map_err(reject)?;
    Ok(StatusCode::OK)
}

async fn start_phone_verification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartPhoneVerificationRequest>,
) -> Result<Json<IssuedCodeResponse>, Rejection> {
    let user = require_user(&state, &headers).await?;
    let issued = otp::start_phone_verification(&state.api, &user, req.phone.as_deref())
        .await
        .map_err(reject)?;
    Ok(Json(IssuedCodeResponse {
        code: issued.code,
        timeout_secs: issued.timeout_secs,
    }))
}

async fn finish_phone_verification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FinishVerificationRequest>,
) -> Result<StatusCode, Rejection> {
    let user = require_user(&state, &headers).await?;
    otp::finish_verification(&state.api, &user, &req.code, CredentialKind::Phone)
        .await
        .map_err(reject)?;
    Ok(StatusCode::OK)
}

/// Resolve-or-create a conversation; only verified senders may initiate.
async fn open_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OpenChannelRequest>,
) -> Result<(StatusCode, Json<OpenChannelResponse>), Rejection> {
    let user = require_user(&state, &headers).await?;
    if !user.email_verified {
        return Err(reject(CoreError::EmailNotVerified));
    }

    let resolved = channels::resolve_or_create(
        &state.api,
        user.id,
        &req.target_ids,
        req.message.as_ref().map(|m| m.content.as_str()),
    )
    .await
    .map_err(reject)?;

    Ok((
        StatusCode::CREATED,
        Json(OpenChannelResponse {
            channel_id: resolved.channel_id,
            is_new_channel: resolved.is_new_channel,
            message_id: resolved.message.map(|m| m.id),
        }),
    ))
}

async fn channel_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(channel_id): Path<i64>,
) -> Result<Json<ChannelSummary>, Rejection> {
    require_user(&state, &headers).await?;
    let summary = channels::channel_summary(&state.api, ChannelId(channel_id))
        .await
        .map_err(reject)?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    after: Option<i64>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn channel_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(channel_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, Rejection> {
    require_user(&state, &headers).await?;
    let messages = channels::list_messages(
        &state.api,
        ChannelId(channel_id),
        query.after.unwrap_or(0),
        query.limit,
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(channel_id): Path<i64>,
    Json(req): Json<NewMessageRequest>,
) -> Result<(StatusCode, Json<MessageCreatedResponse>), Rejection> {
    let user = require_user(&state, &headers).await?;
    let message = channels::append_message(&state.api, ChannelId(channel_id), user.id, &req.content)
        .await
        .map_err(reject)?;
    Ok((
        StatusCode::CREATED,
        Json(MessageCreatedResponse { id: message.id }),
    ))
}

fn client_location(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn create_listing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateListingRequest>,
) -> Result<(StatusCode, Json<ListingPayload>), Rejection> {
    let user = require_user(&state, &headers).await?;
    if req.title.trim().is_empty() {
        return Err(invalid("a listing needs a title"));
    }
    let listing = listings::create_listing(&state.api, user.id, &req, &client_location(&headers))
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(listing)))
}

/// Listings are public reads; no token required.
async fn listing_by_id(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<i64>,
) -> Result<Json<ListingPayload>, Rejection> {
    let listing = listings::listing(&state.api, ListingId(listing_id))
        .await
        .map_err(reject)?;
    Ok(Json(listing))
}

async fn my_listings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ListingPayload>>, Rejection> {
    let user = require_user(&state, &headers).await?;
    let listings = listings::listings_for_user(&state.api, user.id)
        .await
        .map_err(reject)?;
    Ok(Json(listings))
}

async fn user_listings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<Json<Vec<ListingPayload>>, Rejection> {
    require_user(&state, &headers).await?;
    let user = accounts::user_by_username(&state.api, &username)
        .await
        .map_err(reject)?;
    let listings = listings::listings_for_user(&state.api, user.id)
        .await
        .map_err(reject)?;
    Ok(Json(listings))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
