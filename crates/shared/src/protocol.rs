use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelId, ListingId, MessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

/// Public projection of a user; never carries the credential hash or token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub email_verified: bool,
    pub phone_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPhoneVerificationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishVerificationRequest {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCodeResponse {
    pub code: String,
    pub timeout_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub target_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<NewMessageRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub channel_id: ChannelId,
    pub is_new_channel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub creator_id: UserId,
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreatedResponse {
    pub id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateListingRequest {
    pub title: String,
    pub description: String,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPayload {
    pub id: ListingId,
    pub creator_id: UserId,
    pub title: String,
    pub description: String,
    pub price: i64,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

/// Frames a client may send over the live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LiveRequest {
    Login { username: String, password: String },
}

/// Frames the server pushes over the live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Login handshake accepted; the session is registered for delivery.
    Ready { user: UserProfile },
    NewMessage(MessagePayload),
    Error(ApiError),
}
