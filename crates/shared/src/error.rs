use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::CredentialKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Unauthorized,
    Conflict,
    NotFound,
    Consistency,
    Internal,
}

/// Wire shape of every user-facing failure: a stable code plus a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failures raised by the coordination core. Every variant is a distinct
/// signal; callers match on the variant, clients on the derived `ErrorCode`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0} is already verified")]
    AlreadyVerified(CredentialKind),
    #[error("no phone number on file")]
    NoPhoneOnFile,
    #[error("no verification in progress")]
    NoOtpFound,
    #[error("no pending {0} code")]
    WrongVariant(CredentialKind),
    #[error("submitted code does not match")]
    InvalidCode,
    #[error("code expired")]
    Expired,
    #[error("a channel needs at least one participant besides the creator")]
    EmptyParticipants,
    #[error("unknown participants: {0:?}")]
    UnknownParticipants(Vec<i64>),
    #[error("channel not found")]
    ChannelNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("listing not found")]
    ListingNotFound,
    #[error("username or email already in use")]
    IdentityTaken,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("missing or invalid token")]
    Unauthenticated,
    #[error("email verification required")]
    EmailNotVerified,
    #[error("store returned more rows than requested")]
    ConsistencyFault,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::AlreadyVerified(_)
            | CoreError::NoOtpFound
            | CoreError::WrongVariant(_)
            | CoreError::InvalidCode
            | CoreError::Expired
            | CoreError::IdentityTaken => ErrorCode::Conflict,
            CoreError::NoPhoneOnFile
            | CoreError::EmptyParticipants
            | CoreError::UnknownParticipants(_) => ErrorCode::Validation,
            CoreError::ChannelNotFound | CoreError::UserNotFound | CoreError::ListingNotFound => {
                ErrorCode::NotFound
            }
            CoreError::InvalidCredentials
            | CoreError::Unauthenticated
            | CoreError::EmailNotVerified => ErrorCode::Unauthorized,
            CoreError::ConsistencyFault => ErrorCode::Consistency,
            CoreError::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl From<&CoreError> for ApiError {
    fn from(err: &CoreError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}
