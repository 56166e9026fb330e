use chrono::Utc;
use rand::Rng;
use shared::{
    domain::{CredentialKind, PendingCode},
    error::CoreError,
};
use storage::StoredUser;
use tracing::warn;

use crate::ApiContext;

const CODE_LEN: usize = 6;
const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub timeout_secs: i64,
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

/// Issues an email code and upserts the subject's email slot. An in-flight
/// phone verification on the same record is preserved; a prior email code,
/// expired or not, is overwritten.
pub async fn start_email_verification(
    ctx: &ApiContext,
    user: &StoredUser,
) -> Result<IssuedCode, CoreError> {
    if user.email_verified {
        return Err(CoreError::AlreadyVerified(CredentialKind::Email));
    }

    let slot = PendingCode {
        destination: user.email.clone(),
        code: generate_code(),
        issued_at: Utc::now(),
        timeout_secs: ctx.otp_timeout_secs,
    };
    ctx.storage
        .upsert_otp_slot(user.id, CredentialKind::Email, &slot)
        .await?;

    // Delivery is fire-and-forget: a failed send is logged and never
    // unwinds the record write.
    let email = ctx.email.clone();
    let to = user.email.clone();
    let body = format!("Your email verification code is: {}", slot.code);
    tokio::spawn(async move {
        if let Err(err) = email.send(&to, "Email verification", &body).await {
            warn!(%to, %err, "email code delivery failed");
        }
    });

    Ok(IssuedCode {
        code: slot.code,
        timeout_secs: slot.timeout_secs,
    })
}

/// Issues a phone code, updating the stored phone first when an override is
/// supplied. Upsert semantics mirror the email case.
pub async fn start_phone_verification(
    ctx: &ApiContext,
    user: &StoredUser,
    phone_override: Option<&str>,
) -> Result<IssuedCode, CoreError> {
    let phone = phone_override
        .map(str::to_string)
        .or_else(|| user.phone.clone())
        .filter(|phone| !phone.is_empty());
    let Some(phone) = phone else {
        return Err(CoreError::NoPhoneOnFile);
    };

    if user.phone_verified {
        return Err(CoreError::AlreadyVerified(CredentialKind::Phone));
    }

    if user.phone.as_deref() != Some(phone.as_str()) {
        ctx.storage.set_phone(user.id, &phone).await?;
    }

    let slot = PendingCode {
        destination: phone.clone(),
        code: generate_code(),
        issued_at: Utc::now(),
        timeout_secs: ctx.otp_timeout_secs,
    };
    ctx.storage
        .upsert_otp_slot(user.id, CredentialKind::Phone, &slot)
        .await?;

    let sms = ctx.sms.clone();
    let body = format!("Your phone verification code is: {}", slot.code);
    tokio::spawn(async move {
        if let Err(err) = sms.send(&phone, &body).await {
            warn!(%phone, %err, "phone code delivery failed");
        }
    });

    Ok(IssuedCode {
        code: slot.code,
        timeout_secs: slot.timeout_secs,
    })
}

/// Checks a submitted code against the pending slot for `kind`, re-reading
/// the record at check time. On success the verified flag is set and the
/// slot cleared; both writes are best-effort after the success decision.
pub async fn finish_verification(
    ctx: &ApiContext,
    user: &StoredUser,
    submitted: &str,
    kind: CredentialKind,
) -> Result<(), CoreError> {
    let record = ctx
        .storage
        .otp_record(user.id)
        .await?
        .ok_or(CoreError::NoOtpFound)?;
    let slot = record.slot(kind).ok_or(CoreError::WrongVariant(kind))?;

    if slot.code != submitted {
        return Err(CoreError::InvalidCode);
    }
    // An expired slot stays in place; the next start call overwrites it.
    if slot.is_expired_at(Utc::now()) {
        return Err(CoreError::Expired);
    }

    if let Err(err) = ctx.storage.set_credential_verified(user.id, kind).await {
        warn!(user_id = user.id.0, %kind, %err, "verified-flag write failed after accepting code");
    }
    if let Err(err) = ctx.storage.clear_otp_slot(user.id, kind).await {
        warn!(user_id = user.id.0, %kind, %err, "otp slot cleanup failed after accepting code");
    }

    Ok(())
}
