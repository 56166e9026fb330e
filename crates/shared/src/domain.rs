use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(ListingId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Email,
    Phone,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Email => f.write_str("email"),
            CredentialKind::Phone => f.write_str("phone"),
        }
    }
}

/// One issued, not-yet-confirmed verification code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCode {
    /// The address or number the code was delivered to.
    pub destination: String,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub timeout_secs: i64,
}

impl PendingCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > Duration::seconds(self.timeout_secs)
    }
}

/// The single pending-verification record a subject may hold.
///
/// Each credential occupies its own slot; the record exists only while at
/// least one slot is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRecord {
    pub subject: UserId,
    pub email: Option<PendingCode>,
    pub phone: Option<PendingCode>,
}

impl OtpRecord {
    pub fn slot(&self, kind: CredentialKind) -> Option<&PendingCode> {
        match kind {
            CredentialKind::Email => self.email.as_ref(),
            CredentialKind::Phone => self.phone.as_ref(),
        }
    }

    /// Which credentials still await confirmation.
    pub fn pending(&self) -> Vec<CredentialKind> {
        let mut kinds = Vec::new();
        if self.email.is_some() {
            kinds.push(CredentialKind::Email);
        }
        if self.phone.is_some() {
            kinds.push(CredentialKind::Phone);
        }
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(secs_ago: i64, timeout_secs: i64) -> PendingCode {
        PendingCode {
            destination: "a@example.com".into(),
            code: "AB12CD".into(),
            issued_at: Utc::now() - Duration::seconds(secs_ago),
            timeout_secs,
        }
    }

    #[test]
    fn code_expires_strictly_after_timeout() {
        let now = Utc::now();
        let pending = PendingCode {
            issued_at: now - Duration::seconds(300),
            ..slot(0, 300)
        };
        assert!(!pending.is_expired_at(now));
        assert!(pending.is_expired_at(now + Duration::seconds(1)));
    }

    #[test]
    fn pending_reports_each_populated_slot() {
        let record = OtpRecord {
            subject: UserId(1),
            email: Some(slot(10, 300)),
            phone: None,
        };
        assert_eq!(record.pending(), vec![CredentialKind::Email]);
        assert!(!record.is_empty());

        let empty = OtpRecord {
            subject: UserId(1),
            email: None,
            phone: None,
        };
        assert!(empty.is_empty());
    }
}
