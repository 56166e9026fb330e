pub mod accounts;
pub mod channels;
pub mod listings;
pub mod otp;
pub mod sequencer;

use std::sync::Arc;

use live::LiveRegistry;
use notify::{EmailSender, SmsSender};
use sequencer::MessageSequencer;
use storage::Storage;

pub const DEFAULT_OTP_TIMEOUT_SECS: i64 = 300;

/// Hard cap on a single message-listing page.
pub const MESSAGE_PAGE_CAP: u32 = 50;

/// Everything the coordination operations need, wired once at startup and
/// cloned per request. The registry and senders are injected so tests can
/// observe delivery.
#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub registry: LiveRegistry,
    pub sequencer: Arc<MessageSequencer>,
    pub email: Arc<dyn EmailSender>,
    pub sms: Arc<dyn SmsSender>,
    pub otp_timeout_secs: i64,
    pub token_secret: String,
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
