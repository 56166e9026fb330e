use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

/// Outbound email collaborator. Fire-and-forget from the caller's
/// perspective; a failure here never unwinds the state that triggered it.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Outbound SMS collaborator, same contract as [`EmailSender`].
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<()>;
}

/// SendGrid v3 mail client.
#[derive(Debug, Clone)]
pub struct SendgridEmail {
    http: Client,
    api_key: String,
    from: String,
}

impl SendgridEmail {
    pub fn new(api_key: String, from: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            from,
        }
    }
}

#[async_trait]
impl EmailSender for SendgridEmail {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let payload = json!({
            "personalizations": [{ "to": [{ "email": to }] }],
            "from": { "email": self.from },
            "subject": subject,
            "content": [{ "type": "text/plain", "value": body }],
        });

        let response = self
            .http
            .post("https://api.sendgrid.com/v3/mail/send")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("sendgrid rejected the send ({status}): {detail}");
        }
        Ok(())
    }
}

/// Twilio Messages API client.
#[derive(Debug, Clone)]
pub struct TwilioSms {
    http: Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSms {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            http: Client::new(),
            account_sid,
            auth_token,
            from_number,
        }
    }
}

#[async_trait]
impl SmsSender for TwilioSms {
    async fn send(&self, to: &str, body: &str) -> Result<()> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );

        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("To", to);
        form.insert("From", &self.from_number);
        form.insert("Body", body);

        let response = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("twilio rejected the send ({status}): {detail}");
        }
        Ok(())
    }
}

/// Stand-in used when no transport is configured (local dev, tests): the
/// message is logged instead of delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyDelivery;

#[async_trait]
impl EmailSender for LogOnlyDelivery {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!(%to, %subject, %body, "email transport not configured, logging instead");
        Ok(())
    }
}

#[async_trait]
impl SmsSender for LogOnlyDelivery {
    async fn send(&self, to: &str, body: &str) -> Result<()> {
        info!(%to, %body, "sms transport not configured, logging instead");
        Ok(())
    }
}
