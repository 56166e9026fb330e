use std::{collections::HashMap, fs};

use server_api::DEFAULT_OTP_TIMEOUT_SECS;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub token_secret: String,
    pub otp_timeout_secs: i64,
    pub sendgrid_api_key: Option<String>,
    pub email_from: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/server.db".into(),
            token_secret: "devsecret".into(),
            otp_timeout_secs: DEFAULT_OTP_TIMEOUT_SECS,
            sendgrid_api_key: None,
            email_from: None,
            twilio_account_sid: None,
            twilio_auth_token: None,
            twilio_from_number: None,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_overrides(&mut settings, &file_cfg);
        }
    }

    let env_cfg: HashMap<String, String> = [
        "bind_addr",
        "database_url",
        "token_secret",
        "otp_timeout_secs",
        "sendgrid_api_key",
        "email_from",
        "twilio_account_sid",
        "twilio_auth_token",
        "twilio_from_number",
    ]
    .iter()
    .filter_map(|key| {
        std::env::var(key.to_uppercase())
            .ok()
            .map(|value| (key.to_string(), value))
    })
    .collect();
    apply_overrides(&mut settings, &env_cfg);

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }

    settings
}

fn apply_overrides(settings: &mut Settings, cfg: &HashMap<String, String>) {
    if let Some(v) = cfg.get("bind_addr") {
        settings.server_bind = v.clone();
    }
    if let Some(v) = cfg.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = cfg.get("token_secret") {
        settings.token_secret = v.clone();
    }
    if let Some(v) = cfg.get("otp_timeout_secs") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.otp_timeout_secs = parsed;
        }
    }
    if let Some(v) = cfg.get("sendgrid_api_key") {
        settings.sendgrid_api_key = Some(v.clone());
    }
    if let Some(v) = cfg.get("email_from") {
        settings.email_from = Some(v.clone());
    }
    if let Some(v) = cfg.get("twilio_account_sid") {
        settings.twilio_account_sid = Some(v.clone());
    }
    if let Some(v) = cfg.get("twilio_auth_token") {
        settings.twilio_auth_token = Some(v.clone());
    }
    if let Some(v) = cfg.get("twilio_from_number") {
        settings.twilio_from_number = Some(v.clone());
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
