use std::{net::SocketAddr, sync::Arc};

use live::LiveRegistry;
use notify::{EmailSender, LogOnlyDelivery, SendgridEmail, SmsSender, TwilioSms};
use server_api::{sequencer::MessageSequencer, ApiContext};
use storage::Storage;
use tracing::{error, info};

mod api;
mod config;
mod ws;

use config::{load_settings, prepare_database_url, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;

    let api = ApiContext {
        storage,
        registry: LiveRegistry::new(),
        sequencer: Arc::new(MessageSequencer::new()),
        email: email_sender(&settings),
        sms: sms_sender(&settings),
        otp_timeout_secs: settings.otp_timeout_secs,
        token_secret: settings.token_secret.clone(),
    };

    let app = api::build_router(Arc::new(api::AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn email_sender(settings: &Settings) -> Arc<dyn EmailSender> {
    match (&settings.sendgrid_api_key, &settings.email_from) {
        (Some(api_key), Some(from)) => Arc::new(SendgridEmail::new(api_key.clone(), from.clone())),
        _ => {
            info!("email transport not configured, verification codes will be logged");
            Arc::new(LogOnlyDelivery)
        }
    }
}

fn sms_sender(settings: &Settings) -> Arc<dyn SmsSender> {
    match (
        &settings.twilio_account_sid,
        &settings.twilio_auth_token,
        &settings.twilio_from_number,
    ) {
        (Some(sid), Some(token), Some(from)) => {
            Arc::new(TwilioSms::new(sid.clone(), token.clone(), from.clone()))
        }
        _ => {
            info!("sms transport not configured, verification codes will be logged");
            Arc::new(LogOnlyDelivery)
        }
    }
}
