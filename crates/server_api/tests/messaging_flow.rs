//! End-to-end run of the verification + messaging flow against in-memory
//! storage: verify an email, open a channel, exchange messages, and watch
//! the live pushes arrive in order.

use std::sync::Arc;

use live::LiveRegistry;
use notify::LogOnlyDelivery;
use server_api::{
    accounts, channels, otp, sequencer::MessageSequencer, ApiContext, DEFAULT_OTP_TIMEOUT_SECS,
};
use shared::{
    domain::CredentialKind,
    protocol::LiveEvent,
};
use storage::Storage;
use tokio::sync::mpsc;

async fn test_ctx() -> ApiContext {
    ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
        registry: LiveRegistry::new(),
        sequencer: Arc::new(MessageSequencer::new()),
        email: Arc::new(LogOnlyDelivery),
        sms: Arc::new(LogOnlyDelivery),
        otp_timeout_secs: DEFAULT_OTP_TIMEOUT_SECS,
        token_secret: "test-secret".into(),
    }
}

#[tokio::test]
async fn verify_then_message_with_live_delivery() {
    let ctx = test_ctx().await;

    let alice_token = accounts::register(&ctx, "alice", "alice@example.com", None, "pw-a")
        .await
        .expect("register alice");
    accounts::register(&ctx, "bob", "bob@example.com", None, "pw-b")
        .await
        .expect("register bob");

    let alice = accounts::authenticate(&ctx, &alice_token)
        .await
        .expect("alice");
    let bob = accounts::user_by_username(&ctx, "bob").await.expect("bob");

    // Alice proves control of her email with the issued code.
    let issued = otp::start_email_verification(&ctx, &alice)
        .await
        .expect("start");
    assert_eq!(issued.timeout_secs, 300);
    otp::finish_verification(&ctx, &alice, &issued.code, CredentialKind::Email)
        .await
        .expect("finish");

    let alice = accounts::authenticate(&ctx, &alice_token)
        .await
        .expect("reload alice");
    assert!(alice.email_verified);
    assert!(
        ctx.storage
            .otp_record(alice.id)
            .await
            .expect("query")
            .is_none(),
        "no phone pending, so the record is gone"
    );

    // Bob is connected live before the conversation starts.
    let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
    let _bob_session = ctx.registry.register(bob.id, bob_tx);

    let opened = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], Some("hi"))
        .await
        .expect("open channel");
    assert!(opened.is_new_channel);
    let first = opened.message.expect("first message");

    let second = channels::append_message(&ctx, opened.channel_id, alice.id, "there")
        .await
        .expect("second message");
    assert!(second.id.0 >= first.id.0);

    // Bob saw both pushes, in order.
    let mut contents = Vec::new();
    while let Ok(frame) = bob_rx.try_recv() {
        let event: LiveEvent = serde_json::from_str(&frame).expect("envelope");
        let LiveEvent::NewMessage(message) = event else {
            panic!("expected new_message");
        };
        assert_eq!(message.channel_id, opened.channel_id);
        contents.push(message.content);
    }
    assert_eq!(contents, vec!["hi", "there"]);

    // History pages match what was delivered.
    let history = channels::list_messages(&ctx, opened.channel_id, 0, None)
        .await
        .expect("history");
    assert_eq!(
        history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["hi", "there"]
    );

    let after_first = channels::list_messages(&ctx, opened.channel_id, first.id.0, None)
        .await
        .expect("after cursor");
    assert_eq!(
        after_first.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["there"]
    );
}
