use super::*;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ChannelId, CredentialKind, PendingCode, UserId},
    error::CoreError,
    protocol::LiveEvent,
};
use storage::NewUser;
use tokio::sync::mpsc;

use crate::{accounts, channels, listings, otp};

#[derive(Default)]
struct RecordingDelivery {
    emails: Mutex<Vec<(String, String)>>,
    texts: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl notify::EmailSender for RecordingDelivery {
    async fn send(&self, to: &str, _subject: &str, body: &str) -> anyhow::Result<()> {
        self.emails
            .lock()
            .expect("lock")
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

#[async_trait]
impl notify::SmsSender for RecordingDelivery {
    async fn send(&self, to: &str, body: &str) -> anyhow::Result<()> {
        self.texts
            .lock()
            .expect("lock")
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

async fn test_ctx() -> (ApiContext, Arc<RecordingDelivery>) {
    let delivery = Arc::new(RecordingDelivery::default());
    let ctx = ApiContext {
        storage: storage::Storage::new("sqlite::memory:").await.expect("db"),
        registry: LiveRegistry::new(),
        sequencer: Arc::new(MessageSequencer::new()),
        email: delivery.clone(),
        sms: delivery.clone(),
        otp_timeout_secs: DEFAULT_OTP_TIMEOUT_SECS,
        token_secret: "test-secret".into(),
    };
    (ctx, delivery)
}

async fn seed_user(
    ctx: &ApiContext,
    id: i64,
    username: &str,
    phone: Option<&str>,
) -> storage::StoredUser {
    let email = format!("{username}@example.com");
    let token = format!("tok-{id}");
    let inserted = ctx
        .storage
        .insert_user(&NewUser {
            id: UserId(id),
            username,
            email: &email,
            phone,
            password_hash: "hash",
            token: &token,
        })
        .await
        .expect("insert user");
    assert!(inserted);
    ctx.storage
        .user_by_id(UserId(id))
        .await
        .expect("query")
        .expect("user")
}

#[tokio::test]
async fn email_start_issues_a_six_char_uppercase_code() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let issued = otp::start_email_verification(&ctx, &alice)
        .await
        .expect("start");
    assert_eq!(issued.code.len(), 6);
    assert!(issued
        .code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    assert_eq!(issued.timeout_secs, DEFAULT_OTP_TIMEOUT_SECS);

    let record = ctx
        .storage
        .otp_record(alice.id)
        .await
        .expect("query")
        .expect("record");
    let slot = record.email.expect("email slot");
    assert_eq!(slot.code, issued.code);
    assert_eq!(slot.destination, "alice@example.com");
}

#[tokio::test]
async fn email_start_rejects_an_already_verified_address() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    ctx.storage
        .set_credential_verified(alice.id, CredentialKind::Email)
        .await
        .expect("flag");
    let alice = ctx
        .storage
        .user_by_id(alice.id)
        .await
        .expect("query")
        .expect("user");

    let err = otp::start_email_verification(&ctx, &alice)
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::AlreadyVerified(CredentialKind::Email)));
}

#[tokio::test]
async fn email_code_is_delivered_to_the_address() {
    let (ctx, delivery) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let issued = otp::start_email_verification(&ctx, &alice)
        .await
        .expect("start");

    // Delivery is spawned; give it a moment.
    for _ in 0..100 {
        if !delivery.emails.lock().expect("lock").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let emails = delivery.emails.lock().expect("lock");
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].0, "alice@example.com");
    assert!(emails[0].1.contains(&issued.code));
}

#[tokio::test]
async fn phone_start_requires_a_number() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let err = otp::start_phone_verification(&ctx, &alice, None)
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::NoPhoneOnFile));
}

#[tokio::test]
async fn phone_override_updates_the_stored_number_first() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", Some("+15550001111")).await;

    otp::start_phone_verification(&ctx, &alice, Some("+15559992222"))
        .await
        .expect("start");

    let reloaded = ctx
        .storage
        .user_by_id(alice.id)
        .await
        .expect("query")
        .expect("user");
    assert_eq!(reloaded.phone.as_deref(), Some("+15559992222"));

    let record = ctx
        .storage
        .otp_record(alice.id)
        .await
        .expect("query")
        .expect("record");
    assert_eq!(
        record.phone.expect("phone slot").destination,
        "+15559992222"
    );
}

#[tokio::test]
async fn email_and_phone_verifications_are_independent() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", Some("+15550001111")).await;

    let email_code = otp::start_email_verification(&ctx, &alice)
        .await
        .expect("email start");
    let phone_code = otp::start_phone_verification(&ctx, &alice, None)
        .await
        .expect("phone start");

    otp::finish_verification(&ctx, &alice, &email_code.code, CredentialKind::Email)
        .await
        .expect("email finish");

    let reloaded = ctx
        .storage
        .user_by_id(alice.id)
        .await
        .expect("query")
        .expect("user");
    assert!(reloaded.email_verified);
    assert!(!reloaded.phone_verified);

    // The phone code survives the email cleanup and still checks out.
    let record = ctx
        .storage
        .otp_record(alice.id)
        .await
        .expect("query")
        .expect("record");
    assert!(record.email.is_none());
    assert_eq!(record.pending(), vec![CredentialKind::Phone]);

    otp::finish_verification(&ctx, &alice, &phone_code.code, CredentialKind::Phone)
        .await
        .expect("phone finish");
    assert!(ctx
        .storage
        .otp_record(alice.id)
        .await
        .expect("query")
        .is_none());
}

#[tokio::test]
async fn finish_without_a_record_is_rejected() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let err = otp::finish_verification(&ctx, &alice, "AB12CD", CredentialKind::Email)
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::NoOtpFound));
}

#[tokio::test]
async fn finish_for_the_wrong_credential_is_rejected() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    otp::start_email_verification(&ctx, &alice)
        .await
        .expect("start");

    let err = otp::finish_verification(&ctx, &alice, "AB12CD", CredentialKind::Phone)
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::WrongVariant(CredentialKind::Phone)));
}

#[tokio::test]
async fn mismatched_code_is_rejected_before_expiry_is_checked() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    otp::start_email_verification(&ctx, &alice)
        .await
        .expect("start");

    let err = otp::finish_verification(&ctx, &alice, "WRONG1", CredentialKind::Email)
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::InvalidCode));
}

#[tokio::test]
async fn expiry_boundary_is_strict() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    // One second past the window: rejected, record kept.
    ctx.storage
        .upsert_otp_slot(
            alice.id,
            CredentialKind::Email,
            &PendingCode {
                destination: alice.email.clone(),
                code: "AB12CD".into(),
                issued_at: Utc::now() - chrono::Duration::seconds(301),
                timeout_secs: 300,
            },
        )
        .await
        .expect("upsert");

    let err = otp::finish_verification(&ctx, &alice, "AB12CD", CredentialKind::Email)
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::Expired));
    assert!(ctx
        .storage
        .otp_record(alice.id)
        .await
        .expect("query")
        .is_some());

    // One second inside the window: accepted.
    ctx.storage
        .upsert_otp_slot(
            alice.id,
            CredentialKind::Email,
            &PendingCode {
                destination: alice.email.clone(),
                code: "AB12CD".into(),
                issued_at: Utc::now() - chrono::Duration::seconds(299),
                timeout_secs: 300,
            },
        )
        .await
        .expect("upsert");

    otp::finish_verification(&ctx, &alice, "AB12CD", CredentialKind::Email)
        .await
        .expect("finish");
}

#[tokio::test]
async fn fresh_start_overwrites_an_expired_code() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    ctx.storage
        .upsert_otp_slot(
            alice.id,
            CredentialKind::Email,
            &PendingCode {
                destination: alice.email.clone(),
                code: "STALE0".into(),
                issued_at: Utc::now() - chrono::Duration::seconds(1_000),
                timeout_secs: 300,
            },
        )
        .await
        .expect("upsert");

    let issued = otp::start_email_verification(&ctx, &alice)
        .await
        .expect("restart");
    otp::finish_verification(&ctx, &alice, &issued.code, CredentialKind::Email)
        .await
        .expect("finish");
}

#[tokio::test]
async fn resolving_twice_reuses_the_channel() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    let bob = seed_user(&ctx, 20, "bob", None).await;

    let first = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], Some("hi"))
        .await
        .expect("first resolve");
    assert!(first.is_new_channel);

    let second = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], None)
        .await
        .expect("second resolve");
    assert!(!second.is_new_channel);
    assert_eq!(second.channel_id, first.channel_id);
}

#[tokio::test]
async fn channel_matching_is_creator_anchored() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    let bob = seed_user(&ctx, 20, "bob", None).await;

    let by_alice = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], None)
        .await
        .expect("alice resolve");
    let by_bob = channels::resolve_or_create(&ctx, bob.id, &[alice.id.0], None)
        .await
        .expect("bob resolve");

    assert!(by_bob.is_new_channel);
    assert_ne!(by_alice.channel_id, by_bob.channel_id);
}

#[tokio::test]
async fn target_sets_are_normalized_before_matching() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    let bob = seed_user(&ctx, 20, "bob", None).await;
    let carol = seed_user(&ctx, 30, "carol", None).await;

    let messy = channels::resolve_or_create(
        &ctx,
        alice.id,
        &[carol.id.0, bob.id.0, bob.id.0, alice.id.0],
        None,
    )
    .await
    .expect("messy resolve");
    let clean = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0, carol.id.0], None)
        .await
        .expect("clean resolve");

    assert!(!clean.is_new_channel);
    assert_eq!(clean.channel_id, messy.channel_id);
}

#[tokio::test]
async fn unknown_targets_are_listed_in_the_error() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let err = channels::resolve_or_create(&ctx, alice.id, &[777, 888], None)
        .await
        .expect_err("should fail");
    let CoreError::UnknownParticipants(mut missing) = err else {
        panic!("expected unknown participants, got {err}");
    };
    missing.sort_unstable();
    assert_eq!(missing, vec![777, 888]);
}

#[tokio::test]
async fn a_channel_needs_someone_to_talk_to() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let err = channels::resolve_or_create(&ctx, alice.id, &[alice.id.0], None)
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::EmptyParticipants));
}

#[tokio::test]
async fn appended_messages_keep_their_order() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    let bob = seed_user(&ctx, 20, "bob", None).await;

    let resolved = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], None)
        .await
        .expect("resolve");
    let first = channels::append_message(&ctx, resolved.channel_id, alice.id, "hi")
        .await
        .expect("first");
    let second = channels::append_message(&ctx, resolved.channel_id, alice.id, "there")
        .await
        .expect("second");
    assert!(first.id.0 <= second.id.0);

    let listed = channels::list_messages(&ctx, resolved.channel_id, 0, Some(50))
        .await
        .expect("list");
    assert_eq!(
        listed.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["hi", "there"]
    );
}

#[tokio::test]
async fn listing_page_is_hard_capped() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    let bob = seed_user(&ctx, 20, "bob", None).await;

    let resolved = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], None)
        .await
        .expect("resolve");
    for i in 0..60 {
        channels::append_message(&ctx, resolved.channel_id, alice.id, &format!("m{i}"))
            .await
            .expect("append");
    }

    let page = channels::list_messages(&ctx, resolved.channel_id, 0, Some(1_000))
        .await
        .expect("list");
    assert_eq!(page.len(), MESSAGE_PAGE_CAP as usize);
}

#[tokio::test]
async fn append_to_a_missing_channel_fails() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let err = channels::append_message(&ctx, ChannelId(12345), alice.id, "hi")
        .await
        .expect_err("should fail");
    assert!(matches!(err, CoreError::ChannelNotFound));
}

#[tokio::test]
async fn fanout_reaches_connected_participants_but_not_the_sender() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    let bob = seed_user(&ctx, 20, "bob", None).await;

    let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
    let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
    let _bob_session = ctx.registry.register(bob.id, bob_tx);
    let _alice_session = ctx.registry.register(alice.id, alice_tx);

    let resolved = channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], Some("hi"))
        .await
        .expect("resolve");

    let frame = bob_rx.try_recv().expect("bob gets a push");
    let event: LiveEvent = serde_json::from_str(&frame).expect("envelope");
    let LiveEvent::NewMessage(message) = event else {
        panic!("expected a new_message envelope");
    };
    assert_eq!(message.channel_id, resolved.channel_id);
    assert_eq!(message.content, "hi");
    assert!(bob_rx.try_recv().is_err(), "exactly one push per message");
    assert!(alice_rx.try_recv().is_err(), "sender is not fanned out to");

    // Replies push back to the creator.
    channels::append_message(&ctx, resolved.channel_id, bob.id, "hello")
        .await
        .expect("reply");
    assert!(alice_rx.try_recv().is_ok());
    assert!(bob_rx.try_recv().is_err());
}

#[tokio::test]
async fn fanout_to_offline_participants_is_silent() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;
    let bob = seed_user(&ctx, 20, "bob", None).await;

    channels::resolve_or_create(&ctx, alice.id, &[bob.id.0], Some("hi"))
        .await
        .expect("resolve succeeds with nobody connected");
}

#[tokio::test]
async fn register_login_and_token_rotation() {
    let (ctx, _) = test_ctx().await;

    let token = accounts::register(&ctx, "alice", "alice@example.com", None, "hunter2")
        .await
        .expect("register");
    let user = accounts::authenticate(&ctx, &token).await.expect("auth");
    assert_eq!(user.username, "alice");
    assert!(!user.email_verified);

    let err = accounts::register(&ctx, "alice", "other@example.com", None, "pw")
        .await
        .expect_err("duplicate username");
    assert!(matches!(err, CoreError::IdentityTaken));

    let err = accounts::login(&ctx, "alice", "wrong")
        .await
        .expect_err("bad password");
    assert!(matches!(err, CoreError::InvalidCredentials));

    let logged_in = accounts::login(&ctx, "alice", "hunter2").await.expect("login");
    assert_eq!(logged_in.id, user.id);

    let rotated = accounts::rotate_token(&ctx, &user).await.expect("rotate");
    assert_ne!(rotated, token);
    let err = accounts::authenticate(&ctx, &token)
        .await
        .expect_err("old token dead");
    assert!(matches!(err, CoreError::Unauthenticated));
    accounts::authenticate(&ctx, &rotated)
        .await
        .expect("new token works");
}

#[tokio::test]
async fn listings_are_keyed_reads_and_writes() {
    let (ctx, _) = test_ctx().await;
    let alice = seed_user(&ctx, 10, "alice", None).await;

    let created = listings::create_listing(
        &ctx,
        alice.id,
        &shared::protocol::CreateListingRequest {
            title: "city bike".into(),
            description: "three gears".into(),
            price: 120,
        },
        "203.0.113.9",
    )
    .await
    .expect("create");

    let loaded = listings::listing(&ctx, created.id).await.expect("load");
    assert_eq!(loaded.title, "city bike");
    assert_eq!(loaded.location, "203.0.113.9");

    let mine = listings::listings_for_user(&ctx, alice.id)
        .await
        .expect("list");
    assert_eq!(mine.len(), 1);

    let err = listings::listing(&ctx, shared::domain::ListingId(1))
        .await
        .expect_err("missing listing");
    assert!(matches!(err, CoreError::ListingNotFound));
}
