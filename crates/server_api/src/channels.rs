use chrono::Utc;
use shared::{
    domain::{ChannelId, MessageId, UserId},
    error::CoreError,
    protocol::{LiveEvent, MessagePayload},
};
use storage::{StoredChannel, StoredMessage};
use tracing::debug;

use crate::{ApiContext, MESSAGE_PAGE_CAP};

#[derive(Debug, Clone)]
pub struct ResolvedChannel {
    pub channel_id: ChannelId,
    pub is_new_channel: bool,
    pub message: Option<MessagePayload>,
}

/// Canonical target set: sorted, deduplicated, creator excluded.
fn normalize_targets(creator_id: UserId, target_ids: &[i64]) -> Vec<UserId> {
    let mut ids: Vec<i64> = target_ids
        .iter()
        .copied()
        .filter(|id| *id != creator_id.0)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids.into_iter().map(UserId).collect()
}

/// Resolves the creator's channel for a target set, creating it if absent,
/// and optionally appends a first message.
///
/// Matching is creator-anchored: the same target set initiated by a
/// different user resolves to a different channel. Concurrent creates for
/// the same identity are settled by the store's uniqueness constraint; the
/// loser of the race re-reads and reuses the winner's channel.
pub async fn resolve_or_create(
    ctx: &ApiContext,
    creator_id: UserId,
    target_ids: &[i64],
    first_message: Option<&str>,
) -> Result<ResolvedChannel, CoreError> {
    let targets = normalize_targets(creator_id, target_ids);
    if targets.is_empty() {
        return Err(CoreError::EmptyParticipants);
    }

    let target_raw: Vec<i64> = targets.iter().map(|id| id.0).collect();
    let found = ctx.storage.users_by_ids(&target_raw).await?;
    if found.len() < targets.len() {
        let missing = target_raw
            .iter()
            .copied()
            .filter(|id| !found.iter().any(|user| user.id.0 == *id))
            .collect();
        return Err(CoreError::UnknownParticipants(missing));
    }
    if found.len() > targets.len() {
        return Err(CoreError::ConsistencyFault);
    }

    let (channel_id, is_new_channel) =
        match ctx.storage.channel_by_identity(creator_id, &targets).await? {
            Some(existing) => (existing.id, false),
            None => {
                let channel = StoredChannel {
                    id: ChannelId(ctx.sequencer.next_id()),
                    creator_id,
                    participant_ids: targets.clone(),
                    created_at: Utc::now(),
                };
                if ctx.storage.insert_channel(&channel).await? {
                    (channel.id, true)
                } else {
                    // Someone else just created it; their row wins.
                    let existing = ctx
                        .storage
                        .channel_by_identity(creator_id, &targets)
                        .await?
                        .ok_or(CoreError::ConsistencyFault)?;
                    debug!(channel_id = existing.id.0, "lost channel-create race, reusing winner");
                    (existing.id, false)
                }
            }
        };

    let message = match first_message {
        Some(content) => Some(append_message(ctx, channel_id, creator_id, content).await?),
        None => None,
    };

    Ok(ResolvedChannel {
        channel_id,
        is_new_channel,
        message,
    })
}

/// Appends one message and pushes it to every connected participant other
/// than the sender. Fanout is best-effort and awaits nothing.
pub async fn append_message(
    ctx: &ApiContext,
    channel_id: ChannelId,
    sender_id: UserId,
    content: &str,
) -> Result<MessagePayload, CoreError> {
    let channel = ctx
        .storage
        .channel_by_id(channel_id)
        .await?
        .ok_or(CoreError::ChannelNotFound)?;

    let message = StoredMessage {
        id: MessageId(ctx.sequencer.next_id()),
        channel_id,
        sender_id,
        content: content.to_string(),
        created_at: Utc::now(),
    };
    if !ctx.storage.append_message(&message).await? {
        return Err(CoreError::ChannelNotFound);
    }

    let payload = MessagePayload {
        id: message.id,
        channel_id,
        sender_id,
        content: message.content,
        created_at: message.created_at,
    };

    let recipients: Vec<UserId> = channel
        .participant_ids
        .iter()
        .copied()
        .chain([channel.creator_id])
        .filter(|id| *id != sender_id)
        .collect();
    ctx.registry
        .fanout(&recipients, &LiveEvent::NewMessage(payload.clone()));

    Ok(payload)
}

/// Messages with `id > after_id`, oldest first, capped at
/// [`MESSAGE_PAGE_CAP`] regardless of the requested limit.
pub async fn list_messages(
    ctx: &ApiContext,
    channel_id: ChannelId,
    after_id: i64,
    limit: Option<u32>,
) -> Result<Vec<MessagePayload>, CoreError> {
    if ctx.storage.channel_by_id(channel_id).await?.is_none() {
        return Err(CoreError::ChannelNotFound);
    }

    let limit = limit.unwrap_or(MESSAGE_PAGE_CAP).min(MESSAGE_PAGE_CAP);
    let messages = ctx
        .storage
        .list_messages_after(channel_id, after_id, limit)
        .await?;

    Ok(messages
        .into_iter()
        .map(|message| MessagePayload {
            id: message.id,
            channel_id: message.channel_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: message.created_at,
        })
        .collect())
}

/// Channel summary without its messages.
pub async fn channel_summary(
    ctx: &ApiContext,
    channel_id: ChannelId,
) -> Result<shared::protocol::ChannelSummary, CoreError> {
    let channel = ctx
        .storage
        .channel_by_id(channel_id)
        .await?
        .ok_or(CoreError::ChannelNotFound)?;
    Ok(shared::protocol::ChannelSummary {
        id: channel.id,
        creator_id: channel.creator_id,
        participant_ids: channel.participant_ids,
        created_at: channel.created_at,
    })
}
