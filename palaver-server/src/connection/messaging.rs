//! Channel messaging: persist-then-fanout sends and history pulls.

use std::sync::Arc;

use chrono::Utc;

use crate::error::OpError;
use crate::events::{ServerEvent, WireMessage};
use crate::router;
use crate::server::SharedState;

/// Free-text message to a channel. The row is persisted first (dedup-aware
/// when a token is supplied), then fanned out; retries with the same token
/// re-broadcast the original row instead of storing a duplicate.
pub(super) fn handle_text(
    state: &Arc<SharedState>,
    session_id: &str,
    content: &str,
    channel: Option<&str>,
    dedup_token: Option<&str>,
) -> Result<(), OpError> {
    if content.trim().is_empty() {
        return Err(OpError::validation("Message cannot be empty"));
    }
    let channel = channel.unwrap_or(&state.config.default_channel).to_string();
    let nickname = state
        .registry
        .lock()
        .name_for(session_id)
        .map(str::to_string)
        .ok_or_else(|| OpError::validation("You must set a nickname with /nick first"))?;

    if !state.is_bound(&channel, session_id) {
        return Err(OpError::validation("You must join the channel first"));
    }

    let row = state
        .with_db(|db| {
            db.append_message(
                &channel,
                &nickname,
                None,
                content,
                Utc::now().timestamp_millis(),
                dedup_token,
            )
        })
        .map_err(|e| OpError::persistence("save message", e))?;

    router::broadcast(
        state,
        &channel,
        ServerEvent::NewMessage {
            id: row.id,
            content: row.content,
            nickname: row.sender,
            channel: row.channel,
            created_at: row.created_at,
        },
    );
    Ok(())
}

/// Replay a channel's history to the caller. With a cursor, only messages
/// strictly after it are returned (reconnect catch-up); without one, the
/// configured replay window applies.
pub(super) fn handle_messages(
    state: &Arc<SharedState>,
    session_id: &str,
    channel: &str,
    after_id: Option<i64>,
) -> Result<(), OpError> {
    if channel.trim().is_empty() {
        return Err(OpError::validation("Channel name cannot be empty"));
    }

    let history_limit = state.config.history_limit;
    let rows = state
        .with_db(|db| match after_id {
            Some(cursor) => db.history_after(channel, cursor),
            None => db.history(channel, history_limit),
        })
        .map_err(|e| OpError::persistence("retrieve messages", e))?;

    state.send_to(
        session_id,
        ServerEvent::ChannelMessages {
            channel: channel.to_string(),
            messages: rows.into_iter().map(WireMessage::from).collect(),
        },
    );
    Ok(())
}
