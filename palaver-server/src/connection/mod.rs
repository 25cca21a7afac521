//! Per-connection event dispatch.
//!
//! Every client event funnels through [`dispatch`]: it hands off to a
//! handler, and any handler error becomes a single `error` event for the
//! offending session. Handlers are synchronous so the full dispatch path
//! can be driven from tests without a socket.

pub mod channels;
pub mod command;
pub mod messaging;

use std::sync::Arc;

use chrono::Utc;

use crate::error::OpError;
use crate::events::{ClientEvent, ServerEvent};
use crate::registry::ClaimError;
use crate::router;
use crate::server::SharedState;

use command::Command;

/// Route one client event. Errors never escape: they are reported to the
/// originating session and the connection stays up.
pub fn dispatch(state: &Arc<SharedState>, session_id: &str, event: ClientEvent) {
    let result = match event {
        ClientEvent::Message { content, channel, dedup_token } => {
            if command::is_command(&content) {
                match Command::parse(&content) {
                    Ok(cmd) => dispatch_command(state, session_id, cmd),
                    Err(err) => Err(OpError::validation(err.to_string())),
                }
            } else {
                messaging::handle_text(
                    state,
                    session_id,
                    &content,
                    channel.as_deref(),
                    dedup_token.as_deref(),
                )
            }
        }
        ClientEvent::Nick { name } => handle_nick(state, session_id, &name),
        ClientEvent::CheckNickname { name } => handle_check_nickname(state, session_id, &name),
        ClientEvent::CreateChannel { name } => channels::handle_create(state, session_id, &name),
        ClientEvent::ListChannels { keyword } => {
            channels::handle_list(state, session_id, keyword.as_deref())
        }
        ClientEvent::JoinChannel { name } => channels::handle_join(state, session_id, &name),
        ClientEvent::QuitChannel { name } => channels::handle_quit(state, session_id, &name),
        ClientEvent::DeleteChannel { name } => channels::handle_delete(state, session_id, &name),
        ClientEvent::RenameChannel { old_name, new_name } => {
            channels::handle_rename(state, session_id, &old_name, &new_name)
        }
        ClientEvent::Users { channel } => {
            channels::handle_users(state, session_id, channel.as_deref())
        }
        ClientEvent::Messages { channel, after_id } => {
            messaging::handle_messages(state, session_id, &channel, after_id)
        }
        ClientEvent::PrivateMessage { to, content, dedup_token } => {
            router::send_private(state, session_id, &to, &content, dedup_token.as_deref())
        }
    };

    if let Err(err) = result {
        tracing::debug!(session_id, error = %err, "request failed");
        state.send_to(session_id, ServerEvent::Error { message: err.to_string() });
    }
}

fn dispatch_command(
    state: &Arc<SharedState>,
    session_id: &str,
    cmd: Command,
) -> Result<(), OpError> {
    match cmd {
        Command::Nick { name } => handle_nick(state, session_id, &name),
        Command::Create { name } => channels::handle_create(state, session_id, &name),
        Command::List { keyword } => {
            channels::handle_list(state, session_id, keyword.as_deref())
        }
        Command::Delete { name } => channels::handle_delete(state, session_id, &name),
        Command::Join { name } => channels::handle_join(state, session_id, &name),
        Command::Quit { name } => channels::handle_quit(state, session_id, &name),
        Command::Users { channel } => {
            channels::handle_users(state, session_id, channel.as_deref())
        }
        Command::Msg { to, content } => {
            router::send_private(state, session_id, &to, &content, None)
        }
        Command::Rename { old_name, new_name } => {
            channels::handle_rename(state, session_id, &old_name, &new_name)
        }
    }
}

/// Claim a fresh nickname. On success the identity is persisted, the
/// session is auto-joined to the default channel, and a claim that would
/// shadow an existing identity or an online name is refused.
fn handle_nick(state: &Arc<SharedState>, session_id: &str, name: &str) -> Result<(), OpError> {
    if name.trim().is_empty() {
        return Err(OpError::validation("Nickname cannot be empty"));
    }

    // Re-claiming one's own current name is a no-op success.
    if state.registry.lock().name_for(session_id) == Some(name) {
        state.send_to(session_id, ServerEvent::NickSuccess { nickname: name.to_string() });
        return Ok(());
    }

    let exists = state
        .with_db(|db| db.identity_exists(name))
        .map_err(|e| OpError::persistence("save nickname", e))?;
    if exists {
        return Err(OpError::conflict("Nickname already exists"));
    }

    // Claiming rebinds a session that already holds a name, so remember the
    // old binding for rollback.
    let previous = state
        .registry
        .lock()
        .name_for(session_id)
        .map(str::to_string);
    state
        .registry
        .lock()
        .claim(session_id, name)
        .map_err(|ClaimError::InUse| OpError::conflict("Nickname is already in use"))?;

    if let Err(e) = state.with_db(|db| db.ensure_identity(name)) {
        restore_claim(state, session_id, previous.as_deref());
        return Err(OpError::persistence("save nickname", e));
    }

    state.send_to(session_id, ServerEvent::NickSuccess { nickname: name.to_string() });
    let default_channel = state.config.default_channel.clone();
    channels::handle_join(state, session_id, &default_channel)
}

/// Roll a failed claim back to the session's previous binding. A claim must
/// not outlive a failed persist, and a session that held a name before the
/// attempt keeps it.
fn restore_claim(state: &Arc<SharedState>, session_id: &str, previous: Option<&str>) {
    let mut registry = state.registry.lock();
    registry.release(session_id);
    if let Some(prev) = previous {
        // The failed claim released this name, so re-claiming cannot collide.
        let _ = registry.claim(session_id, prev);
    }
}

/// Reconnect under an existing nickname: claim the live binding, clear the
/// disconnect stamp, rebind every remembered channel and announce presence
/// in each. An unknown name claims fresh (same flow, empty memberships).
fn handle_check_nickname(
    state: &Arc<SharedState>,
    session_id: &str,
    name: &str,
) -> Result<(), OpError> {
    if name.trim().is_empty() {
        return Err(OpError::validation("Nickname cannot be empty"));
    }

    let previous = state
        .registry
        .lock()
        .name_for(session_id)
        .map(str::to_string);
    state
        .registry
        .lock()
        .claim(session_id, name)
        .map_err(|ClaimError::InUse| OpError::conflict("Nickname is already in use"))?;

    let channels = match state.with_db(|db| {
        db.ensure_identity(name)?;
        db.clear_disconnect(name)?;
        db.channels_for(name)
    }) {
        Ok(channels) => channels,
        Err(e) => {
            restore_claim(state, session_id, previous.as_deref());
            return Err(OpError::persistence("reconnect", e));
        }
    };

    for channel in &channels {
        state.bind(channel, session_id);
        router::broadcast(
            state,
            channel,
            ServerEvent::UserJoined {
                nickname: name.to_string(),
                channel: channel.clone(),
            },
        );
    }

    // Most recently joined channel becomes the client's active one.
    let current_channel = channels.last().cloned();
    state.send_to(
        session_id,
        ServerEvent::CheckNicknameSuccess {
            nickname: name.to_string(),
            channels,
            current_channel,
        },
    );
    Ok(())
}

/// Tear down a closed connection: drop the outbound sender, release the
/// live name binding, leave every bound group with a departure notice, and
/// stamp the identity's disconnect time for later catch-up.
pub fn handle_disconnect(state: &Arc<SharedState>, session_id: &str) {
    state.connections.lock().remove(session_id);
    let released = state.registry.lock().release(session_id);

    for channel in state.bound_channels(session_id) {
        state.unbind(&channel, session_id);
        if let Some(name) = &released {
            router::broadcast(
                state,
                &channel,
                ServerEvent::UserLeft { nickname: name.clone(), channel: channel.clone() },
            );
        }
    }

    if let Some(name) = released {
        if let Err(e) =
            state.with_db(|db| db.touch_disconnect(&name, Utc::now().timestamp_millis()))
        {
            tracing::error!(%name, error = %e, "failed to stamp disconnect time");
        }
    }
}
