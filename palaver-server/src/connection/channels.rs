//! Channel directory and membership operations:
//! create, list, rename, delete, join, quit, users.

use std::sync::Arc;

use chrono::Utc;

use crate::error::OpError;
use crate::events::{ServerEvent, UserEntry, WireMessage};
use crate::router;
use crate::server::SharedState;

pub(super) fn handle_create(
    state: &Arc<SharedState>,
    session_id: &str,
    name: &str,
) -> Result<(), OpError> {
    if name.trim().is_empty() {
        return Err(OpError::validation("Channel name cannot be empty"));
    }

    let created = state
        .with_db(|db| db.create_channel(name, Utc::now().timestamp_millis()))
        .map_err(|e| OpError::persistence("create channel", e))?;
    if !created {
        return Err(OpError::conflict("Channel already exists"));
    }

    router::broadcast_all(state, ServerEvent::ChannelCreated { name: name.to_string() });

    // Auto-join the creator when they have an identity; creation itself
    // does not require one.
    let has_nick = state.registry.lock().name_for(session_id).is_some();
    if has_nick {
        handle_join(state, session_id, name)?;
    }
    Ok(())
}

pub(super) fn handle_list(
    state: &Arc<SharedState>,
    session_id: &str,
    keyword: Option<&str>,
) -> Result<(), OpError> {
    let channels = state
        .with_db(|db| db.list_channels(keyword.unwrap_or("")))
        .map_err(|e| OpError::persistence("list channels", e))?;
    state.send_to(session_id, ServerEvent::ChannelsList { channels });
    Ok(())
}

pub(super) fn handle_rename(
    state: &Arc<SharedState>,
    _session_id: &str,
    old_name: &str,
    new_name: &str,
) -> Result<(), OpError> {
    if old_name.trim().is_empty() || new_name.trim().is_empty() {
        return Err(OpError::validation("Channel name cannot be empty"));
    }

    // The target name must be free; renaming onto an existing channel would
    // trip the directory's primary key.
    let (target_taken, renamed) = state
        .with_db(|db| {
            if db.channel_exists(new_name)? {
                Ok((true, false))
            } else {
                Ok((false, db.rename_channel(old_name, new_name)?))
            }
        })
        .map_err(|e| OpError::persistence("rename channel", e))?;
    if target_taken {
        return Err(OpError::conflict("Channel already exists"));
    }
    if !renamed {
        return Err(OpError::not_found("Channel not found"));
    }

    // Live bindings follow the logical entity under its new key.
    {
        let mut groups = state.groups.lock();
        if let Some(members) = groups.remove(old_name) {
            groups.insert(new_name.to_string(), members);
        }
    }

    router::broadcast_all(
        state,
        ServerEvent::ChannelRenamed {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        },
    );
    Ok(())
}

pub(super) fn handle_delete(
    state: &Arc<SharedState>,
    _session_id: &str,
    name: &str,
) -> Result<(), OpError> {
    if name.trim().is_empty() {
        return Err(OpError::validation("Channel name cannot be empty"));
    }

    let deleted = state
        .with_db(|db| db.delete_channel(name))
        .map_err(|e| OpError::persistence("delete channel", e))?;
    if !deleted {
        return Err(OpError::not_found("Channel not found"));
    }

    // Deletion notice goes out before members lose their live binding.
    router::broadcast_all(state, ServerEvent::ChannelDeleted { name: name.to_string() });
    state.groups.lock().remove(name);
    Ok(())
}

pub(super) fn handle_join(
    state: &Arc<SharedState>,
    session_id: &str,
    name: &str,
) -> Result<(), OpError> {
    if name.trim().is_empty() {
        return Err(OpError::validation("Channel name cannot be empty"));
    }
    let nickname = state
        .registry
        .lock()
        .name_for(session_id)
        .map(str::to_string)
        .ok_or_else(|| OpError::validation("Nickname is required to join a channel"))?;

    let history_limit = state.config.history_limit;
    let history = state
        .with_db(|db| {
            // A join of a deleted or never-created name starts a fresh channel.
            db.create_channel(name, Utc::now().timestamp_millis())?;
            db.add_membership(&nickname, name)?;
            db.history(name, history_limit)
        })
        .map_err(|e| OpError::persistence("join channel", e))?;

    state.bind(name, session_id);

    // History goes to the joiner only; the join notice goes to the group.
    state.send_to(
        session_id,
        ServerEvent::ChannelMessages {
            channel: name.to_string(),
            messages: history.into_iter().map(WireMessage::from).collect(),
        },
    );
    router::broadcast(
        state,
        name,
        ServerEvent::UserJoined { nickname, channel: name.to_string() },
    );
    Ok(())
}

pub(super) fn handle_quit(
    state: &Arc<SharedState>,
    session_id: &str,
    name: &str,
) -> Result<(), OpError> {
    if name.trim().is_empty() {
        return Err(OpError::validation("Channel name cannot be empty"));
    }
    let nickname = state
        .registry
        .lock()
        .name_for(session_id)
        .map(str::to_string)
        .ok_or_else(|| OpError::validation("You must set a nickname with /nick first"))?;

    if state.config.quit_policy == crate::config::QuitPolicy::Forget {
        state
            .with_db(|db| db.remove_membership(&nickname, name))
            .map_err(|e| OpError::persistence("quit channel", e))?;
    }

    state.unbind(name, session_id);
    router::broadcast(
        state,
        name,
        ServerEvent::UserLeft { nickname, channel: name.to_string() },
    );
    Ok(())
}

pub(super) fn handle_users(
    state: &Arc<SharedState>,
    session_id: &str,
    channel: Option<&str>,
) -> Result<(), OpError> {
    let channel = channel.unwrap_or(&state.config.default_channel).to_string();
    if channel.trim().is_empty() {
        return Err(OpError::validation("Channel name cannot be empty"));
    }

    let known = state
        .with_db(|db| db.members_of(&channel))
        .map_err(|e| OpError::persistence("list users", e))?;

    // Live subset: sessions bound to the group, resolved to online names.
    let live: std::collections::HashSet<String> = {
        let registry = state.registry.lock();
        let groups = state.groups.lock();
        groups
            .get(&channel)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|sid| registry.name_for(sid).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let users = known
        .into_iter()
        .map(|nickname| {
            let is_connected = live.contains(&nickname);
            UserEntry { nickname, is_connected }
        })
        .collect();
    state.send_to(session_id, ServerEvent::UsersList { channel, users });
    Ok(())
}
