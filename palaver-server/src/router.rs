//! Outbound event routing: channel fanout, unicast, private messages.

use std::sync::Arc;

use chrono::Utc;

use crate::error::OpError;
use crate::events::ServerEvent;
use crate::server::SharedState;

/// Deliver to every live connection bound to the channel's group on this
/// worker only. Relay application uses this to avoid re-publishing.
pub(crate) fn deliver_to_group(state: &SharedState, channel: &str, event: &ServerEvent) {
    let members: Vec<String> = state
        .groups
        .lock()
        .get(channel)
        .map(|g| g.iter().cloned().collect())
        .unwrap_or_default();

    let conns = state.connections.lock();
    for session in &members {
        if let Some(tx) = conns.get(session) {
            let _ = tx.try_send(event.clone());
        }
    }
}

/// Deliver to every live connection on this worker.
pub(crate) fn deliver_to_all(state: &SharedState, event: &ServerEvent) {
    let conns = state.connections.lock();
    for tx in conns.values() {
        let _ = tx.try_send(event.clone());
    }
}

/// Fan out to the channel's live members here and on peer workers.
pub fn broadcast(state: &SharedState, channel: &str, event: ServerEvent) {
    deliver_to_group(state, channel, &event);
    state.relay.publish(Some(channel), &event);
}

/// Directory-level notice to every connection on every worker.
pub fn broadcast_all(state: &SharedState, event: ServerEvent) {
    deliver_to_all(state, &event);
    state.relay.publish(None, &event);
}

/// Deliver to the identity's current live connection, if any. Returns
/// whether a live notification fired; offline identities are skipped
/// silently since persisted state already covers later delivery.
pub fn unicast(state: &SharedState, name: &str, event: ServerEvent) -> bool {
    let session = state
        .registry
        .lock()
        .session_for(name)
        .map(str::to_string);
    match session {
        Some(sid) => {
            state.send_to(&sid, event);
            true
        }
        None => false,
    }
}

/// Deterministic pair-channel name shared by exactly two identities.
/// Both directions of a conversation map to the same channel.
pub fn pair_channel(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("private-{lo}-{hi}")
}

/// Send a private message: resolve or create the pair channel, persist
/// membership for both parties, bind whoever is online into the group,
/// append (dedup-aware) and broadcast to the pair group.
///
/// Works when the recipient has never connected: the message is persisted
/// and replayed when they eventually join; no live notification fires.
pub fn send_private(
    state: &Arc<SharedState>,
    session_id: &str,
    to: &str,
    content: &str,
    dedup_token: Option<&str>,
) -> Result<(), OpError> {
    let from = state
        .registry
        .lock()
        .name_for(session_id)
        .map(str::to_string)
        .ok_or_else(|| OpError::validation("You must set a nickname with /nick first"))?;
    if to.trim().is_empty() {
        return Err(OpError::validation("Recipient cannot be empty"));
    }
    if content.trim().is_empty() {
        return Err(OpError::validation("Message cannot be empty"));
    }

    let channel = pair_channel(&from, to);
    let now = Utc::now().timestamp_millis();
    let row = state
        .with_db(|db| {
            db.create_channel(&channel, now)?;
            db.add_membership(&from, &channel)?;
            db.add_membership(to, &channel)?;
            db.append_message(&channel, &from, Some(to), content, now, dedup_token)
        })
        .map_err(|e| OpError::persistence("send private message", e))?;

    {
        let registry = state.registry.lock();
        let mut groups = state.groups.lock();
        let group = groups.entry(channel.clone()).or_default();
        group.insert(session_id.to_string());
        if let Some(peer) = registry.session_for(to) {
            group.insert(peer.to_string());
        }
    }

    broadcast(
        state,
        &channel,
        ServerEvent::PrivateMessage {
            id: row.id,
            content: row.content,
            from,
            to: to.to_string(),
            channel: channel.clone(),
            created_at: row.created_at,
        },
    );
    Ok(())
}
