//! Identity registry: display name ↔ live session bindings.
//!
//! Owns the in-process half of an identity: which session, if any, is
//! currently online under a given name. The durable half (the identity row
//! and its disconnect stamp) lives in [`crate::db::Db`]. The registry is an
//! explicitly owned value held by shared state with its lifecycle tied to
//! worker startup/shutdown — not a process-wide global.
//!
//! `claim` is the single atomic check-and-bind for name uniqueness: callers
//! hold one lock around the whole operation, so two connections can never
//! acquire the same name under concurrent claims.

use std::collections::HashMap;

/// Why a claim was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// The name is bound to a different online session.
    InUse,
}

pub struct Registry {
    session_by_name: HashMap<String, String>,
    name_by_session: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            session_by_name: HashMap::new(),
            name_by_session: HashMap::new(),
        }
    }

    /// Bind `name` to `session`. Rejects if the name is held by a different
    /// online session; re-claiming one's own name succeeds. A session that
    /// already holds another name is rebound (its old name is released).
    pub fn claim(&mut self, session: &str, name: &str) -> Result<(), ClaimError> {
        if let Some(holder) = self.session_by_name.get(name) {
            if holder != session {
                return Err(ClaimError::InUse);
            }
            return Ok(());
        }
        if let Some(old) = self.name_by_session.remove(session) {
            self.session_by_name.remove(&old);
        }
        self.session_by_name.insert(name.to_string(), session.to_string());
        self.name_by_session.insert(session.to_string(), name.to_string());
        Ok(())
    }

    /// Mark the session's identity offline. Returns the released name.
    /// The identity itself is not forgotten — that is durable state.
    pub fn release(&mut self, session: &str) -> Option<String> {
        let name = self.name_by_session.remove(session)?;
        self.session_by_name.remove(&name);
        Some(name)
    }

    pub fn session_for(&self, name: &str) -> Option<&str> {
        self.session_by_name.get(name).map(String::as_str)
    }

    pub fn name_for(&self, session: &str) -> Option<&str> {
        self.name_by_session.get(session).map(String::as_str)
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.session_by_name.contains_key(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
