//! Sandbox id to live session mapping.
//!
//! Plain map with no locking of its own; the connector serialises
//! mutations per id.

use std::collections::HashMap;
use std::sync::Arc;

use super::Session;

#[derive(Default)]
pub(crate) struct Registry {
    sessions: HashMap<String, Arc<Session>>,
}

impl Registry {
    pub(crate) fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).cloned()
    }

    /// Inserts `session`, returning the entry it replaced.
    pub(crate) fn put(&mut self, id: &str, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(id.to_string(), session)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id)
    }

    /// Removes the entry only if it is still `session`.
    pub(crate) fn remove_if_same(&mut self, id: &str, session: &Arc<Session>) -> bool {
        match self.sessions.get(id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                self.sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
