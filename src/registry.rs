//! Session registry
//!
//! The authoritative username → session mapping, plus the separate set of
//! admin connections. Owned by the `ChatServer` actor, so every operation
//! runs to completion before the next one starts: check-and-insert on
//! registration is atomic and snapshots are never torn.

use std::collections::HashMap;

use crate::error::RegisterError;
use crate::session::{ConnectionHandle, Session};
use crate::types::{Role, SessionId};

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    /// Usernames in registration order
    order: Vec<String>,
    admins: HashMap<SessionId, Session>,
    max_clients: usize,
}

impl SessionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            admins: HashMap::new(),
            max_clients,
        }
    }

    /// Register a standard session
    ///
    /// Exactly one of several attempts with the same name succeeds.
    pub fn register(
        &mut self,
        username: String,
        handle: ConnectionHandle,
    ) -> Result<&Session, RegisterError> {
        if self.sessions.contains_key(&username) {
            return Err(RegisterError::DuplicateName(username));
        }
        if self.is_full() {
            return Err(RegisterError::CapacityExceeded);
        }
        self.order.push(username.clone());
        let session = Session::new(username.clone(), Role::Standard, handle);
        Ok(self.sessions.entry(username).or_insert(session))
    }

    /// Remove a session if `id` still owns `username`
    ///
    /// Idempotent: a second call, or a call for a session that was already
    /// replaced by a newer login, is a no-op returning `None`.
    pub fn unregister(&mut self, username: &str, id: SessionId) -> Option<Session> {
        match self.sessions.get(username) {
            Some(session) if session.id == id => self.remove(username),
            _ => None,
        }
    }

    /// Remove a session regardless of which connection owns it
    pub fn remove(&mut self, username: &str) -> Option<Session> {
        let session = self.sessions.remove(username)?;
        self.order.retain(|name| name != username);
        Some(session)
    }

    /// Point-in-time lookup; the session may disconnect right afterwards
    pub fn lookup(&self, username: &str) -> Option<&Session> {
        self.sessions.get(username)
    }

    /// Online usernames in registration order
    pub fn online_users(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Standard sessions in registration order
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.order.iter().filter_map(|name| self.sessions.get(name))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_clients
    }

    /// Admins never count against `max_clients`
    pub fn register_admin(&mut self, username: String, handle: ConnectionHandle) -> SessionId {
        let id = handle.id;
        self.admins
            .insert(id, Session::new(username, Role::Admin, handle));
        id
    }

    pub fn unregister_admin(&mut self, id: SessionId) -> Option<Session> {
        self.admins.remove(&id)
    }

    pub fn admin(&self, id: SessionId) -> Option<&Session> {
        self.admins.get(&id)
    }

    pub fn admin_count(&self) -> usize {
        self.admins.len()
    }

    /// Remove every standard and admin session (shutdown)
    pub fn drain(&mut self) -> Vec<Session> {
        self.order.clear();
        let mut all: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        all.extend(self.admins.drain().map(|(_, s)| s));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_handle;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SessionRegistry::new(10);
        let (handle, _rx, _kick) = test_handle();

        let session = registry.register("alice".into(), handle).unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(session.role, Role::Standard);
        assert!(registry.lookup("alice").is_some());
        assert!(registry.lookup("bob").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = SessionRegistry::new(10);
        let (first, _rx1, _k1) = test_handle();
        let (second, _rx2, _k2) = test_handle();

        registry.register("alice".into(), first).unwrap();
        let result = registry.register("alice".into(), second);
        assert!(matches!(result, Err(RegisterError::DuplicateName(name)) if name == "alice"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let mut registry = SessionRegistry::new(2);
        let mut keep = Vec::new();
        for name in ["a", "b"] {
            let (handle, rx, kick) = test_handle();
            keep.push((rx, kick));
            registry.register(name.into(), handle).unwrap();
        }
        assert!(registry.is_full());

        let (handle, _rx, _kick) = test_handle();
        assert!(matches!(
            registry.register("c".into(), handle),
            Err(RegisterError::CapacityExceeded)
        ));

        // Admins are tracked separately and do not count
        let (admin, _arx, _akick) = test_handle();
        registry.register_admin("admin".into(), admin);
        assert_eq!(registry.admin_count(), 1);
        assert_eq!(registry.online_users(), vec!["a", "b"]);
    }

    #[test]
    fn test_online_users_in_registration_order() {
        let mut registry = SessionRegistry::new(10);
        let mut keep = Vec::new();
        for name in ["carol", "alice", "bob"] {
            let (handle, rx, kick) = test_handle();
            keep.push((rx, kick));
            registry.register(name.into(), handle).unwrap();
        }
        assert_eq!(registry.online_users(), vec!["carol", "alice", "bob"]);

        registry.remove("alice");
        let names: Vec<&str> = registry.sessions().map(|s| s.username.as_str()).collect();
        assert_eq!(names, vec!["carol", "bob"]);
    }

    #[test]
    fn test_unregister_is_idempotent_and_id_checked() {
        let mut registry = SessionRegistry::new(10);
        let (old, _rx1, _k1) = test_handle();
        let old_id = old.id;
        registry.register("alice".into(), old).unwrap();
        assert!(registry.unregister("alice", old_id).is_some());
        assert!(registry.unregister("alice", old_id).is_none());

        // A newer login under the same name survives a stale cleanup
        let (new, _rx2, _k2) = test_handle();
        let new_id = new.id;
        registry.register("alice".into(), new).unwrap();
        assert!(registry.unregister("alice", old_id).is_none());
        assert_eq!(registry.lookup("alice").map(|s| s.id), Some(new_id));
    }

    #[test]
    fn test_drain() {
        let mut registry = SessionRegistry::new(10);
        let (a, _rx1, _k1) = test_handle();
        let (admin, _rx2, _k2) = test_handle();
        registry.register("alice".into(), a).unwrap();
        let admin_id = registry.register_admin("admin".into(), admin);
        assert!(registry.admin(admin_id).is_some());

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.admin_count(), 0);
        assert!(registry.online_users().is_empty());
    }
}
