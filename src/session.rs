//! Реестр сессий relay: по одному слоту sender и receiver на сессию
//!
//! Внутренней синхронизации нет: реестр принадлежит [`Relay`](crate::signaling::relay::Relay)
//! и изменяется только под его мьютексом.

use crate::signaling::protocol::Role;
use std::collections::HashMap;

/// Сессия: пара слотов, каждый пустой или занятый одним соединением
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<H> {
    pub id: String,
    pub sender: Option<H>,
    pub receiver: Option<H>,
}

impl<H> Session<H> {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sender: None,
            receiver: None,
        }
    }

    pub fn slot(&self, role: Role) -> Option<&H> {
        match role {
            Role::Sender => self.sender.as_ref(),
            Role::Receiver => self.receiver.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<H> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    /// Оба слота заняты
    pub fn is_paired(&self) -> bool {
        self.sender.is_some() && self.receiver.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }
}

#[derive(Debug)]
pub struct SessionRegistry<H> {
    sessions: HashMap<String, Session<H>>,
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<H: Clone + PartialEq> SessionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Возвращает сессию, создавая её при отсутствии
    pub fn upsert(&mut self, session_id: &str) -> &mut Session<H> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id))
    }

    /// Помещает `handle` в слот роли. Прежний владелец слота вытесняется без уведомления
    /// (last-writer-wins) и возвращается вызывающему.
    ///
    /// Если тот же handle занимал противоположный слот этой сессии (смена роли при
    /// повторном join), он оттуда убирается.
    pub fn bind(&mut self, session_id: &str, role: Role, handle: H) -> Option<H> {
        let session = self.upsert(session_id);

        let opposite = session.slot_mut(role.opposite());
        if opposite.as_ref() == Some(&handle) {
            *opposite = None;
        }

        session.slot_mut(role).replace(handle)
    }

    /// Убирает `handle` из всех слотов и удаляет опустевшие сессии.
    /// Возвращает id удалённых сессий.
    pub fn unbind(&mut self, handle: &H) -> Vec<String> {
        for session in self.sessions.values_mut() {
            if session.sender.as_ref() == Some(handle) {
                session.sender = None;
            }
            if session.receiver.as_ref() == Some(handle) {
                session.receiver = None;
            }
        }

        let pruned: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_empty())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &pruned {
            self.sessions.remove(id);
        }
        pruned
    }

    pub fn get(&self, session_id: &str) -> Option<&Session<H>> {
        self.sessions.get(session_id)
    }

    pub fn slot(&self, session_id: &str, role: Role) -> Option<&H> {
        self.sessions.get(session_id).and_then(|s| s.slot(role))
    }

    /// Соединение на противоположном для `role` слоте
    pub fn peer_of(&self, session_id: &str, role: Role) -> Option<&H> {
        self.slot(session_id, role.opposite())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_lazily() {
        let mut registry: SessionRegistry<u64> = SessionRegistry::new();
        assert!(registry.get("abc").is_none());

        registry.upsert("abc");
        registry.upsert("abc");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("abc").unwrap().is_empty());
    }

    #[test]
    fn bind_replaces_previous_occupant() {
        let mut registry = SessionRegistry::new();
        assert_eq!(registry.bind("abc", Role::Sender, 1u64), None);
        assert_eq!(registry.bind("abc", Role::Sender, 2u64), Some(1));

        let session = registry.get("abc").unwrap();
        assert_eq!(session.sender, Some(2));
        assert_eq!(session.receiver, None);
    }

    #[test]
    fn rebinding_with_new_role_moves_handle() {
        let mut registry = SessionRegistry::new();
        registry.bind("abc", Role::Sender, 7u64);
        registry.bind("abc", Role::Receiver, 7u64);

        let session = registry.get("abc").unwrap();
        assert_eq!(session.sender, None);
        assert_eq!(session.receiver, Some(7));
    }

    #[test]
    fn peer_of_returns_opposite_slot() {
        let mut registry = SessionRegistry::new();
        registry.bind("abc", Role::Sender, 1u64);
        assert_eq!(registry.peer_of("abc", Role::Sender), None);

        registry.bind("abc", Role::Receiver, 2u64);
        assert_eq!(registry.peer_of("abc", Role::Sender), Some(&2));
        assert_eq!(registry.peer_of("abc", Role::Receiver), Some(&1));
        assert!(registry.get("abc").unwrap().is_paired());
    }

    #[test]
    fn second_unbind_prunes_session() {
        let mut registry = SessionRegistry::new();
        registry.bind("abc", Role::Sender, 1u64);
        registry.bind("abc", Role::Receiver, 2u64);

        assert!(registry.unbind(&1).is_empty());
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.unbind(&2), vec!["abc".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn unbind_of_replaced_handle_keeps_new_occupant() {
        let mut registry = SessionRegistry::new();
        registry.bind("abc", Role::Sender, 1u64);
        registry.bind("abc", Role::Sender, 3u64);

        assert!(registry.unbind(&1).is_empty());
        assert_eq!(registry.slot("abc", Role::Sender), Some(&3));
    }

    #[test]
    fn unbind_touches_only_matching_sessions() {
        let mut registry = SessionRegistry::new();
        registry.bind("a", Role::Sender, 1u64);
        registry.bind("b", Role::Sender, 2u64);

        assert_eq!(registry.unbind(&1), vec!["a".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("b").is_some());
    }
}
