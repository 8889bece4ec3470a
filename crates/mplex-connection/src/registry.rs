//! Stream registry and id allocation
//!
//! Ids are partitioned by parity: the dialing side allocates even ids and the
//! listening side odd ones, so both peers can open streams concurrently
//! without coordination. Ids are never reused within a connection.

use crate::error::ProtocolError;
use mplex_proto::StreamId;
use std::collections::HashMap;

/// Which side of the connection this peer is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Established with `dial`; allocates even stream ids
    Initiator,
    /// Established with `listen`; allocates odd stream ids
    Responder,
}

impl Role {
    fn first_id(&self) -> u64 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }

    /// Whether `id` was allocated by the peer playing this role
    pub fn owns(&self, id: StreamId) -> bool {
        id.is_even() == (*self == Role::Initiator)
    }
}

/// Per-connection mapping from stream id to stream state
#[derive(Debug)]
pub(crate) struct Registry<S> {
    role: Role,
    streams: HashMap<StreamId, S>,
    next_local: Option<StreamId>,
    last_remote: Option<StreamId>,
}

impl<S> Registry<S> {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            streams: HashMap::new(),
            next_local: StreamId::new(role.first_id()).ok(),
            last_remote: None,
        }
    }

    /// Whether `id` belongs to a stream this peer opened
    pub fn is_local(&self, id: StreamId) -> bool {
        self.role.owns(id)
    }

    /// Allocate the next id of local parity
    pub fn allocate(&mut self) -> Option<StreamId> {
        let id = self.next_local?;
        self.next_local = id.next_same_parity();
        Some(id)
    }

    /// Validate the id carried by an inbound NEW frame and record it
    pub fn accept_remote(&mut self, id: StreamId) -> Result<(), ProtocolError> {
        if self.is_local(id) {
            return Err(ProtocolError::InitiatorMismatch(id));
        }
        if self.streams.contains_key(&id) {
            return Err(ProtocolError::DuplicateStream(id));
        }
        if self.last_remote.is_some_and(|last| id <= last) {
            return Err(ProtocolError::StreamIdReused(id));
        }

        self.last_remote = Some(id);
        Ok(())
    }

    pub fn insert(&mut self, id: StreamId, stream: S) {
        self.streams.insert(id, stream);
    }

    pub fn get(&self, id: StreamId) -> Option<&S> {
        self.streams.get(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<S> {
        self.streams.remove(&id)
    }

    /// Remove every stream, in id order
    pub fn drain(&mut self) -> Vec<(StreamId, S)> {
        let mut streams: Vec<_> = self.streams.drain().collect();
        streams.sort_by_key(|(id, _)| *id);
        streams
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> StreamId {
        StreamId::new(v).unwrap()
    }

    #[test]
    fn test_allocate_parity() {
        let mut dialer: Registry<()> = Registry::new(Role::Initiator);
        let mut listener: Registry<()> = Registry::new(Role::Responder);

        assert_eq!(dialer.allocate(), Some(id(0)));
        assert_eq!(dialer.allocate(), Some(id(2)));
        assert_eq!(listener.allocate(), Some(id(1)));
        assert_eq!(listener.allocate(), Some(id(3)));

        assert!(dialer.is_local(id(4)));
        assert!(!dialer.is_local(id(5)));
        assert!(listener.is_local(id(5)));
    }

    #[test]
    fn test_ids_never_reused_after_removal() {
        let mut registry = Registry::new(Role::Initiator);

        let first = registry.allocate().unwrap();
        registry.insert(first, "a");
        registry.remove(first);

        let second = registry.allocate().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_accept_remote_validation() {
        let mut registry = Registry::new(Role::Initiator);

        assert_eq!(
            registry.accept_remote(id(2)),
            Err(ProtocolError::InitiatorMismatch(id(2)))
        );

        registry.accept_remote(id(1)).unwrap();
        registry.insert(id(1), ());
        assert_eq!(
            registry.accept_remote(id(1)),
            Err(ProtocolError::DuplicateStream(id(1)))
        );

        registry.remove(id(1));
        assert_eq!(
            registry.accept_remote(id(1)),
            Err(ProtocolError::StreamIdReused(id(1)))
        );

        assert!(registry.accept_remote(id(3)).is_ok());
    }

    #[test]
    fn test_exhausted_ids() {
        let mut registry: Registry<()> = Registry::new(Role::Responder);
        registry.next_local = Some(StreamId::MAX);

        assert_eq!(registry.allocate(), Some(StreamId::MAX));
        assert_eq!(registry.allocate(), None);
    }

    #[test]
    fn test_drain_in_id_order() {
        let mut registry = Registry::new(Role::Initiator);
        for v in [4, 0, 2] {
            registry.insert(id(v), v);
        }

        let drained: Vec<_> = registry.drain().into_iter().map(|(_, v)| v).collect();
        assert_eq!(drained, vec![0, 2, 4]);
        assert!(registry.is_empty());
    }
}
