use std::io;

use mio::{event::Source, Interest, Registry, Token};
use slab::Slab;
use tracing::warn;

use super::source::endpoint::Endpoint;

pub(crate) struct Entry<T> {
    pub tag: T,
    pub endpoint: Endpoint,
}

/// Live tags and the read sides they own, keyed by poll token.
pub(crate) struct TagRegistry<T> {
    entries: Slab<Entry<T>>,
}

impl<T> TagRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Slab::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, token: Token) -> Option<&Entry<T>> {
        self.entries.get(token.0)
    }

    /// Registers `endpoint` with the poller and stores it under `tag`.
    pub(crate) fn insert(
        &mut self,
        tag: T,
        mut endpoint: Endpoint,
        registry: &Registry,
    ) -> io::Result<Token> {
        let entry = self.entries.vacant_entry();
        let token = Token(entry.key());
        endpoint.register(registry, token, Interest::READABLE)?;
        entry.insert(Entry { tag, endpoint });
        Ok(token)
    }

    /// Deregisters and drops the endpoint behind `token`, if any.
    pub(crate) fn remove(&mut self, token: Token, registry: &Registry) -> io::Result<Option<T>> {
        match self.entries.try_remove(token.0) {
            Some(mut entry) => {
                entry.endpoint.deregister(registry)?;
                Ok(Some(entry.tag))
            }
            None => Ok(None),
        }
    }

    /// Drops every endpoint. Returns how many were removed.
    pub(crate) fn clear(&mut self, registry: &Registry) -> usize {
        let count = self.entries.len();
        for mut entry in self.entries.drain() {
            if let Err(e) = entry.endpoint.deregister(registry) {
                warn!("failed to deregister endpoint: {e}");
            }
        }
        count
    }
}

impl<T: PartialEq> TagRegistry<T> {
    pub(crate) fn contains(&self, tag: &T) -> bool {
        self.entries.iter().any(|(_, entry)| entry.tag == *tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::source::transport::TransportKind;
    use mio::Poll;

    #[test]
    fn insert_remove_and_clear() {
        let poll = Poll::new().unwrap();
        let mut tags = TagRegistry::new();
        assert!(tags.is_empty());

        let (a, _wa) = Endpoint::pair(TransportKind::Stream).unwrap();
        let (b, _wb) = Endpoint::pair(TransportKind::Stream).unwrap();
        let ta = tags.insert("a", a, poll.registry()).unwrap();
        let tb = tags.insert("b", b, poll.registry()).unwrap();
        assert_ne!(ta, tb);
        assert!(tags.contains(&"a"));
        assert!(!tags.contains(&"c"));
        assert_eq!(tags.get(tb).map(|e| e.tag), Some("b"));

        assert_eq!(tags.remove(ta, poll.registry()).unwrap(), Some("a"));
        assert_eq!(tags.remove(ta, poll.registry()).unwrap(), None);
        assert!(!tags.contains(&"a"));

        assert_eq!(tags.clear(poll.registry()), 1);
        assert_eq!(tags.len(), 0);
    }
}
