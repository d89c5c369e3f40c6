//! `addrinfo`-style resolution chains.
//!
//! An [`AddrInfo`] chain mirrors the POSIX `struct addrinfo` linked list:
//! each node owns its successor. Deriving `Clone` on a self-referential
//! `Option<Box<AddrInfo>>` already walks the whole chain and allocates a
//! fresh one, which is exactly the deep-clone behavior the context needs --
//! no hand-written clone routine is needed as long as every owned field is
//! itself `Clone`.

use crate::addr::Address;

/// One node of an addrinfo resolution chain. Finite, acyclic by
/// construction: the only way to extend a chain is [`AddrInfo::push_back`],
/// which cannot introduce a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddrInfo {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: Option<Address>,
    pub canonname: Option<String>,
    pub next: Option<Box<AddrInfo>>,
}

impl AddrInfo {
    pub fn new(family: i32, socktype: i32, protocol: i32) -> Self {
        AddrInfo { flags: 0, family, socktype, protocol, addr: None, canonname: None, next: None }
    }

    /// Number of nodes in the chain starting at `self`.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn iter(&self) -> AddrInfoIter<'_> {
        AddrInfoIter(Some(self))
    }

    /// Append `node` at the end of the chain.
    pub fn push_back(&mut self, node: AddrInfo) {
        match &mut self.next {
            Some(next) => next.push_back(node),
            None => self.next = Some(Box::new(node)),
        }
    }

    /// Build a chain from an ordered sequence of standalone nodes (each
    /// with `next` unset). Returns `None` for an empty sequence.
    pub fn from_nodes(nodes: impl IntoIterator<Item = AddrInfo>) -> Option<AddrInfo> {
        let mut iter = nodes.into_iter();
        let mut head = iter.next()?;
        let mut tail = &mut head;
        for node in iter {
            tail.next = Some(Box::new(node));
            tail = tail.next.as_mut().unwrap();
        }
        Some(head)
    }
}

pub struct AddrInfoIter<'a>(Option<&'a AddrInfo>);

impl<'a> Iterator for AddrInfoIter<'a> {
    type Item = &'a AddrInfo;

    fn next(&mut self) -> Option<&'a AddrInfo> {
        let current = self.0?;
        self.0 = current.next.as_deref();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_allocates_an_independent_chain() {
        let mut a = AddrInfo::new(libc::AF_INET, libc::SOCK_STREAM, 0);
        a.canonname = Some("example.invalid".to_string());
        a.push_back(AddrInfo::new(libc::AF_INET, libc::SOCK_STREAM, 0));

        let mut b = a.clone();
        assert_eq!(a, b);
        b.canonname = Some("changed".to_string());
        assert_ne!(a.canonname, b.canonname);
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn from_nodes_links_in_order() {
        let chain = AddrInfo::from_nodes(vec![
            AddrInfo::new(libc::AF_INET, libc::SOCK_STREAM, 0),
            AddrInfo::new(libc::AF_INET6, libc::SOCK_STREAM, 0),
        ])
        .unwrap();
        let families: Vec<i32> = chain.iter().map(|n| n.family).collect();
        assert_eq!(families, vec![libc::AF_INET, libc::AF_INET6]);
    }

    #[test]
    fn from_nodes_empty_is_none() {
        assert!(AddrInfo::from_nodes(Vec::new()).is_none());
    }
}
