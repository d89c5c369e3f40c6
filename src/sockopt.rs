//! Socket options and the intent layer.
//!
//! A [`SocketOption`] is `(level, name, value, flags)`, carried either as a
//! real kernel-bound option or, at the synthetic [`INTENTS`] level, as a
//! policy hint that never reaches `setsockopt`. [`SocketOptionList`] keeps
//! insertion order and does not deduplicate on insert -- the codec is happy
//! to carry duplicates, and only the call surface's set-by-name path
//! overwrites.

use bitflags::bitflags;

/// Sentinel `level` marking an option as an intent hint rather than a real
/// socket option. Chosen outside the valid `SOL_*`/`IPPROTO_*` range.
pub const INTENTS: i32 = -1;

bitflags! {
    /// Per-option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SockOptFlags: u32 {
        /// Failure to apply this option is tolerated.
        const OPTIONAL = 0b01;
        /// The option has already been applied to the kernel (or, for an
        /// intent, recorded in the context).
        const IS_SET = 0b10;
    }
}

/// `(level, name, value, flags)` plus the return value of the last attempt
/// to apply it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOption {
    pub level: i32,
    pub name: i32,
    pub value: Vec<u8>,
    pub flags: SockOptFlags,
    pub returnvalue: i32,
}

impl SocketOption {
    pub fn new(level: i32, name: i32, value: Vec<u8>, flags: SockOptFlags) -> Self {
        SocketOption { level, name, value, flags, returnvalue: 0 }
    }

    pub fn is_intent(&self) -> bool {
        self.level == INTENTS
    }

    pub fn is_optional(&self) -> bool {
        self.flags.contains(SockOptFlags::OPTIONAL)
    }

    pub fn is_set(&self) -> bool {
        self.flags.contains(SockOptFlags::IS_SET)
    }
}

/// Ordered sequence of [`SocketOption`]s. Insertion order is preserved and
/// duplicates by `(level, name)` are allowed on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptionList(Vec<SocketOption>);

impl SocketOptionList {
    pub fn new() -> Self {
        SocketOptionList(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketOption> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Append without deduplicating, preserving call order.
    pub fn push(&mut self, opt: SocketOption) {
        self.0.push(opt);
    }

    /// First entry matching `(level, name)`.
    pub fn find(&self, level: i32, name: i32) -> Option<&SocketOption> {
        self.0.iter().find(|o| o.level == level && o.name == name)
    }

    pub fn find_mut(&mut self, level: i32, name: i32) -> Option<&mut SocketOption> {
        self.0.iter_mut().find(|o| o.level == level && o.name == name)
    }

    /// Insert `opt`, overwriting the value of an existing `(level, name)`
    /// entry in place (preserving its position) rather than appending.
    pub fn set(&mut self, opt: SocketOption) {
        if let Some(existing) = self.find_mut(opt.level, opt.name) {
            existing.value = opt.value;
            existing.flags = opt.flags;
            existing.returnvalue = opt.returnvalue;
        } else {
            self.0.push(opt);
        }
    }

    pub fn remove(&mut self, level: i32, name: i32) -> Option<SocketOption> {
        let pos = self.0.iter().position(|o| o.level == level && o.name == name)?;
        Some(self.0.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_value_and_preserves_order() {
        let mut list = SocketOptionList::new();
        list.push(SocketOption::new(libc::SOL_SOCKET, libc::SO_BROADCAST, vec![1, 0, 0, 0], SockOptFlags::empty()));
        list.push(SocketOption::new(INTENTS, 7, vec![2, 0, 0, 0], SockOptFlags::empty()));

        list.set(SocketOption::new(libc::SOL_SOCKET, libc::SO_BROADCAST, vec![0, 0, 0, 0], SockOptFlags::IS_SET));

        assert_eq!(list.len(), 2);
        assert_eq!(list.find(libc::SOL_SOCKET, libc::SO_BROADCAST).unwrap().value, vec![0, 0, 0, 0]);
        // the intent entry pushed second is still second.
        assert_eq!(list.iter().nth(1).unwrap().level, INTENTS);
    }

    #[test]
    fn clone_is_a_deep_copy_disjoint_from_the_source() {
        let mut list = SocketOptionList::new();
        list.push(SocketOption::new(libc::SOL_SOCKET, libc::SO_BROADCAST, vec![1, 0, 0, 0], SockOptFlags::empty()));
        list.push(SocketOption::new(INTENTS, 42, vec![2, 0, 0, 0], SockOptFlags::empty()));

        let cloned = list.clone();
        assert_eq!(cloned, list);
        assert_eq!(cloned.iter().map(|o| o.value.clone()).collect::<Vec<_>>(),
                   list.iter().map(|o| o.value.clone()).collect::<Vec<_>>());
    }
}
