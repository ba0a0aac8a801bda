//! The fixed header prepended to every message (3, 4.1).
//!
//! Kept as a plain `#[repr(C)]` struct rather than going through the
//! bit-packing helpers in `bits.rs` — unlike `HandlerT`/`EpochT` the
//! envelope is a record of independent fields, not one densely packed
//! word, so plain fields read better and the refcount needs its own
//! atomic regardless.

use crate::epoch::{EpochT, NO_EPOCH};
use crate::handler::HandlerT;
use crate::node::{NodeT, UNINITIALIZED_DESTINATION};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageKind {
    Short = 0,
    EpochTag = 1,
}

const FLAG_BROADCAST: u8 = 1 << 0;
const FLAG_TERM: u8 = 1 << 1;
const FLAG_PUT_PRESENT: u8 = 1 << 2;
const FLAG_LOCKED: u8 = 1 << 3;
const FLAG_HANDLER_SET: u8 = 1 << 4;

/// Records an out-of-band "put" payload attached to a message (`setPut`, 4.1).
#[derive(Debug, Clone, Copy)]
pub struct PutInfo {
    pub offset: usize,
    pub bytes: usize,
}

#[repr(C)]
pub struct Envelope {
    kind: MessageKind,
    flags: AtomicU8,
    dest: NodeT,
    src: NodeT,
    handler: HandlerT,
    refcount: AtomicU32,
    epoch: EpochT,
    group: u64,
    put: Option<PutInfo>,
}

impl Envelope {
    /// `init(kind)`: zero refcount, no handler, no epoch, no group, dest unset.
    pub fn init(kind: MessageKind) -> Envelope {
        Envelope {
            kind,
            flags: AtomicU8::new(0),
            dest: UNINITIALIZED_DESTINATION,
            src: UNINITIALIZED_DESTINATION,
            handler: 0,
            refcount: AtomicU32::new(0),
            epoch: NO_EPOCH,
            group: crate::node::DEFAULT_GROUP,
            put: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[inline]
    pub fn set_handler(&mut self, h: HandlerT) {
        self.handler = h;
        self.set_flag(FLAG_HANDLER_SET, true);
    }

    /// Fails the process if the handler was never set — envelopes are not
    /// self-healing (4.1).
    #[inline]
    pub fn handler(&self) -> HandlerT {
        assert!(
            self.has_flag(FLAG_HANDLER_SET),
            "read of unset handler on envelope"
        );
        self.handler
    }

    #[inline]
    pub fn set_dest(&mut self, n: NodeT) {
        self.dest = n;
    }

    #[inline]
    pub fn dest(&self) -> NodeT {
        self.dest
    }

    #[inline]
    pub fn set_src(&mut self, n: NodeT) {
        self.src = n;
    }

    #[inline]
    pub fn src(&self) -> NodeT {
        self.src
    }

    #[inline]
    pub fn set_broadcast(&mut self, b: bool) {
        self.set_flag(FLAG_BROADCAST, b);
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.has_flag(FLAG_BROADCAST)
    }

    #[inline]
    pub fn set_term(&mut self, b: bool) {
        self.set_flag(FLAG_TERM, b);
    }

    #[inline]
    pub fn is_term(&self) -> bool {
        self.has_flag(FLAG_TERM)
    }

    /// `no_epoch` means "inherits the sentinel" (4.1).
    #[inline]
    pub fn set_epoch(&mut self, e: EpochT) {
        self.epoch = e;
    }

    #[inline]
    pub fn epoch(&self) -> EpochT {
        self.epoch
    }

    /// `default_group` = full world (4.1).
    #[inline]
    pub fn set_group(&mut self, g: u64) {
        self.group = g;
    }

    #[inline]
    pub fn group(&self) -> u64 {
        self.group
    }

    /// True while transport owns the buffer and user mutation is forbidden (4.1, 4.4).
    #[inline]
    pub fn set_locked(&self, b: bool) {
        self.set_flag(FLAG_LOCKED, b);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.has_flag(FLAG_LOCKED)
    }

    /// Records an out-of-band payload pointer/length (`setPut`, 4.1).
    #[inline]
    pub fn set_put(&mut self, offset: usize, bytes: usize) {
        self.put = Some(PutInfo { offset, bytes });
        self.set_flag(FLAG_PUT_PRESENT, true);
    }

    #[inline]
    pub fn put(&self) -> Option<PutInfo> {
        self.put
    }

    #[inline]
    pub fn has_put(&self) -> bool {
        self.has_flag(FLAG_PUT_PRESENT)
    }

    #[inline]
    pub fn ref_(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the refcount after the decrement; callers return the
    /// buffer to the pool when this hits zero.
    #[inline]
    pub fn deref_(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    #[inline]
    pub fn get_ref(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    #[inline]
    fn set_flag(&self, flag: u8, on: bool) {
        if on {
            self.flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    #[inline]
    fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_envelope_has_sentinel_dest_and_no_epoch() {
        let env = Envelope::init(MessageKind::Short);
        assert_eq!(env.dest(), UNINITIALIZED_DESTINATION);
        assert_eq!(env.epoch(), NO_EPOCH);
        assert_eq!(env.get_ref(), 0);
    }

    #[test]
    #[should_panic(expected = "read of unset handler")]
    fn reading_unset_handler_is_fatal() {
        let env = Envelope::init(MessageKind::Short);
        env.handler();
    }

    #[test]
    fn lock_is_a_visible_flag_not_a_lock() {
        let env = Envelope::init(MessageKind::Short);
        assert!(!env.is_locked());
        env.set_locked(true);
        assert!(env.is_locked());
        env.set_locked(false);
        assert!(!env.is_locked());
    }

    #[test]
    fn refcount_tracks_holders() {
        let env = Envelope::init(MessageKind::Short);
        assert_eq!(env.ref_(), 1);
        assert_eq!(env.ref_(), 2);
        assert_eq!(env.deref_(), 1);
        assert_eq!(env.deref_(), 0);
    }
}
