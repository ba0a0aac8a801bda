//! `Message<T>` and `MsgPtr<T>` (3): the envelope-prefixed message object
//! and the intrusive, reference-counted smart pointer over it.
//!
//! Design Notes calls for keeping the intrusive design ("reserve one word
//! per message for a refcount... ensure every code path uses the smart
//! pointer") — `Envelope`'s `AtomicU32` refcount lives inside
//! `Message<T>` exactly as it would inline in a C POD, and `MsgPtr` is
//! the only way to touch it.

use crate::envelope::{Envelope, MessageKind};
use crate::pool::{self, RawBlock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::alloc::Layout;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Messages are either byte-copyable or serializable (3); this core
/// treats every message as serializable via `serde`; the "serialization
/// library" itself is an assumed-available non-goal (1). A type that is
/// also `Copy` is trivially byte-copyable and the messenger eager-sends
/// it without a serialize step (see `ActiveMessenger::send_bytes_eager`).
pub trait MessageBody: Serialize + DeserializeOwned + Send + 'static {}

impl<T> MessageBody for T where T: Serialize + DeserializeOwned + Send + 'static {}

#[repr(C)]
pub struct Message<T> {
    pub envelope: Envelope,
    pub body: T,
}

/// Precedes every pool-backed `Message<T>` in its raw allocation (4.2's
/// pool-header-plus-payload shape): enough to find the block's bucket
/// and exact layout again from nothing but the `Message<T>` pointer, so
/// `Drop` can return it to the pool it came from.
#[repr(C)]
struct PoolHeader {
    bucket: Option<usize>,
    size: usize,
    align: usize,
}

/// The layout of a pool-backed `Message<T>` allocation: a `PoolHeader`
/// immediately followed by the `Message<T>` itself, and the byte offset
/// from the start of the allocation to the `Message<T>`.
fn message_layout<T>() -> (Layout, usize) {
    let header_layout = Layout::new::<PoolHeader>();
    let msg_layout = Layout::new::<Message<T>>();
    let (combined, body_offset) = header_layout
        .extend(msg_layout)
        .expect("message layout computation overflowed");
    (combined.pad_to_align(), body_offset)
}

/// Intrusive, reference-counted pointer over a `Message<T>`. Copy
/// increments the refcount; drop decrements it; refcount reaching zero
/// frees the message (3).
pub struct MsgPtr<T> {
    ptr: NonNull<Message<T>>,
}

unsafe impl<T: Send> Send for MsgPtr<T> {}

impl<T> MsgPtr<T> {
    /// Allocates a fresh message with refcount 1, size-classed and
    /// pool-backed (4.2) rather than a bare `Box::new` — the same
    /// `Pool` a wire frame's bytes come from, generalized to arbitrary
    /// typed storage via a pool-header-plus-payload raw block.
    pub fn new(kind: MessageKind, body: T) -> MsgPtr<T> {
        let (layout, body_offset) = message_layout::<T>();
        let block = pool::alloc_message_raw(layout);

        unsafe {
            let base = block.ptr.as_ptr();
            (base as *mut PoolHeader).write(PoolHeader {
                bucket: block.bucket,
                size: block.layout.size(),
                align: block.layout.align(),
            });

            let msg_ptr = base.add(body_offset) as *mut Message<T>;
            let envelope = Envelope::init(kind);
            envelope.ref_();
            msg_ptr.write(Message { envelope, body });

            MsgPtr {
                ptr: NonNull::new_unchecked(msg_ptr),
            }
        }
    }

    /// Adopts a raw pointer that already carries a refcount of 1 — used
    /// when the receive path hands a freshly-deserialized message
    /// straight to a `Runnable` without going through `new` (3: "adopts a
    /// pre-existing refcount of 1").
    ///
    /// # Safety
    /// `ptr` must point at a live `Message<T>` with refcount exactly 1,
    /// allocated by `MsgPtr::new` (so a `PoolHeader` immediately precedes
    /// it in memory — `Drop` walks back to find it), and no other
    /// `MsgPtr` may currently exist for it.
    pub unsafe fn from_raw_adopt(ptr: *mut Message<T>) -> MsgPtr<T> {
        MsgPtr {
            ptr: NonNull::new(ptr).expect("adopted a null message pointer"),
        }
    }

    /// Wraps an externally-owned message by bumping its refcount (3:
    /// "'promote' wraps an externally owned message by bumping refcount").
    ///
    /// # Safety
    /// `ptr` must point at a live `Message<T>` allocated by `MsgPtr::new`
    /// (so a `PoolHeader` immediately precedes it — see
    /// `from_raw_adopt`).
    pub unsafe fn promote(ptr: *mut Message<T>) -> MsgPtr<T> {
        (*ptr).envelope.ref_();
        MsgPtr {
            ptr: NonNull::new(ptr).expect("promoted a null message pointer"),
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut Message<T> {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        unsafe { self.ptr.as_ref().envelope.get_ref() }
    }
}

impl<T> Deref for MsgPtr<T> {
    type Target = Message<T>;

    #[inline]
    fn deref(&self) -> &Message<T> {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for MsgPtr<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Message<T> {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Clone for MsgPtr<T> {
    fn clone(&self) -> MsgPtr<T> {
        unsafe { self.ptr.as_ref().envelope.ref_() };
        MsgPtr { ptr: self.ptr }
    }
}

impl<T> Drop for MsgPtr<T> {
    fn drop(&mut self) {
        let remaining = unsafe { self.ptr.as_ref().envelope.deref_() };
        if remaining == 0 {
            unsafe {
                let msg_ptr = self.ptr.as_ptr();
                std::ptr::drop_in_place(msg_ptr);

                let (_, body_offset) = message_layout::<T>();
                let base = (msg_ptr as *mut u8).sub(body_offset);
                let header = (base as *const PoolHeader).read();
                let layout =
                    Layout::from_size_align(header.size, header.align).expect("stored message layout is always valid");

                pool::dealloc_message_raw(RawBlock {
                    ptr: NonNull::new_unchecked(base),
                    bucket: header.bucket,
                    layout,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_and_drop_conserve_refcount() {
        let msg = MsgPtr::new(MessageKind::Short, 42u32);
        assert_eq!(msg.ref_count(), 1);
        let clone_a = msg.clone();
        let clone_b = msg.clone();
        assert_eq!(msg.ref_count(), 3);
        drop(clone_a);
        assert_eq!(msg.ref_count(), 2);
        drop(clone_b);
        assert_eq!(msg.ref_count(), 1);
    }

    #[test]
    fn body_is_reachable_through_deref() {
        let mut msg = MsgPtr::new(MessageKind::Short, vec![1, 2, 3]);
        assert_eq!(msg.body, vec![1, 2, 3]);
        msg.body.push(4);
        assert_eq!(msg.body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn repeated_pool_backed_allocation_survives_alloc_and_drop_cycles() {
        // Exercises MsgPtr::new/Drop's pool round-trip (alloc_message_raw
        // / dealloc_message_raw) many times over so a use-after-free or
        // double-free in the raw block bookkeeping would show up as a
        // corrupted body or a crash, not just an unexercised code path.
        for i in 0..1000u64 {
            let msg = MsgPtr::new(MessageKind::Short, i);
            assert_eq!(msg.body, i);
            assert_eq!(msg.ref_count(), 1);
        }
    }
}
