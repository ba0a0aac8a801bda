//! Size-classed slab allocator for wire buffers and pool-backed messages
//! (3, 4.2).
//!
//! Generalizes the free-list slab design the retained snapshot's
//! `alloc.rs` used for ECS component storage (`VecPool`/`SlotPool`: a
//! `Vec` of pre-allocated slabs handed out and returned whole) to the
//! core's two actual allocation units: a `Vec<u8>` wire buffer recycled
//! by size class (`alloc`/`dealloc`, `PoolBuffer`), and a raw, layout-
//! exact block backing one `Message<T>` allocation (`alloc_raw`/
//! `dealloc_raw`, `RawBlock`) — the pool-header-plus-payload shape
//! `examples/original_source/src/vt/pool/header/pool_header.h` and
//! `examples/original_source/src/messaging/message/smart_ptr.h` use for
//! `makeMessage`.

use lazy_static::lazy_static;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

const SMALL_CLASS: usize = 256;
const MEDIUM_CLASS: usize = 4096;
const LARGE_CLASS: usize = 65536;

const INITIAL_SLABS: usize = 8;

/// Every raw, size-classed block this pool hands out is aligned to at
/// least this much — sufficient for every message body type in this
/// core (plain structs, `Vec`, `String`, primitives). A body requesting
/// a wider alignment would need a dedicated path; none does.
pub const POOL_ALIGN: usize = 16;

struct Bucket {
    capacity: usize,
    free: Vec<Vec<u8>>,
    slab_count: usize,
}

impl Bucket {
    fn new(capacity: usize) -> Bucket {
        let mut bucket = Bucket {
            capacity,
            free: Vec::new(),
            slab_count: 0,
        };
        bucket.grow();
        bucket
    }

    /// Growing a bucket doubles its slab count (4.2 invariant).
    fn grow(&mut self) {
        let add = if self.slab_count == 0 {
            INITIAL_SLABS
        } else {
            self.slab_count
        };
        for _ in 0..add {
            self.free.push(Vec::with_capacity(self.capacity));
        }
        self.slab_count += add;
    }

    fn take(&mut self) -> Vec<u8> {
        if self.free.is_empty() {
            self.grow();
        }
        let mut buf = self.free.pop().expect("bucket grown but still empty");
        buf.clear();
        buf
    }

    fn give(&mut self, buf: Vec<u8>) {
        self.free.push(buf);
    }
}

/// A buffer handed out by `Pool::alloc`. Carries enough of a "header" to
/// route itself back to the right bucket on `dealloc`, or to skip the
/// pool entirely for oversize requests that fell through to the system
/// allocator (4.2).
pub struct PoolBuffer {
    bucket: Option<usize>,
    pub buf: Vec<u8>,
}

impl PoolBuffer {
    /// Free capacity remaining after `used` bytes of header/body have
    /// been written — used for "inline put" decisions (4.2: `remainingSize`).
    #[inline]
    pub fn remaining_size(&self, used: usize) -> usize {
        self.buf.capacity().saturating_sub(used)
    }
}

/// A free list of raw, layout-exact blocks for one size class, used for
/// pool-backed message allocation rather than `Vec<u8>` wire buffers.
struct RawBucket {
    capacity: usize,
    free: Vec<NonNull<u8>>,
    slab_count: usize,
}

// Every block in `free` is plain, opaquely-typed memory this bucket
// exclusively owns until it's handed out; nothing about crossing it to
// another thread is unsound, only `NonNull`'s blanket opt-out blocks it.
unsafe impl Send for RawBucket {}

impl RawBucket {
    fn new(capacity: usize) -> RawBucket {
        let mut bucket = RawBucket {
            capacity,
            free: Vec::new(),
            slab_count: 0,
        };
        bucket.grow();
        bucket
    }

    fn layout(&self) -> Layout {
        Layout::from_size_align(self.capacity, POOL_ALIGN).expect("bucket capacity is a valid layout size")
    }

    fn grow(&mut self) {
        let add = if self.slab_count == 0 {
            INITIAL_SLABS
        } else {
            self.slab_count
        };
        let layout = self.layout();
        for _ in 0..add {
            let raw = unsafe { alloc(layout) };
            self.free.push(NonNull::new(raw).expect("system allocation failed"));
        }
        self.slab_count += add;
    }

    fn take(&mut self) -> NonNull<u8> {
        if self.free.is_empty() {
            self.grow();
        }
        self.free.pop().expect("bucket grown but still empty")
    }

    fn give(&mut self, ptr: NonNull<u8>) {
        self.free.push(ptr);
    }
}

impl Drop for RawBucket {
    fn drop(&mut self) {
        let layout = self.layout();
        for ptr in self.free.drain(..) {
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// A raw, size-classed block backing one pool-allocated `Message<T>`
/// (4.2's pool-header-plus-payload shape). `bucket` says which free list
/// reclaims it; `layout` is the exact layout used to allocate it, which
/// `dealloc`/`std::alloc::dealloc` require back unchanged.
pub(crate) struct RawBlock {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) bucket: Option<usize>,
    pub(crate) layout: Layout,
}

/// Buckets: `{<=256B, <=4KB, <=64KB}` (4.2, design-level sizes).
pub struct Pool {
    buckets: [Bucket; 3],
    raw_buckets: [RawBucket; 3],
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            buckets: [
                Bucket::new(SMALL_CLASS),
                Bucket::new(MEDIUM_CLASS),
                Bucket::new(LARGE_CLASS),
            ],
            raw_buckets: [
                RawBucket::new(SMALL_CLASS),
                RawBucket::new(MEDIUM_CLASS),
                RawBucket::new(LARGE_CLASS),
            ],
        }
    }

    /// Returns a buffer of capacity >= `nbytes + over`, picking the
    /// smallest fitting bucket or falling through to the system
    /// allocator for oversize requests (4.2).
    pub fn alloc(&mut self, nbytes: usize, over: usize) -> PoolBuffer {
        let needed = nbytes + over;
        for (index, bucket) in self.buckets.iter_mut().enumerate() {
            if needed <= bucket.capacity {
                return PoolBuffer {
                    bucket: Some(index),
                    buf: bucket.take(),
                };
            }
        }
        PoolBuffer {
            bucket: None,
            buf: Vec::with_capacity(needed),
        }
    }

    /// Returns a buffer to its bucket, or drops it (system `free`) if it
    /// was an oversize allocation (4.2 invariant: every pointer is
    /// `dealloc`'d exactly once).
    pub fn dealloc(&mut self, buffer: PoolBuffer) {
        if let Some(index) = buffer.bucket {
            self.buckets[index].give(buffer.buf);
        }
    }

    /// Returns a raw block able to hold `layout`, picking the smallest
    /// fitting bucket or falling through to a dedicated system
    /// allocation for oversize requests — the same size-classing
    /// `alloc`/`dealloc` apply to wire buffers, generalized to arbitrary
    /// typed storage so `MsgPtr::new` allocates through the pool instead
    /// of a bare `Box::new` (3, 4.2).
    pub(crate) fn alloc_raw(&mut self, layout: Layout) -> RawBlock {
        debug_assert!(
            layout.align() <= POOL_ALIGN,
            "message body requests an alignment wider than this pool guarantees"
        );
        for (index, bucket) in self.raw_buckets.iter_mut().enumerate() {
            if layout.size() <= bucket.capacity {
                return RawBlock {
                    ptr: bucket.take(),
                    bucket: Some(index),
                    layout: bucket.layout(),
                };
            }
        }
        let oversize = Layout::from_size_align(layout.size(), POOL_ALIGN).expect("oversize message layout");
        let ptr = unsafe { alloc(oversize) };
        RawBlock {
            ptr: NonNull::new(ptr).expect("system allocation failed"),
            bucket: None,
            layout: oversize,
        }
    }

    /// Returns a raw block to its bucket, or frees it (system `dealloc`)
    /// if it was an oversize allocation.
    pub(crate) fn dealloc_raw(&mut self, block: RawBlock) {
        match block.bucket {
            Some(index) => self.raw_buckets[index].give(block.ptr),
            None => unsafe { dealloc(block.ptr.as_ptr(), block.layout) },
        }
    }
}

impl Default for Pool {
    fn default() -> Pool {
        Pool::new()
    }
}

lazy_static! {
    /// The process-wide pool backing every `MsgPtr::new` allocation (3,
    /// 4.2). Messages can be constructed before any `ActiveMessenger`
    /// exists and a `Drop` impl has no messenger to borrow a pool from,
    /// so message allocation goes through one shared pool rather than
    /// the per-messenger one `ActiveMessenger` uses for wire buffers.
    static ref MESSAGE_POOL: Mutex<Pool> = Mutex::new(Pool::new());
}

pub(crate) fn alloc_message_raw(layout: Layout) -> RawBlock {
    MESSAGE_POOL.lock().unwrap().alloc_raw(layout)
}

pub(crate) fn dealloc_message_raw(block: RawBlock) {
    MESSAGE_POOL.lock().unwrap().dealloc_raw(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_smallest_fitting_bucket() {
        let mut pool = Pool::new();
        let small = pool.alloc(100, 0);
        assert_eq!(small.buf.capacity(), SMALL_CLASS);
        let medium = pool.alloc(1000, 0);
        assert_eq!(medium.buf.capacity(), MEDIUM_CLASS);
        let large = pool.alloc(60000, 0);
        assert_eq!(large.buf.capacity(), LARGE_CLASS);
    }

    #[test]
    fn oversize_falls_through_to_malloc() {
        let mut pool = Pool::new();
        let huge = pool.alloc(1_000_000, 0);
        assert!(huge.buf.capacity() >= 1_000_000);
        pool.dealloc(huge); // just drops, no bucket to return to
    }

    #[test]
    fn dealloc_returns_buffer_for_reuse() {
        let mut pool = Pool::new();
        let before_slabs = pool.buckets[0].free.len();
        let buf = pool.alloc(10, 0);
        assert_eq!(pool.buckets[0].free.len(), before_slabs - 1);
        pool.dealloc(buf);
        assert_eq!(pool.buckets[0].free.len(), before_slabs);
    }

    #[test]
    fn bucket_doubles_slab_count_on_exhaustion() {
        let mut bucket = Bucket::new(SMALL_CLASS);
        assert_eq!(bucket.slab_count, INITIAL_SLABS);
        let mut taken: Vec<_> = (0..INITIAL_SLABS).map(|_| bucket.take()).collect();
        assert!(bucket.free.is_empty());
        bucket.take();
        assert_eq!(bucket.slab_count, INITIAL_SLABS * 2);
        taken.push(Vec::new());
    }

    #[test]
    fn raw_alloc_picks_smallest_fitting_bucket_and_recycles() {
        let mut pool = Pool::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let before = pool.raw_buckets[0].free.len();

        let block = pool.alloc_raw(layout);
        assert_eq!(block.bucket, Some(0));
        assert_eq!(pool.raw_buckets[0].free.len(), before - 1);

        pool.dealloc_raw(block);
        assert_eq!(pool.raw_buckets[0].free.len(), before);
    }

    #[test]
    fn raw_alloc_falls_through_to_system_allocator_when_oversize() {
        let mut pool = Pool::new();
        let layout = Layout::from_size_align(1_000_000, 8).unwrap();
        let block = pool.alloc_raw(layout);
        assert_eq!(block.bucket, None);
        pool.dealloc_raw(block);
    }
}
