//! Trace hooks (Design Notes §9): "every Runnable invocation calls
//! `beginProcessing`/`endProcessing` on the trace component if enabled."
//! Kept compile-time-known behind the `trace` feature rather than a
//! runtime-dispatched hook list, per the same note. The feature-off path
//! compiles to nothing; the feature-on path is a counter here since this
//! core has no tracing sink of its own (1. PURPOSE & SCOPE, non-goals).

use crate::handler::HandlerT;
use crate::node::NodeT;

#[cfg(feature = "trace")]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "trace")]
static EVENTS_BEGUN: AtomicU64 = AtomicU64::new(0);
#[cfg(feature = "trace")]
static EVENTS_ENDED: AtomicU64 = AtomicU64::new(0);

#[cfg(feature = "trace")]
#[inline]
pub fn begin_processing(_handler: HandlerT, _from: NodeT) {
    EVENTS_BEGUN.fetch_add(1, Ordering::Relaxed);
}

#[cfg(not(feature = "trace"))]
#[inline]
pub fn begin_processing(_handler: HandlerT, _from: NodeT) {}

#[cfg(feature = "trace")]
#[inline]
pub fn end_processing(_handler: HandlerT, _from: NodeT) {
    EVENTS_ENDED.fetch_add(1, Ordering::Relaxed);
}

#[cfg(not(feature = "trace"))]
#[inline]
pub fn end_processing(_handler: HandlerT, _from: NodeT) {}

#[cfg(feature = "trace")]
pub fn counts() -> (u64, u64) {
    (
        EVENTS_BEGUN.load(Ordering::Relaxed),
        EVENTS_ENDED.load(Ordering::Relaxed),
    )
}
