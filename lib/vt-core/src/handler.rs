//! Bit-packed global handler identifiers and the table that resolves them
//! back to callables (4.3).
//!
//! Generalizes `identity.rs`'s `custom_type_id!` pattern (a `Mutex`-guarded
//! table assigning stable indices at static-init time) but drops the
//! nightly `static mut` / `type_name` intrinsic plumbing in favor of a
//! `lazy_static` table plus `ctor`-driven registration into a plain
//! `AtomicU64`, which is stable Rust end to end.

use crate::bits;
use crate::node::NodeT;
use lazy_static::lazy_static;
use std::sync::Mutex;

pub type HandlerT = u64;

// Field layout, widest to narrowest: kind(3) | auto(1) | functor(1) |
// trace(1) | base_derived(1) | control(24) | index(33).
const KIND_OFFSET: u32 = 0;
const KIND_WIDTH: u32 = 3;
const AUTO_OFFSET: u32 = 3;
const FUNCTOR_OFFSET: u32 = 4;
const TRACE_OFFSET: u32 = 5;
const BASE_DERIVED_OFFSET: u32 = 6;
const CONTROL_OFFSET: u32 = 7;
const CONTROL_WIDTH: u32 = 24;
const INDEX_OFFSET: u32 = 31;
const INDEX_WIDTH: u32 = 33;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum HandlerKind {
    ActiveFn = 0,
    Functor = 1,
    CollectionMember = 2,
    ObjGroupMember = 3,
    Scatter = 4,
    Map = 5,
    SeedMap = 6,
    IndexGen = 7,
}

impl HandlerKind {
    fn from_bits(bits: u64) -> HandlerKind {
        match bits {
            0 => HandlerKind::ActiveFn,
            1 => HandlerKind::Functor,
            2 => HandlerKind::CollectionMember,
            3 => HandlerKind::ObjGroupMember,
            4 => HandlerKind::Scatter,
            5 => HandlerKind::Map,
            6 => HandlerKind::SeedMap,
            7 => HandlerKind::IndexGen,
            other => panic!("unrecognized handler kind bits: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerFields {
    pub kind: HandlerKind,
    pub auto: bool,
    pub functor: bool,
    pub trace: bool,
    pub base_derived: bool,
    pub control: u64,
    pub index: u64,
}

/// Bit-packs the handler identity fields (4.3).
#[allow(clippy::too_many_arguments)]
pub fn make_handler(
    kind: HandlerKind,
    auto: bool,
    functor: bool,
    trace: bool,
    base_derived: bool,
    control: u64,
    index: u64,
) -> HandlerT {
    let mut word = 0u64;
    bits::set_field(&mut word, KIND_OFFSET, KIND_WIDTH, kind as u64);
    bits::set_bool_field(&mut word, AUTO_OFFSET, auto);
    bits::set_bool_field(&mut word, FUNCTOR_OFFSET, functor);
    bits::set_bool_field(&mut word, TRACE_OFFSET, trace);
    bits::set_bool_field(&mut word, BASE_DERIVED_OFFSET, base_derived);
    bits::set_field(&mut word, CONTROL_OFFSET, CONTROL_WIDTH, control);
    bits::set_field(&mut word, INDEX_OFFSET, INDEX_WIDTH, index);
    word
}

/// Decomposes a handler id back into its fields (4.3: `getHandler` "decomposes the bits").
pub fn decompose(handler: HandlerT) -> HandlerFields {
    HandlerFields {
        kind: HandlerKind::from_bits(bits::get_field(handler, KIND_OFFSET, KIND_WIDTH)),
        auto: bits::get_bool_field(handler, AUTO_OFFSET),
        functor: bits::get_bool_field(handler, FUNCTOR_OFFSET),
        trace: bits::get_bool_field(handler, TRACE_OFFSET),
        base_derived: bits::get_bool_field(handler, BASE_DERIVED_OFFSET),
        control: bits::get_field(handler, CONTROL_OFFSET, CONTROL_WIDTH),
        index: bits::get_field(handler, INDEX_OFFSET, INDEX_WIDTH),
    }
}

/// Callable shape every active-message and functor handler is normalized
/// to: the source rank of the message, and the message body bytes
/// (envelope already stripped off by the caller).
pub type ActiveHandlerFn = Box<dyn Fn(NodeT, &[u8]) + Send + Sync>;

lazy_static! {
    /// Per-kind table, 4.3: "each `register(F)` call appends F to a
    /// per-kind table and returns its integer index." `ActiveFn` and
    /// `Functor` share one dispatch-capable table since both are called
    /// the same way; the remaining kinds (collection/objgroup/scatter/
    /// map/seed-map/index-gen members) belong to the collections and
    /// object-group layers, which this core treats as users, not callers
    /// (1. PURPOSE & SCOPE, Non-goals) — they get stable ids here but no
    /// dispatcher.
    static ref ACTIVE_TABLE: Mutex<Vec<ActiveHandlerFn>> = Mutex::new(Vec::new());
}

/// Registers a plain active-message function, returning its `HandlerT`.
/// Meant to be called once, at static-init time, by `ctor`-driven code
/// (see `vt-core-macros`) so that identical registration order on every
/// rank yields identical ids (4.3 invariant).
pub fn register_active_fn<F>(f: F) -> HandlerT
where
    F: Fn(NodeT, &[u8]) + Send + Sync + 'static,
{
    let mut table = ACTIVE_TABLE.lock().expect("handler table poisoned");
    let index = table.len() as u64;
    table.push(Box::new(f));
    make_handler(HandlerKind::ActiveFn, true, false, false, false, 0, index)
}

/// Registers a zero-sized functor type `T` whose `Functor::call` becomes
/// the handler body. Used by `#[derive(Handler)]`.
pub fn register_functor<T>() -> HandlerT
where
    T: Functor + Default + 'static,
{
    let mut table = ACTIVE_TABLE.lock().expect("handler table poisoned");
    let index = table.len() as u64;
    table.push(Box::new(|from: NodeT, payload: &[u8]| T::default().call(from, payload)));
    make_handler(HandlerKind::Functor, true, true, false, false, 0, index)
}

/// Looks up and invokes the callable behind `handler` (4.3: `getHandler`).
/// Fails the process if `handler` was never registered — envelopes are
/// not self-healing (4.1).
pub fn dispatch(handler: HandlerT, from: NodeT, payload: &[u8]) {
    let fields = decompose(handler);
    let table = ACTIVE_TABLE.lock().expect("handler table poisoned");
    let f = table
        .get(fields.index as usize)
        .unwrap_or_else(|| panic!("no handler registered for id {}", handler));
    f(from, payload);
}

/// Implemented by `#[derive(Handler)]` functor types so call sites can
/// name the handler without threading a raw `HandlerT` through user code.
pub trait AutoHandler {
    fn handler_id() -> HandlerT;
}

/// The trait a `#[derive(Handler)]` functor implements by hand; the
/// derive only wires up registration, not the call body.
pub trait Functor {
    fn call(&self, from: NodeT, payload: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn pack_unpack_roundtrip() {
        let h = make_handler(HandlerKind::Scatter, true, false, true, false, 0x123, 7);
        let fields = decompose(h);
        assert_eq!(fields.kind, HandlerKind::Scatter);
        assert!(fields.auto);
        assert!(!fields.functor);
        assert!(fields.trace);
        assert_eq!(fields.control, 0x123);
        assert_eq!(fields.index, 7);
    }

    #[test]
    fn register_and_dispatch() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let h = register_active_fn(move |from, payload| {
            seen2.store(from as u64 * 1000 + payload[0] as u64, Ordering::SeqCst);
        });
        dispatch(h, 5, &[9]);
        assert_eq!(seen.load(Ordering::SeqCst), 5009);
    }

    #[test]
    #[should_panic(expected = "no handler registered")]
    fn dispatch_unregistered_panics() {
        let bogus = make_handler(HandlerKind::ActiveFn, true, false, false, false, 0, 0xFFFF_FFFF);
        dispatch(bogus, 0, &[]);
    }
}
