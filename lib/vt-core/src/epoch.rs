//! Bit-packed epoch identifiers and allocation (3, 4.7).
//!
//! Grounded in `epoch_manip.cc`/`epoch_manip_make.cc`: an epoch id is a
//! single word with control bits (rooted?, category, root node) and a
//! sequence number; the "archetype" of an epoch is itself with the
//! sequence zeroed, used to key the per-category allocator the way
//! `EpochManip::getTerminatedWindow` keys its windows.

use crate::bits;
use crate::node::NodeT;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;

pub type EpochT = u64;

/// "inherits the sentinel" (4.1): a send with no epoch pushed carries this.
pub const NO_EPOCH: EpochT = 0;

/// The global "any" epoch (3): matches every epoch for bookkeeping that
/// does not care which one it is.
pub const TERM_SENTINEL: EpochT = u64::MAX;

const IS_ROOTED_OFFSET: u32 = 0;
const IS_USER_OFFSET: u32 = 1;
const HAS_CATEGORY_OFFSET: u32 = 2;
const CATEGORY_OFFSET: u32 = 3;
const CATEGORY_WIDTH: u32 = 4;
const NODE_OFFSET: u32 = 7;
const NODE_WIDTH: u32 = 20;
const SEQ_OFFSET: u32 = 27;
const SEQ_WIDTH: u32 = 37;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum EpochCategory {
    NoCategory = 0,
    Insertion = 1,
    Migration = 2,
    UserDefined = 3,
}

impl EpochCategory {
    fn from_bits(bits: u64) -> EpochCategory {
        match bits {
            0 => EpochCategory::NoCategory,
            1 => EpochCategory::Insertion,
            2 => EpochCategory::Migration,
            _ => EpochCategory::UserDefined,
        }
    }
}

/// Builds an archetype (sequence-less) epoch — mirrors `EpochManip::generateEpoch`.
pub fn generate_epoch(is_rooted: bool, is_user: bool, root_node: NodeT, category: EpochCategory) -> EpochT {
    let mut word = 0u64;
    bits::set_bool_field(&mut word, IS_ROOTED_OFFSET, is_rooted);
    bits::set_bool_field(&mut word, IS_USER_OFFSET, is_user);

    let has_category = category != EpochCategory::NoCategory;
    bits::set_bool_field(&mut word, HAS_CATEGORY_OFFSET, has_category);
    if has_category {
        bits::set_field(&mut word, CATEGORY_OFFSET, CATEGORY_WIDTH, category as u64);
    }

    if is_rooted {
        assert_ne!(
            root_node,
            crate::node::UNINITIALIZED_DESTINATION,
            "rooted epoch requires a concrete root node"
        );
        bits::set_field(&mut word, NODE_OFFSET, NODE_WIDTH, root_node as u64);
    }

    set_seq(&mut word, 0);
    word
}

#[inline]
pub fn is_rooted(epoch: EpochT) -> bool {
    bits::get_bool_field(epoch, IS_ROOTED_OFFSET)
}

#[inline]
pub fn is_user(epoch: EpochT) -> bool {
    bits::get_bool_field(epoch, IS_USER_OFFSET)
}

#[inline]
pub fn category(epoch: EpochT) -> EpochCategory {
    if bits::get_bool_field(epoch, HAS_CATEGORY_OFFSET) {
        EpochCategory::from_bits(bits::get_field(epoch, CATEGORY_OFFSET, CATEGORY_WIDTH))
    } else {
        EpochCategory::NoCategory
    }
}

/// The rooting node. Panics if `epoch` is not rooted (mirrors `vtAssert(isRooted(epoch), ...)`).
#[inline]
pub fn root_node(epoch: EpochT) -> NodeT {
    assert!(is_rooted(epoch), "epoch is not rooted");
    bits::get_field(epoch, NODE_OFFSET, NODE_WIDTH) as NodeT
}

#[inline]
pub fn seq(epoch: EpochT) -> u64 {
    bits::get_field(epoch, SEQ_OFFSET, SEQ_WIDTH)
}

#[inline]
pub fn set_seq(epoch: &mut EpochT, value: u64) {
    bits::set_field(epoch, SEQ_OFFSET, SEQ_WIDTH, value);
}

/// The archetype of `epoch`: itself with the sequence zeroed, used as the
/// allocator/window key (`EpochManip::getArchetype`).
#[inline]
pub fn archetype(epoch: EpochT) -> EpochT {
    let mut arch = epoch;
    set_seq(&mut arch, 0);
    arch
}

lazy_static! {
    static ref SEQ_COUNTERS: Mutex<HashMap<EpochT, u64>> = Mutex::new(HashMap::new());
}

/// Allocates the next sequence for the given archetype and stamps it in,
/// mirroring `EpochWindow::allocateNewEpoch`. Each `(rooted?, category,
/// root)` combination gets its own counter.
fn next_sequence(arch: EpochT) -> EpochT {
    let mut counters = SEQ_COUNTERS.lock().expect("epoch sequence counters poisoned");
    let seq_value = counters.entry(arch).or_insert(0);
    *seq_value += 1;
    let mut epoch = arch;
    set_seq(&mut epoch, *seq_value);
    epoch
}

/// Collective epoch: every rank calls this at the same logical point and
/// gets the same id back because the sequence counter advances in lock
/// step with identical call order (4.7).
pub fn make_epoch_collective(category: EpochCategory) -> EpochT {
    let arch = generate_epoch(false, true, crate::node::UNINITIALIZED_DESTINATION, category);
    next_sequence(arch)
}

/// Rooted epoch: only `root_node` mints sequences for it; other ranks
/// learn of the epoch lazily off a received envelope (4.7).
pub fn make_epoch_rooted(root_node: NodeT, category: EpochCategory) -> EpochT {
    let arch = generate_epoch(true, true, root_node, category);
    next_sequence(arch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collective_epochs_get_distinct_sequences() {
        let e1 = make_epoch_collective(EpochCategory::NoCategory);
        let e2 = make_epoch_collective(EpochCategory::NoCategory);
        assert_ne!(e1, e2);
        assert!(!is_rooted(e1));
        assert_eq!(archetype(e1), archetype(e2));
    }

    #[test]
    fn rooted_epoch_carries_root_node() {
        let e = make_epoch_rooted(3, EpochCategory::Insertion);
        assert!(is_rooted(e));
        assert_eq!(root_node(e), 3);
        assert_eq!(category(e), EpochCategory::Insertion);
    }

    #[test]
    #[should_panic(expected = "not rooted")]
    fn root_node_panics_on_collective_epoch() {
        let e = make_epoch_collective(EpochCategory::NoCategory);
        root_node(e);
    }
}
