//! Collective algorithms over the spanning tree (4.11): reduce, barrier,
//! and the termination probe wave. Broadcast itself is
//! `ActiveMessenger::broadcast_msg`; reduce, barrier, and the probe wave
//! live here because each needs a registered control handler plus an
//! id-keyed accumulator table, which broadcast doesn't.
//!
//! Every rank taking part in a given `(scope, sequence)`-stamped
//! collective must call in (`reduce_bytes`/`barrier`) before any of its
//! children's contributions can be folded in — the accumulator table
//! below has no buffering for contributions that arrive before their
//! parent has seeded its own entry. That's fine for the call pattern
//! every collective here actually uses (every rank enters at
//! corresponding points), but it is not a general out-of-order-safe
//! reduction.
//!
//! The termination probe (4.7/4.11) is the exception: no rank "calls in"
//! from application code. The root drives it unilaterally, broadcasting
//! a probe down the tree and folding each rank's `term::local_snapshot`
//! back up through the same up-phase machinery `reduce_bytes` uses,
//! closing the loop `term.rs`'s doc comment describes — that module owns
//! the counters and the wave's balance decision, this module owns who
//! sends what to whom.

use crate::envelope::MessageKind;
use crate::epoch::EpochT;
use crate::handler::{self, HandlerT};
use crate::message::MsgPtr;
use crate::messenger::{self, ActiveMessenger};
use crate::node::NodeT;
use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// `(scope, sequence)` stamp identifying one collective instance (4.11).
pub type CollectiveId = (u64, u64);

#[derive(Serialize, Deserialize)]
struct ReduceFrame {
    id: CollectiveId,
    bytes: Vec<u8>,
}

struct ReduceState {
    expected_children: usize,
    received: usize,
    accum: Vec<u8>,
    combine: fn(&[u8], &[u8]) -> Vec<u8>,
    on_root_done: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
}

lazy_static! {
    static ref REDUCTIONS: Mutex<HashMap<CollectiveId, ReduceState>> = Mutex::new(HashMap::new());
}

fn reduce_handler_id() -> HandlerT {
    lazy_static! {
        static ref ID: HandlerT = handler::register_active_fn(reduce_control_fn);
    }
    *ID
}

fn reduce_control_fn(_from: NodeT, bytes: &[u8]) {
    let frame: ReduceFrame = serde_json::from_slice(bytes).expect("malformed reduce frame");
    let merged = {
        let mut table = REDUCTIONS.lock().unwrap();
        match table.get_mut(&frame.id) {
            Some(state) => {
                state.accum = (state.combine)(&state.accum, &frame.bytes);
                state.received += 1;
                state.received >= state.expected_children
            }
            None => false,
        }
    };
    if merged {
        if let Some(messenger) = messenger::current_messenger() {
            forward_or_finish(messenger, frame.id);
        }
    }
}

/// Contributes `local_bytes` to the reduction identified by `id`, using
/// `combine` (an associative, commutative-in-practice fold per 4.11) to
/// merge children's contributions in as they arrive. `on_root_done` runs
/// exactly once, only on the tree's root, once every rank's contribution
/// has been folded in.
pub fn reduce_bytes(
    messenger: &mut ActiveMessenger,
    id: CollectiveId,
    local_bytes: Vec<u8>,
    combine: fn(&[u8], &[u8]) -> Vec<u8>,
    on_root_done: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
) {
    let me = messenger.me();
    let expected_children = messenger.world_tree().children(me).len();
    {
        let mut table = REDUCTIONS.lock().unwrap();
        table.insert(
            id,
            ReduceState {
                expected_children,
                received: 0,
                accum: local_bytes,
                combine,
                on_root_done,
            },
        );
    }
    forward_or_finish(messenger, id);
}

fn forward_or_finish(messenger: &mut ActiveMessenger, id: CollectiveId) {
    let me = messenger.me();
    let ready = {
        let table = REDUCTIONS.lock().unwrap();
        table.get(&id).map_or(false, |s| s.received >= s.expected_children)
    };
    if !ready {
        return;
    }

    let state = {
        let mut table = REDUCTIONS.lock().unwrap();
        table.remove(&id).expect("checked ready above")
    };

    match messenger.world_tree().parent(me) {
        None => {
            if let Some(cont) = state.on_root_done {
                cont(state.accum);
            }
        }
        Some(parent) => {
            let frame = ReduceFrame {
                id,
                bytes: state.accum,
            };
            let msg = MsgPtr::new(MessageKind::Short, frame);
            messenger.send_msg(parent, reduce_handler_id(), msg);
        }
    }
}

fn concat_combine(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = a.to_vec();
    out.extend_from_slice(b);
    out
}

struct ReleaseState {
    on_released: Box<dyn FnOnce() + Send>,
}

lazy_static! {
    static ref RELEASES: Mutex<HashMap<CollectiveId, ReleaseState>> = Mutex::new(HashMap::new());
}

fn release_handler_id() -> HandlerT {
    lazy_static! {
        static ref ID: HandlerT = handler::register_active_fn(release_control_fn);
    }
    *ID
}

fn release_control_fn(_from: NodeT, bytes: &[u8]) {
    let id: CollectiveId = serde_json::from_slice(bytes).expect("malformed release frame");
    if let Some(messenger) = messenger::current_messenger() {
        broadcast_release(messenger, id);
    }
    fire_local_release(id);
}

fn fire_local_release(id: CollectiveId) {
    let state = RELEASES.lock().unwrap().remove(&id);
    if let Some(state) = state {
        (state.on_released)();
    }
}

fn broadcast_release(messenger: &mut ActiveMessenger, id: CollectiveId) {
    let me = messenger.me();
    let tree = messenger.world_tree().clone();
    for child in tree.children(me) {
        let msg = MsgPtr::new(MessageKind::Short, id);
        messenger.send_msg(child, release_handler_id(), msg);
    }
}

/// Up-phase-then-down-phase barrier (4.11): every leaf's reach travels up
/// to the root via the same reduce machinery (combine is a no-op — the
/// payload carries no information, only arrival matters), and the root's
/// completion broadcasts a release back down. `on_released` fires once
/// this rank has seen the release, whether it originated here or arrived
/// from a parent.
pub fn barrier(messenger: &mut ActiveMessenger, id: CollectiveId, on_released: Box<dyn FnOnce() + Send>) {
    RELEASES.lock().unwrap().insert(id, ReleaseState { on_released });

    let root_id = id;
    let on_root_done: Box<dyn FnOnce(Vec<u8>) + Send> = Box::new(move |_accum| {
        if let Some(messenger) = messenger::current_messenger() {
            broadcast_release(messenger, root_id);
        }
        fire_local_release(root_id);
    });

    reduce_bytes(messenger, id, Vec::new(), concat_combine, Some(on_root_done));
}

#[derive(Serialize, Deserialize)]
struct TermReplyFrame {
    epoch: EpochT,
    prod: u64,
    cons: u64,
}

struct TermReplyState {
    expected_children: usize,
    received: usize,
    prod: u64,
    cons: u64,
}

lazy_static! {
    static ref TERM_REPLIES: Mutex<HashMap<EpochT, TermReplyState>> = Mutex::new(HashMap::new());
    /// Epochs with a wave currently in flight, so the scheduler can call
    /// `probe_termination` on every progress tick without flooding the
    /// tree with a new wave before the last one has finished folding up.
    static ref WAVES_IN_FLIGHT: Mutex<HashSet<EpochT>> = Mutex::new(HashSet::new());
}

fn term_probe_handler_id() -> HandlerT {
    lazy_static! {
        static ref ID: HandlerT = handler::register_active_fn(term_probe_control_fn);
    }
    *ID
}

fn term_reply_handler_id() -> HandlerT {
    lazy_static! {
        static ref ID: HandlerT = handler::register_active_fn(term_reply_control_fn);
    }
    *ID
}

fn term_announce_handler_id() -> HandlerT {
    lazy_static! {
        static ref ID: HandlerT = handler::register_active_fn(term_announce_control_fn);
    }
    *ID
}

/// Received on every non-root rank when the probe reaches it: forwards
/// the probe further down this rank's own subtree, then seeds this
/// rank's up-phase entry with its own `local_snapshot` (4.7's per-rank
/// counters) so children's replies have something to fold into.
fn term_probe_control_fn(_from: NodeT, bytes: &[u8]) {
    let epoch: EpochT = serde_json::from_slice(bytes).expect("malformed term probe frame");
    if let Some(messenger) = messenger::current_messenger() {
        let me = messenger.me();
        let tree = messenger.world_tree().clone();
        for child in tree.children(me) {
            let msg = MsgPtr::new(MessageKind::Short, epoch);
            messenger.send_msg(child, term_probe_handler_id(), msg);
        }

        let expected_children = tree.children(me).len();
        let (local_prod, local_cons) = messenger.term_mut().local_snapshot(epoch);
        {
            let mut table = TERM_REPLIES.lock().unwrap();
            table.insert(
                epoch,
                TermReplyState {
                    expected_children,
                    received: 0,
                    prod: local_prod,
                    cons: local_cons,
                },
            );
        }
        forward_term_reply_or_finish(messenger, epoch);
    }
}

/// Received as children's folded snapshots arrive, both on interior
/// ranks (which keep folding and forward further up) and on the root
/// (which closes the wave once every direct child has reported).
fn term_reply_control_fn(_from: NodeT, bytes: &[u8]) {
    let frame: TermReplyFrame = serde_json::from_slice(bytes).expect("malformed term reply frame");
    let ready = {
        let mut table = TERM_REPLIES.lock().unwrap();
        match table.get_mut(&frame.epoch) {
            Some(state) => {
                state.prod += frame.prod;
                state.cons += frame.cons;
                state.received += 1;
                state.received >= state.expected_children
            }
            None => false,
        }
    };
    if ready {
        if let Some(messenger) = messenger::current_messenger() {
            forward_term_reply_or_finish(messenger, frame.epoch);
        }
    }
}

fn forward_term_reply_or_finish(messenger: &mut ActiveMessenger, epoch: EpochT) {
    let me = messenger.me();
    let ready = {
        let table = TERM_REPLIES.lock().unwrap();
        table.get(&epoch).map_or(false, |s| s.received >= s.expected_children)
    };
    if !ready {
        return;
    }

    let state = {
        let mut table = TERM_REPLIES.lock().unwrap();
        table.remove(&epoch).expect("checked ready above")
    };

    match messenger.world_tree().parent(me) {
        Some(parent) => {
            let frame = TermReplyFrame {
                epoch,
                prod: state.prod,
                cons: state.cons,
            };
            let msg = MsgPtr::new(MessageKind::Short, frame);
            messenger.send_msg(parent, term_reply_handler_id(), msg);
        }
        None => {
            // Root: `state.prod`/`state.cons` are the folded total of
            // every descendant (root's own counters already went into
            // `begin_wave`'s snapshot, not into this table).
            messenger.term_mut().merge_child_snapshot(epoch, state.prod, state.cons);
            let terminated = messenger.term_mut().finish_wave(epoch);
            WAVES_IN_FLIGHT.lock().unwrap().remove(&epoch);
            if terminated {
                announce_termination(messenger, epoch);
            }
        }
    }
}

/// Broadcasts the root's termination decision back down the tree so
/// every rank's own `TerminationDetector` — which never independently
/// reaches "terminated" for a multi-rank world, since only the root
/// accumulates the global counts — learns the epoch closed.
fn announce_termination(messenger: &mut ActiveMessenger, epoch: EpochT) {
    let me = messenger.me();
    let tree = messenger.world_tree().clone();
    for child in tree.children(me) {
        let msg = MsgPtr::new(MessageKind::Short, epoch);
        messenger.send_msg(child, term_announce_handler_id(), msg);
    }
}

fn term_announce_control_fn(_from: NodeT, bytes: &[u8]) {
    let epoch: EpochT = serde_json::from_slice(bytes).expect("malformed term announce frame");
    if let Some(messenger) = messenger::current_messenger() {
        messenger.term_mut().accept_probed_termination(epoch);
        announce_termination(messenger, epoch);
    }
}

/// Drives one round of the Mattern-style termination wave (4.7/4.11)
/// for `epoch`, starting from the tree root. A no-op on any other rank,
/// and a no-op if a wave for this epoch is already folding its way up —
/// safe to call unconditionally from every rank on every scheduler
/// progress tick (`Scheduler::progress` does exactly that for every
/// open epoch).
pub fn probe_termination(messenger: &mut ActiveMessenger, epoch: EpochT) {
    let me = messenger.me();
    if messenger.world_tree().parent(me).is_some() {
        return;
    }
    {
        let mut in_flight = WAVES_IN_FLIGHT.lock().unwrap();
        if !in_flight.insert(epoch) {
            return;
        }
    }

    messenger.term_mut().begin_wave(epoch);

    let tree = messenger.world_tree().clone();
    let expected_children = tree.children(me).len();
    {
        let mut table = TERM_REPLIES.lock().unwrap();
        table.insert(
            epoch,
            TermReplyState {
                expected_children,
                received: 0,
                prod: 0,
                cons: 0,
            },
        );
    }
    for child in tree.children(me) {
        let msg = MsgPtr::new(MessageKind::Short, epoch);
        messenger.send_msg(child, term_probe_handler_id(), msg);
    }
    forward_term_reply_or_finish(messenger, epoch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::inproc::InProcessMesh;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Drives every messenger's progress loop until none of them produce
    /// any more ready work — the in-process reference driver for a
    /// multi-rank collective; a real deployment drives the same state
    /// one frame at a time from `Scheduler`'s progress loop instead.
    fn drain_until_quiet(messengers: &mut [ActiveMessenger]) {
        loop {
            let mut any = false;
            for i in 0..messengers.len() {
                let ready = messengers[i].progress();
                if !ready.is_empty() {
                    any = true;
                }
                for runnable in ready {
                    let m = &mut messengers[i];
                    runnable.run(m);
                }
            }
            if !any {
                break;
            }
        }
    }

    #[test]
    fn reduce_to_root_sums_every_ranks_contribution() {
        let world = 4;
        let mut mesh = InProcessMesh::new(world);
        let mut messengers: Vec<ActiveMessenger> = (0..world)
            .map(|r| ActiveMessenger::new(Box::new(mesh.endpoint(r))))
            .collect();

        let total = Arc::new(AtomicUsize::new(0));
        let total2 = total.clone();
        let id = (1, 1);

        fn sum_combine(a: &[u8], b: &[u8]) -> Vec<u8> {
            let x = u32::from_le_bytes(a.try_into().unwrap());
            let y = u32::from_le_bytes(b.try_into().unwrap());
            (x + y).to_le_bytes().to_vec()
        }

        for rank in 0..world {
            let local = (rank as u32 + 1).to_le_bytes().to_vec();
            let done: Option<Box<dyn FnOnce(Vec<u8>) + Send>> = if rank == 0 {
                let total3 = total2.clone();
                Some(Box::new(move |accum: Vec<u8>| {
                    let sum = u32::from_le_bytes(accum.try_into().unwrap());
                    total3.store(sum as usize, Ordering::SeqCst);
                }))
            } else {
                None
            };
            reduce_bytes(&mut messengers[rank as usize], id, local, sum_combine, done);
        }

        drain_until_quiet(&mut messengers);
        assert_eq!(total.load(Ordering::SeqCst), 1 + 2 + 3 + 4);
    }

    #[test]
    fn termination_wave_converges_and_announces_to_every_rank() {
        use crate::epoch::{make_epoch_collective, EpochCategory};
        use crate::handler;

        let world = 2;
        let mut mesh = InProcessMesh::new(world);
        let mut messengers: Vec<ActiveMessenger> = (0..world)
            .map(|r| ActiveMessenger::new(Box::new(mesh.endpoint(r))))
            .collect();

        let h = handler::register_active_fn(|_from, _bytes| {});
        let epoch = make_epoch_collective(EpochCategory::NoCategory);

        messengers[0].push_epoch(epoch);
        let msg = MsgPtr::new(MessageKind::Short, ());
        messengers[0].send_msg(1, h, msg);
        messengers[0].pop_epoch(epoch);

        drain_until_quiet(&mut messengers);
        assert!(!messengers[0].term_mut().terminated(epoch));
        assert!(!messengers[1].term_mut().terminated(epoch));

        // Two consecutive balanced waves are needed to close the epoch
        // (4.7): the first round only primes `global_prod2`/`global_cons2`.
        for _ in 0..4 {
            probe_termination(&mut messengers[0], epoch);
            drain_until_quiet(&mut messengers);
            if messengers[0].term_mut().terminated(epoch) {
                break;
            }
        }

        assert!(messengers[0].term_mut().terminated(epoch));
        assert!(messengers[1].term_mut().terminated(epoch));
    }
}
