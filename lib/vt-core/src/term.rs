//! Epoch termination detection (4.7): a four-counter, Mattern-style
//! consensus algorithm per epoch, plus the hang-detection reporting the
//! scheduler drives when the ready queue goes idle.
//!
//! The cross-rank probe itself — who sends what to whom — is the
//! collective algorithm's job (4.11); this module only owns the counters
//! and the decision of whether a wave closes an epoch. That keeps this
//! file free of any dependency on the messenger or transport, which in
//! turn lets `ActiveMessenger` own a `TerminationDetector` without a
//! cycle back through `collective`.

use crate::epoch::EpochT;
use std::collections::HashMap;

type Action = Box<dyn FnOnce() + Send>;

struct EpochState {
    local_prod: u64,
    local_cons: u64,
    global_prod1: u64,
    global_cons1: u64,
    global_prod2: u64,
    global_cons2: u64,
    wave: u64,
    terminated: bool,
    actions: Vec<Action>,
    last_report: Option<(u64, u64)>,
}

impl Default for EpochState {
    fn default() -> EpochState {
        EpochState {
            local_prod: 0,
            local_cons: 0,
            global_prod1: 0,
            global_cons1: 0,
            global_prod2: 0,
            global_cons2: 0,
            wave: 0,
            terminated: false,
            actions: Vec::new(),
            last_report: None,
        }
    }
}

pub struct TerminationDetector {
    world_size: i64,
    epochs: HashMap<EpochT, EpochState>,
}

impl TerminationDetector {
    pub fn new(world_size: i64) -> TerminationDetector {
        TerminationDetector {
            world_size,
            epochs: HashMap::new(),
        }
    }

    fn entry(&mut self, epoch: EpochT) -> &mut EpochState {
        self.epochs.entry(epoch).or_insert_with(EpochState::default)
    }

    /// Records `n` units of production against `epoch` (a send or an
    /// epoch-opening event). Must happen before the corresponding send is
    /// handed to the transport (4.4, "produce before send").
    pub fn produce(&mut self, epoch: EpochT, n: u64) {
        self.entry(epoch).local_prod += n;
        self.maybe_finish_single_rank(epoch);
    }

    /// Records `n` units of consumption (a handler finishing). Must
    /// happen after the handler runs (4.4, "consume before handler
    /// completion is observed").
    pub fn consume(&mut self, epoch: EpochT, n: u64) {
        self.entry(epoch).local_cons += n;
        self.maybe_finish_single_rank(epoch);
    }

    /// On a single-rank world there is no other rank that could still be
    /// holding an outstanding send, so local balance already *is* global
    /// consensus — no probe round needed.
    fn maybe_finish_single_rank(&mut self, epoch: EpochT) {
        if self.world_size > 1 {
            return;
        }
        let fire = {
            let s = self.entry(epoch);
            !s.terminated && s.local_prod > 0 && s.local_prod == s.local_cons
        };
        if fire {
            self.mark_terminated(epoch);
        }
    }

    pub fn terminated(&self, epoch: EpochT) -> bool {
        self.epochs.get(&epoch).map_or(false, |s| s.terminated)
    }

    /// Every epoch this rank still considers open — what the scheduler's
    /// hang-detection loop reports on every `hang_freq` idle iterations.
    pub fn open_epochs(&self) -> Vec<EpochT> {
        self.epochs
            .iter()
            .filter(|(_, s)| !s.terminated)
            .map(|(epoch, _)| *epoch)
            .collect()
    }

    /// Runs `action` now if `epoch` has already terminated, otherwise
    /// queues it to run the moment it does (4.7, `addAction`).
    pub fn add_action(&mut self, epoch: EpochT, action: Action) {
        if self.terminated(epoch) {
            action();
            return;
        }
        self.entry(epoch).actions.push(action);
    }

    fn mark_terminated(&mut self, epoch: EpochT) {
        let actions = {
            let s = self.entry(epoch);
            if s.terminated {
                return;
            }
            s.terminated = true;
            std::mem::take(&mut s.actions)
        };
        for action in actions {
            action();
        }
    }

    /// The root's snapshot of its own counters at the start of a probe
    /// wave (4.7: "root broadcasts probe, snapshot1").
    pub fn begin_wave(&mut self, epoch: EpochT) {
        let s = self.entry(epoch);
        s.global_prod1 = s.local_prod;
        s.global_cons1 = s.local_cons;
    }

    /// This rank's counters, to be folded into the root's running sum
    /// while the probe is up the tree.
    pub fn local_snapshot(&self, epoch: EpochT) -> (u64, u64) {
        self.epochs
            .get(&epoch)
            .map_or((0, 0), |s| (s.local_prod, s.local_cons))
    }

    /// Root-side fold of a child's snapshot into the current wave's
    /// running total.
    pub fn merge_child_snapshot(&mut self, epoch: EpochT, child_prod: u64, child_cons: u64) {
        let s = self.entry(epoch);
        s.global_prod1 += child_prod;
        s.global_cons1 += child_cons;
    }

    /// Root decides whether the wave just completed closes the epoch:
    /// production must equal consumption, and that balance must hold
    /// unchanged across two consecutive waves (one probe round can catch
    /// a message mid-flight; two can't both miss the same one). Returns
    /// `true` (and fires queued actions) iff the epoch just terminated.
    pub fn finish_wave(&mut self, epoch: EpochT) -> bool {
        let (balanced, repeats_last_wave) = {
            let s = self.entry(epoch);
            let balanced = s.global_prod1 == s.global_cons1;
            let repeats = s.wave > 0 && s.global_prod1 == s.global_prod2 && s.global_cons1 == s.global_cons2;
            (balanced, repeats)
        };

        if balanced && repeats_last_wave {
            self.mark_terminated(epoch);
            return true;
        }

        let s = self.entry(epoch);
        s.global_prod2 = s.global_prod1;
        s.global_cons2 = s.global_cons1;
        s.wave += 1;
        false
    }

    /// Marks `epoch` terminated on this rank because the tree root's
    /// probe wave already closed it (4.7/4.11's cross-rank half of this
    /// detector, driven from `collective::probe_termination`) — the
    /// non-root counterpart to `finish_wave` itself returning `true`.
    /// Fires any actions queued via `add_action`, exactly as the root's
    /// own wave closure does.
    pub fn accept_probed_termination(&mut self, epoch: EpochT) {
        self.mark_terminated(epoch);
    }

    /// Called once per `hang_freq` idle scheduler loops (4.7, hang
    /// detection). Returns `true` if this rank's counters haven't moved
    /// since the last report — the signal the root uses to decide a
    /// rank is stuck.
    pub fn hang_tick(&mut self, epoch: EpochT) -> bool {
        let s = self.entry(epoch);
        let report = (s.local_prod, s.local_cons);
        let stuck = s.last_report == Some(report);
        s.last_report = Some(report);
        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_rank_epoch_terminates_as_soon_as_counts_balance() {
        let mut term = TerminationDetector::new(1);
        let epoch = 7;
        assert!(!term.terminated(epoch));
        term.produce(epoch, 1);
        assert!(!term.terminated(epoch));
        term.consume(epoch, 1);
        assert!(term.terminated(epoch));
    }

    #[test]
    fn add_action_on_terminated_epoch_runs_synchronously() {
        let mut term = TerminationDetector::new(1);
        let epoch = 1;
        term.produce(epoch, 1);
        term.consume(epoch, 1);

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        term.add_action(epoch, Box::new(move || ran2.store(true, std::sync::atomic::Ordering::SeqCst)));
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn add_action_on_open_epoch_waits_for_termination() {
        let mut term = TerminationDetector::new(1);
        let epoch = 1;
        term.produce(epoch, 1);

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        term.add_action(epoch, Box::new(move || ran2.store(true, std::sync::atomic::Ordering::SeqCst)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));

        term.consume(epoch, 1);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn multi_rank_wave_needs_two_consecutive_balanced_rounds() {
        let mut term = TerminationDetector::new(2);
        let epoch = 1;
        term.produce(epoch, 1);

        term.begin_wave(epoch);
        assert!(!term.finish_wave(epoch));

        term.consume(epoch, 1);
        term.begin_wave(epoch);
        assert!(term.finish_wave(epoch));
    }

    #[test]
    fn hang_tick_reports_stuck_once_counters_stop_moving() {
        let mut term = TerminationDetector::new(2);
        let epoch = 1;
        term.produce(epoch, 1);
        assert!(!term.hang_tick(epoch));
        assert!(term.hang_tick(epoch));
    }
}
