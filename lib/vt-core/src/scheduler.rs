//! The cooperative scheduler (4.5): one ready queue, a list of
//! suspended triggers, and an in-flight counter. Runs a fixed 4-step
//! progress loop: drive transport, move newly-arrived work onto the
//! ready queue and wake any triggers it satisfies, execute a bounded
//! batch of handlers, then check for a hung epoch if nothing moved.

use crate::collective;
use crate::error;
use crate::messenger::ActiveMessenger;
use crate::runnable::Runnable;
use std::time::{Duration, Instant};

/// A suspended condition: `ready` is polled once per loop iteration and,
/// once it returns `true`, `action` runs and the trigger is dropped
/// (4.5, `registerTrigger`).
struct Trigger {
    ready: Box<dyn Fn() -> bool>,
    action: Box<dyn FnOnce() + Send>,
}

pub struct Scheduler {
    ready: Vec<Runnable>,
    suspended: Vec<Trigger>,
    in_flight: u64,
    /// `vt_sched_num_progress`/`vt_sched_progress_han` (6): handlers run
    /// per step-3 batch before yielding back to step 1.
    progress_han: usize,
    /// `vt_sched_progress_sec` (6): wall-clock ceiling on the same batch.
    progress_sec: Duration,
    /// `vt_hang_freq` (6): idle loops between hang-detection reports.
    hang_freq: u64,
    /// `vt_no_detect_hang` (6), inverted for readability at the call site.
    detect_hang: bool,
    idle_loops: u64,
    logger: slog::Logger,
    /// `vt_debug_sched` (6): gates the per-tick progress logging below.
    debug_sched: bool,
    /// `vt_debug_term` (6): gates the hang-check warning in `check_hang`.
    debug_term: bool,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            ready: Vec::new(),
            suspended: Vec::new(),
            in_flight: 0,
            progress_han: 64,
            progress_sec: Duration::from_millis(10),
            hang_freq: 1024,
            detect_hang: true,
            idle_loops: 0,
            logger: vt_support::logging::default_logger(),
            debug_sched: false,
            debug_term: false,
        }
    }

    /// Wires the process-wide logger built at startup into this
    /// scheduler, replacing the standalone default it otherwise builds.
    pub fn set_logger(&mut self, logger: slog::Logger) {
        self.logger = logger;
    }

    /// `vt_debug_sched` (6): turns on per-tick progress tracing.
    pub fn set_debug_sched(&mut self, on: bool) {
        self.debug_sched = on;
    }

    /// `vt_debug_term` (6): turns on the hang-check warning in `check_hang`.
    pub fn set_debug_term(&mut self, on: bool) {
        self.debug_term = on;
    }

    pub fn set_progress_han(&mut self, n: usize) {
        self.progress_han = n;
    }

    pub fn set_progress_sec(&mut self, d: Duration) {
        self.progress_sec = d;
    }

    pub fn set_hang_freq(&mut self, freq: u64) {
        self.hang_freq = freq;
    }

    pub fn set_detect_hang(&mut self, on: bool) {
        self.detect_hang = on;
    }

    /// `enqueue` (4.5): places a unit of work directly on the ready
    /// queue, bypassing the transport (used for locally-generated work
    /// such as a self-send or a resolved continuation).
    pub fn enqueue(&mut self, runnable: Runnable) {
        self.ready.push(runnable);
        self.in_flight += 1;
    }

    /// `registerTrigger` (4.5): runs `action` the first time `ready`
    /// returns `true`, checked once per loop iteration while suspended.
    pub fn register_trigger(&mut self, ready: Box<dyn Fn() -> bool>, action: Box<dyn FnOnce() + Send>) {
        self.suspended.push(Trigger { ready, action });
    }

    /// `isIdle` (4.5): nothing ready to run and nothing waiting on a
    /// condition — the state the hang detector's idle counter tracks.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.suspended.is_empty()
    }

    fn wake_ready_triggers(&mut self) {
        let mut i = 0;
        while i < self.suspended.len() {
            if (self.suspended[i].ready)() {
                let trigger = self.suspended.remove(i);
                (trigger.action)();
            } else {
                i += 1;
            }
        }
    }

    /// One pass of the 4-step progress loop (4.5). Returns the number of
    /// handlers actually executed, so callers (tests, `runSchedulerWhile`)
    /// can tell real progress from an idle spin.
    pub fn progress(&mut self, messenger: &mut ActiveMessenger) -> usize {
        for runnable in messenger.progress() {
            self.enqueue(runnable);
        }

        self.wake_ready_triggers();

        // Drives the cross-rank termination wave (4.7/4.11) for every
        // epoch this rank still considers open. A no-op on any rank
        // other than the tree root, and on the root itself a no-op
        // while the previous wave is still folding up — see
        // `collective::probe_termination`.
        for epoch in messenger.term_mut().open_epochs() {
            collective::probe_termination(messenger, epoch);
        }

        let start = Instant::now();
        let mut executed = 0;
        while executed < self.progress_han && !self.ready.is_empty() {
            let runnable = self.ready.remove(0);
            runnable.run(messenger);
            self.in_flight -= 1;
            executed += 1;
            if start.elapsed() >= self.progress_sec {
                break;
            }
        }

        if executed == 0 && self.is_idle() {
            self.idle_loops += 1;
            if self.debug_sched && self.idle_loops == 1 {
                slog::debug!(self.logger, "scheduler went idle"; "idle_loops" => self.idle_loops);
            }
            if self.detect_hang && self.hang_freq > 0 && self.idle_loops % self.hang_freq == 0 {
                self.check_hang(messenger);
            }
        } else {
            if self.debug_sched && executed > 0 {
                slog::trace!(self.logger, "progress tick"; "executed" => executed);
            }
            self.idle_loops = 0;
        }

        executed
    }

    /// `runSchedulerWhile` (4.5): drives `progress` until `keep_going`
    /// says to stop.
    pub fn run_while(&mut self, messenger: &mut ActiveMessenger, keep_going: impl Fn() -> bool) {
        while keep_going() {
            self.progress(messenger);
        }
    }

    /// Hang detection (4.7, scenario 6): reports this rank's
    /// (production, consumption) pair for every still-open epoch; if an
    /// epoch's counters haven't moved since the last report, the rank is
    /// stuck and — unless `vt_no_detect_hang` suppressed it — the process
    /// aborts naming the epoch.
    fn check_hang(&self, messenger: &mut ActiveMessenger) {
        let open = messenger.term_mut().open_epochs();
        for epoch in open {
            if messenger.term_mut().hang_tick(epoch) {
                if self.debug_term {
                    slog::warn!(self.logger, "termination hang detected"; "epoch" => epoch, "idle_loops" => self.hang_freq);
                }
                error::vt_abort(&format!(
                    "termination hang detected on epoch {}: no production/consumption change in {} idle loops",
                    epoch, self.hang_freq
                ));
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use crate::epoch::{make_epoch_collective, EpochCategory};
    use crate::handler;
    use crate::message::MsgPtr;
    use crate::net::inproc::InProcessMesh;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn progress_runs_a_self_sent_message_exactly_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let h = handler::register_active_fn(move |_from, _bytes| {
            ran2.store(true, Ordering::SeqCst);
        });

        let mut mesh = InProcessMesh::new(1);
        let transport = mesh.endpoint(0);
        let mut messenger = ActiveMessenger::new(Box::new(transport));
        let mut scheduler = Scheduler::new();

        let msg = MsgPtr::new(MessageKind::Short, ());
        messenger.send_msg(0, h, msg);

        let executed = scheduler.progress(&mut messenger);
        assert_eq!(executed, 1);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.progress(&mut messenger), 0);
    }

    #[test]
    fn ping_pong_epoch_terminates_within_a_few_scheduler_iterations() {
        let h = handler::register_active_fn(|_from, _bytes| {});

        let mut mesh = InProcessMesh::new(1);
        let transport = mesh.endpoint(0);
        let mut messenger = ActiveMessenger::new(Box::new(transport));
        let mut scheduler = Scheduler::new();

        let epoch = make_epoch_collective(EpochCategory::NoCategory);
        messenger.push_epoch(epoch);
        let msg = MsgPtr::new(MessageKind::Short, [0u8; 4]);
        messenger.send_msg(0, h, msg);
        messenger.pop_epoch(epoch);

        let mut iterations = 0;
        while !messenger.term_mut().terminated(epoch) && iterations < 4 {
            scheduler.progress(&mut messenger);
            iterations += 1;
        }
        assert!(messenger.term_mut().terminated(epoch));
        assert!(iterations <= 4);
    }

    #[test]
    fn register_trigger_fires_once_its_condition_is_met() {
        let mut mesh = InProcessMesh::new(1);
        let transport = mesh.endpoint(0);
        let mut messenger = ActiveMessenger::new(Box::new(transport));
        let mut scheduler = Scheduler::new();

        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        scheduler.register_trigger(
            Box::new(move || flag2.load(Ordering::SeqCst)),
            Box::new(move || fired2.store(true, Ordering::SeqCst)),
        );

        scheduler.progress(&mut messenger);
        assert!(!fired.load(Ordering::SeqCst));

        flag.store(true, Ordering::SeqCst);
        scheduler.progress(&mut messenger);
        assert!(fired.load(Ordering::SeqCst));
    }
}
