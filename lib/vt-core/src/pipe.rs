//! Reduced pipe/callback subsystem (4.9): a `Callback` is an addressable
//! handle for a prearranged active message; a `Pipe` multiplexes one
//! signal out to every listener registered on it. The full pipe/callback
//! machinery (chained transforms, anonymous pipes spanning multiple
//! hops) is a user of the core per the purpose and non-goals — what's
//! here is the addressing primitive and the listener-count bookkeeping
//! the rest of it would be built on.

use crate::envelope::MessageKind;
use crate::handler::HandlerT;
use crate::message::{MessageBody, MsgPtr};
use crate::messenger::ActiveMessenger;
use crate::node::NodeT;
use std::collections::HashMap;

/// An addressable handle: triggering it sends a prearranged active
/// message to a fixed `(node, handler)` pair.
#[derive(Debug, Clone, Copy)]
pub struct Callback {
    dest: NodeT,
    handler: HandlerT,
}

impl Callback {
    pub fn new(dest: NodeT, handler: HandlerT) -> Callback {
        Callback { dest, handler }
    }

    pub fn send<T: MessageBody>(&self, messenger: &mut ActiveMessenger, msg: MsgPtr<T>) {
        messenger.send_msg(self.dest, self.handler, msg);
    }
}

pub type PipeId = u64;

/// Whether a pipe disappears after its first signal or stays registered
/// indefinitely (4.9).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Lifetime {
    SingleUse,
    Indefinite,
}

struct PipeState {
    listeners: Vec<Callback>,
    lifetime: Lifetime,
    /// `None` means "no fixed count" — the pipe only closes via
    /// `SingleUse` or an explicit `close`.
    expected_signals: Option<u64>,
    received_signals: u64,
}

/// Tracks every live pipe's listener set and expected-signal count, and
/// garbage-collects a pipe once it's seen everything it's going to (4.9).
#[derive(Default)]
pub struct PipeManager {
    next_id: PipeId,
    pipes: HashMap<PipeId, PipeState>,
}

impl PipeManager {
    pub fn new() -> PipeManager {
        PipeManager {
            next_id: 1,
            pipes: HashMap::new(),
        }
    }

    pub fn create(&mut self, lifetime: Lifetime, expected_signals: Option<u64>) -> PipeId {
        let id = self.next_id;
        self.next_id += 1;
        self.pipes.insert(
            id,
            PipeState {
                listeners: Vec::new(),
                lifetime,
                expected_signals,
                received_signals: 0,
            },
        );
        id
    }

    /// Registers `callback` on `pipe`; panics if `pipe` has already been
    /// garbage-collected — listening on a dead pipe is a usage error.
    pub fn listen(&mut self, pipe: PipeId, callback: Callback) {
        self.pipes
            .get_mut(&pipe)
            .unwrap_or_else(|| panic!("listen on unknown or already-closed pipe {}", pipe))
            .listeners
            .push(callback);
    }

    pub fn listener_count(&self, pipe: PipeId) -> usize {
        self.pipes.get(&pipe).map_or(0, |s| s.listeners.len())
    }

    pub fn is_live(&self, pipe: PipeId) -> bool {
        self.pipes.contains_key(&pipe)
    }

    /// Sends `body` to every listener on `pipe` as a fresh message (not a
    /// shared `MsgPtr`, since each destination gets its own envelope),
    /// then runs the pipe's garbage-collection check.
    pub fn signal<T: MessageBody + Clone>(
        &mut self,
        messenger: &mut ActiveMessenger,
        pipe: PipeId,
        kind: MessageKind,
        body: T,
    ) {
        let listeners = match self.pipes.get(&pipe) {
            Some(state) => state.listeners.clone(),
            None => return,
        };
        for callback in &listeners {
            let msg = MsgPtr::new(kind, body.clone());
            callback.send(messenger, msg);
        }
        self.after_signal(pipe);
    }

    fn after_signal(&mut self, pipe: PipeId) {
        let garbage = {
            let state = match self.pipes.get_mut(&pipe) {
                Some(s) => s,
                None => return,
            };
            state.received_signals += 1;
            let single_use_done = state.lifetime == Lifetime::SingleUse;
            let count_done = state
                .expected_signals
                .map_or(false, |expected| state.received_signals >= expected);
            single_use_done || count_done
        };
        if garbage {
            self.pipes.remove(&pipe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler;
    use crate::net::inproc::InProcessMesh;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn signal_reaches_every_listener_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let h = handler::register_active_fn(move |_from, _bytes| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        let mut mesh = InProcessMesh::new(1);
        let transport = mesh.endpoint(0);
        let mut messenger = ActiveMessenger::new(Box::new(transport));

        let mut pipes = PipeManager::new();
        let pipe = pipes.create(Lifetime::Indefinite, None);
        pipes.listen(pipe, Callback::new(0, h));
        pipes.listen(pipe, Callback::new(0, h));

        pipes.signal(&mut messenger, pipe, MessageKind::Short, 7u32);
        let ready = messenger.progress();
        assert_eq!(ready.len(), 2);
        for r in ready {
            r.run(&mut messenger);
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn single_use_pipe_is_collected_after_its_first_signal() {
        let h = handler::register_active_fn(|_from, _bytes| {});
        let mut mesh = InProcessMesh::new(1);
        let transport = mesh.endpoint(0);
        let mut messenger = ActiveMessenger::new(Box::new(transport));

        let mut pipes = PipeManager::new();
        let pipe = pipes.create(Lifetime::SingleUse, None);
        pipes.listen(pipe, Callback::new(0, h));
        assert!(pipes.is_live(pipe));

        pipes.signal(&mut messenger, pipe, MessageKind::Short, ());
        assert!(!pipes.is_live(pipe));
    }

    #[test]
    fn expected_signal_count_gates_garbage_collection() {
        let h = handler::register_active_fn(|_from, _bytes| {});
        let mut mesh = InProcessMesh::new(1);
        let transport = mesh.endpoint(0);
        let mut messenger = ActiveMessenger::new(Box::new(transport));

        let mut pipes = PipeManager::new();
        let pipe = pipes.create(Lifetime::Indefinite, Some(2));
        pipes.listen(pipe, Callback::new(0, h));

        pipes.signal(&mut messenger, pipe, MessageKind::Short, ());
        assert!(pipes.is_live(pipe));
        pipes.signal(&mut messenger, pipe, MessageKind::Short, ());
        assert!(!pipes.is_live(pipe));
    }
}
