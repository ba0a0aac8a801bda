//! One suspend/resume unit of work: a received message, its handler, and
//! the context needed to run it (3, 4.6).

use crate::epoch::EpochT;
use crate::handler::{self, HandlerT};
use crate::messenger::ActiveMessenger;
use crate::node::NodeT;
use crate::{lb, trace};

pub struct Runnable {
    pub payload: Vec<u8>,
    pub handler: HandlerT,
    pub from: NodeT,
    pub epoch: Option<EpochT>,
    pub lb_element_id: Option<u64>,
    pub trace_event: Option<u64>,
}

impl Runnable {
    pub fn new(payload: Vec<u8>, handler: HandlerT, from: NodeT) -> Runnable {
        Runnable {
            payload,
            handler,
            from,
            epoch: None,
            lb_element_id: None,
            trace_event: None,
        }
    }

    pub fn with_epoch(mut self, epoch: EpochT) -> Runnable {
        self.epoch = Some(epoch);
        self
    }

    /// Looks up the handler, pushes the message's epoch on the
    /// messenger's epoch stack, invokes the callable, pops the epoch, and
    /// calls `consume(epoch, 1)` on the termination detector (4.6).
    pub fn run(self, messenger: &mut ActiveMessenger) {
        trace::begin_processing(self.handler, self.from);
        let timer = lb::start_time();

        if let Some(epoch) = self.epoch {
            messenger.push_epoch(epoch);
        }

        messenger.enter_handler_context(self.from, self.handler);
        handler::dispatch(self.handler, self.from, &self.payload);
        messenger.exit_handler_context();

        if let Some(epoch) = self.epoch {
            messenger.pop_epoch(epoch);
            messenger.term_mut().consume(epoch, 1);
        }

        if let Some(element_id) = self.lb_element_id {
            lb::stop_time(element_id, timer);
        }
        trace::end_processing(self.handler, self.from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochCategory;
    use crate::net::inproc::InProcessMesh;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_dispatches_and_consumes_epoch() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let h = handler::register_active_fn(move |_from, _bytes| {
            ran2.store(true, Ordering::SeqCst);
        });

        let mut mesh = InProcessMesh::new(1);
        let transport = mesh.endpoint(0);
        let mut messenger = ActiveMessenger::new(Box::new(transport));
        let epoch = crate::epoch::make_epoch_collective(EpochCategory::NoCategory);
        messenger.term_mut().produce(epoch, 1);

        let runnable = Runnable::new(vec![], h, 0).with_epoch(epoch);
        runnable.run(&mut messenger);

        assert!(ran.load(Ordering::SeqCst));
        assert!(messenger.term_mut().terminated(epoch));
    }
}
