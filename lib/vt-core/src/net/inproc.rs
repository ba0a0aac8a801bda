//! A mesh of in-process ranks wired together with `crossbeam-channel`,
//! for demos and tests that want several ranks inside one binary without
//! any real networking underneath. Satisfies the same `Transport` trait
//! the TCP mesh does, so a `Scheduler`/`ActiveMessenger` pair can't tell
//! the difference.

use super::tag::Tag;
use super::transport::{RecvdFrame, Transport, TransportResult};
use crate::node::NodeT;
use crossbeam_channel::{unbounded, Receiver, Sender};

struct Frame {
    from: NodeT,
    tag: Tag,
    bytes: Vec<u8>,
}

/// Owns every rank's inbound channel; `endpoint(rank)` hands out the
/// per-rank handle that actually implements `Transport`.
pub struct InProcessMesh {
    senders: Vec<Sender<Frame>>,
    receivers: Vec<Option<Receiver<Frame>>>,
}

impl InProcessMesh {
    pub fn new(world_size: NodeT) -> InProcessMesh {
        let mut senders = Vec::with_capacity(world_size as usize);
        let mut receivers = Vec::with_capacity(world_size as usize);
        for _ in 0..world_size {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(Some(rx));
        }
        InProcessMesh { senders, receivers }
    }

    /// Hands out rank `rank`'s endpoint. May only be called once per rank
    /// (the receiving half is moved out).
    pub fn endpoint(&mut self, rank: NodeT) -> InProcessEndpoint {
        let receiver = self.receivers[rank as usize]
            .take()
            .unwrap_or_else(|| panic!("endpoint for rank {} already handed out", rank));
        InProcessEndpoint {
            me: rank,
            world_size: self.senders.len() as NodeT,
            senders: self.senders.clone(),
            receiver,
        }
    }
}

pub struct InProcessEndpoint {
    me: NodeT,
    world_size: NodeT,
    senders: Vec<Sender<Frame>>,
    receiver: Receiver<Frame>,
}

impl Transport for InProcessEndpoint {
    fn me(&self) -> NodeT {
        self.me
    }

    fn world_size(&self) -> NodeT {
        self.world_size
    }

    fn send(&mut self, dest: NodeT, tag: Tag, bytes: Vec<u8>) -> TransportResult<()> {
        let frame = Frame {
            from: self.me,
            tag,
            bytes,
        };
        self.senders[dest as usize]
            .send(frame)
            .expect("peer endpoint dropped");
        Ok(())
    }

    fn poll_recv(&mut self) -> Vec<RecvdFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = self.receiver.try_recv() {
            out.push(RecvdFrame {
                from: frame.from,
                tag: frame.tag,
                bytes: frame.bytes,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_is_observed_by_the_destinations_poll_recv() {
        let mut mesh = InProcessMesh::new(2);
        let mut a = mesh.endpoint(0);
        let mut b = mesh.endpoint(1);

        a.send(1, Tag::ActiveMsg, vec![1, 2, 3]).unwrap();
        assert!(b.poll_recv().is_empty() == false);
    }

    #[test]
    fn poll_recv_drains_everything_pending_without_blocking() {
        let mut mesh = InProcessMesh::new(2);
        let mut a = mesh.endpoint(0);
        let mut b = mesh.endpoint(1);

        a.send(1, Tag::ActiveMsg, vec![1]).unwrap();
        a.send(1, Tag::ActiveMsg, vec![2]).unwrap();

        let got = b.poll_recv();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].bytes, vec![1]);
        assert_eq!(got[1].bytes, vec![2]);
        assert!(b.poll_recv().is_empty());
    }
}
