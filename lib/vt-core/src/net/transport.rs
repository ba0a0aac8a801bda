use crate::net::tag::Tag;
use crate::node::NodeT;
use std::io;

/// A non-blocking poll finding nothing ready is not an error the scheduler
/// should ever see, while anything else is unsurvivable (4.4: "this is
/// not a survivable network — correctness rests on reliable ordered
/// point-to-point").
#[derive(Debug)]
pub enum TransportError {
    Wait,
    Fatal(io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<io::Error> for TransportError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => TransportError::Wait,
            _ => TransportError::Fatal(err),
        }
    }
}

/// One frame handed back by `poll_recv`: which rank it came from, the tag
/// it was posted on, and its raw bytes (envelope-first, per `net::wire`).
pub struct RecvdFrame {
    pub from: NodeT,
    pub tag: Tag,
    pub bytes: Vec<u8>,
}

/// The two-sided, tagged send/recv surface the active messenger drives.
/// Both the in-process mesh (`net::inproc`) and the TCP mesh (`net::tcp`)
/// implement this; the messenger and scheduler never know which.
pub trait Transport {
    /// This process's rank.
    fn me(&self) -> NodeT;

    /// Total ranks in the world communicator.
    fn world_size(&self) -> NodeT;

    /// Send `bytes` to `dest` tagged `tag`. Point-to-point, ordered,
    /// reliable: failures are fatal (see module docs).
    fn send(&mut self, dest: NodeT, tag: Tag, bytes: Vec<u8>) -> TransportResult<()>;

    /// Drive one non-blocking round of progress, returning every frame
    /// that became ready. Never blocks; an empty vec means nothing was
    /// ready this round, not an error.
    fn poll_recv(&mut self) -> Vec<RecvdFrame>;
}
