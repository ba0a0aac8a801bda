//! Two-sided, point-to-point transport underneath the active messenger.
//!
//! The core never talks MPI directly (a lower-level message-passing
//! transport is assumed, per the purpose and non-goals). What lives here
//! is the thinnest two-sided, tagged send/recv abstraction the messenger
//! needs, plus two implementations: an in-process mesh for tests and
//! demos that run every rank as a thread in one binary, and a TCP mesh
//! for the case where ranks are separate processes.

pub mod buffer;
pub mod inproc;
pub mod tag;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use tag::Tag;
pub use transport::{RecvdFrame, Transport, TransportError, TransportResult};
