/// Small integer drawn from a private enum, carried by the transport
/// alongside each send. Epoch identity deliberately does *not* live here
/// (see `net::wire`) — it travels inside the envelope so the tag space
/// stays small regardless of how many epochs a run opens.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// An eager active-message envelope plus body.
    ActiveMsg = 0,
    /// The control half of a rendezvous send: handler, size, data tag.
    PutControl = 1,
    /// The payload half of a rendezvous send, posted against a `PutControl`.
    PutData = 2,
    /// One chunk of a message too large for a single send.
    Chunk = 3,
}

impl From<Tag> for u8 {
    #[inline]
    fn from(tag: Tag) -> u8 {
        tag as u8
    }
}

impl Tag {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Tag> {
        match value {
            0 => Some(Tag::ActiveMsg),
            1 => Some(Tag::PutControl),
            2 => Some(Tag::PutData),
            3 => Some(Tag::Chunk),
            _ => None,
        }
    }
}
