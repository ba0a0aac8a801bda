//! On-the-wire envelope encoding: `{envelope}{body}{optional inline
//! put}{optional trailing}` (6), fields little-endian, sized for 64-bit
//! ids. Grounded in the byteorder-based `Frame::read`/`ControlFrame::write`
//! pair the teacher used for its own wire frames, generalized from a
//! fixed `Category` enum to the envelope's actual field set and switched
//! to little-endian per the wire protocol's requirement.

use crate::epoch::EpochT;
use crate::handler::HandlerT;
use crate::node::NodeT;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

pub const FLAG_BROADCAST: u8 = 1 << 0;
pub const FLAG_PUT_PRESENT: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum WireKind {
    /// A complete active-message envelope plus body in one send (4.4 decision 1/3).
    Eager = 0,
    /// The first piece of a message chunked under `vt_max_mpi_send_size` (4.4 decision 2).
    ChunkFirst = 1,
    /// A subsequent chunk.
    ChunkRest = 2,
    /// The control half of a rendezvous send (4.4 decision 4).
    PutControl = 3,
}

impl WireKind {
    fn from_u8(v: u8) -> WireKind {
        match v {
            0 => WireKind::Eager,
            1 => WireKind::ChunkFirst,
            2 => WireKind::ChunkRest,
            3 => WireKind::PutControl,
            other => panic!("unrecognized wire kind {}", other),
        }
    }
}

/// Fixed-size header prepended to every frame actually placed on the
/// transport. Distinct from the in-memory `Envelope` (which carries a
/// live atomic refcount and cannot be memcpy'd): this is the POD form
/// that crosses the wire.
#[derive(Debug, Clone, Copy)]
pub struct WireHeader {
    pub kind: WireKind,
    pub dest: NodeT,
    pub src: NodeT,
    pub handler: HandlerT,
    pub epoch: EpochT,
    pub group: u64,
    pub flags: u8,
    pub put_offset: u32,
    pub put_len: u32,
    pub chunk_seq: u64,
    pub chunk_index: u32,
    pub chunk_total: u32,
}

pub const HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 8 + 1 + 4 + 4 + 8 + 4 + 4 + 1;

impl WireHeader {
    pub fn write<W: io::Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u8(self.kind as u8)?;
        w.write_i64::<LittleEndian>(self.dest)?;
        w.write_i64::<LittleEndian>(self.src)?;
        w.write_u64::<LittleEndian>(self.handler)?;
        w.write_u64::<LittleEndian>(self.epoch)?;
        w.write_u64::<LittleEndian>(self.group)?;
        w.write_u8(self.flags)?;
        w.write_u32::<LittleEndian>(self.put_offset)?;
        w.write_u32::<LittleEndian>(self.put_len)?;
        w.write_u64::<LittleEndian>(self.chunk_seq)?;
        w.write_u32::<LittleEndian>(self.chunk_index)?;
        w.write_u32::<LittleEndian>(self.chunk_total)?;
        Ok(())
    }

    pub fn read<R: io::Read>(mut r: R) -> io::Result<WireHeader> {
        let kind = WireKind::from_u8(r.read_u8()?);
        let dest = r.read_i64::<LittleEndian>()?;
        let src = r.read_i64::<LittleEndian>()?;
        let handler = r.read_u64::<LittleEndian>()?;
        let epoch = r.read_u64::<LittleEndian>()?;
        let group = r.read_u64::<LittleEndian>()?;
        let flags = r.read_u8()?;
        let put_offset = r.read_u32::<LittleEndian>()?;
        let put_len = r.read_u32::<LittleEndian>()?;
        let chunk_seq = r.read_u64::<LittleEndian>()?;
        let chunk_index = r.read_u32::<LittleEndian>()?;
        let chunk_total = r.read_u32::<LittleEndian>()?;
        Ok(WireHeader {
            kind,
            dest,
            src,
            handler,
            epoch,
            group,
            flags,
            put_offset,
            put_len,
            chunk_seq,
            chunk_index,
            chunk_total,
        })
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    #[inline]
    pub fn has_put(&self) -> bool {
        self.flags & FLAG_PUT_PRESENT != 0
    }
}

/// Encodes `header` followed by `body` into one contiguous buffer, per
/// the wire format in (6).
pub fn encode_frame(header: &WireHeader, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    header.write(&mut buf).expect("writing to a Vec cannot fail");
    buf.extend_from_slice(body);
    buf
}

/// Splits a frame back into its header and body slice.
pub fn decode_frame(bytes: &[u8]) -> io::Result<(WireHeader, &[u8])> {
    let header = WireHeader::read(bytes)?;
    Ok((header, &bytes[HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_bytes() {
        let header = WireHeader {
            kind: WireKind::Eager,
            dest: 3,
            src: 1,
            handler: 0xdead_beef,
            epoch: 42,
            group: 0,
            flags: FLAG_BROADCAST,
            put_offset: 0,
            put_len: 0,
            chunk_seq: 0,
            chunk_index: 0,
            chunk_total: 0,
        };
        let frame = encode_frame(&header, b"hello");
        let (decoded, body) = decode_frame(&frame).unwrap();
        assert_eq!(decoded.dest, 3);
        assert_eq!(decoded.src, 1);
        assert_eq!(decoded.handler, 0xdead_beef);
        assert_eq!(decoded.epoch, 42);
        assert!(decoded.is_broadcast());
        assert_eq!(body, b"hello");
    }
}
