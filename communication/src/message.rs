//! Message framing for the fabric.
//!
//! Each transmission is a fixed-size little-endian header followed by
//! `length` payload bytes. A header with `length == 0` is the clean-shutdown
//! sentinel for a stream. The payload is a length-prefixed ASCII registry
//! identifier followed by the bincode-encoded action body.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Framing data for one payload: the source and destination ranks, the
/// payload length in bytes, and a per-stream sequence number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Rank of the sending process.
    pub source: u32,
    /// Rank of the receiving process.
    pub target: u32,
    /// Number of payload bytes that follow the header.
    pub length: u32,
    /// Sequence number within the (source, target) stream.
    pub seqno: u32,
}

impl MessageHeader {
    /// The encoded size of a header.
    pub const BYTES: usize = 16;

    /// Writes the header as little-endian binary data.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.source)?;
        writer.write_u32::<LittleEndian>(self.target)?;
        writer.write_u32::<LittleEndian>(self.length)?;
        writer.write_u32::<LittleEndian>(self.seqno)?;
        Ok(())
    }

    /// Reads a header from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let source = reader.read_u32::<LittleEndian>()?;
        let target = reader.read_u32::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;
        let seqno = reader.read_u32::<LittleEndian>()?;
        Ok(MessageHeader { source, target, length, seqno })
    }

    /// The number of bytes required for the header and its payload.
    pub fn required_bytes(&self) -> usize {
        Self::BYTES + self.length as usize
    }
}

/// Assembles one payload: length-prefixed registry identifier, then body.
pub fn frame(id: &str, body: &[u8]) -> Vec<u8> {
    debug_assert!(id.is_ascii());
    let mut bytes = Vec::with_capacity(4 + id.len() + body.len());
    bytes
        .write_u32::<LittleEndian>(id.len() as u32)
        .expect("writes to a Vec do not fail");
    bytes.extend_from_slice(id.as_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Splits a payload back into its registry identifier and body.
///
/// A malformed payload is fatal: it means the peers disagree about the wire
/// format, which cannot be recovered from.
pub fn split_frame(bytes: &[u8]) -> (&str, &[u8]) {
    let mut prefix = &bytes[..4];
    let id_len = prefix
        .read_u32::<LittleEndian>()
        .expect("payload shorter than its identifier prefix") as usize;
    let id = std::str::from_utf8(&bytes[4..4 + id_len]).expect("registry identifier is not ASCII");
    (id, &bytes[4 + id_len..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = MessageHeader { source: 3, target: 7, length: 1024, seqno: 42 };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), MessageHeader::BYTES);
        let read = MessageHeader::read_from(&mut &bytes[..]).unwrap();
        assert_eq!(read, header);
    }

    #[test]
    fn frame_round_trip() {
        let bytes = frame("0123456789abcdef/evaluate", b"payload");
        let (id, body) = split_frame(&bytes);
        assert_eq!(id, "0123456789abcdef/evaluate");
        assert_eq!(body, b"payload");
    }
}
