// Packet header codec.
//
// Every packet on either channel starts with a fixed 24-byte header:
//
// ```text
// +----------------+----------------+---------------------+
// | proto ver (2)  | app ver (2)    | timestamp (8)       |
// +----------------+----------------+---------------------+
// | sender (4)     | target (4)     | total length (4)    |
// +----------------+----------------+---------------------+
// ```
//
// All fields are big-endian. `length` is the declared size of the whole
// packet including the header itself — the reassembly loop in `packet.rs`
// uses it to know when a packet spanning multiple reads is complete. The
// layout is explicit and versioned through `protocol_version`; fields are
// read and written through `bytes::{Buf, BufMut}`, never reinterpreted from
// raw memory.

use bytes::{Buf, BufMut};

use crate::types::ClientId;

/// Size of the encoded packet header in bytes.
pub const HEADER_LEN: usize = 24;

/// Fixed packet header present on both channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Transport protocol version of the sender.
    pub protocol_version: u16,
    /// Application version of the sender.
    pub app_version: u16,
    /// Unix milliseconds, stamped at send time.
    pub timestamp: i64,
    /// Originating client, or [`ClientId::NONE`] for the session itself.
    pub sender: ClientId,
    /// Destination client, or [`ClientId::NONE`] for broadcast.
    pub target: ClientId,
    /// Declared total packet length, header included.
    pub length: u32,
}

impl PacketHeader {
    /// Encode the header into `buf`. Writes exactly [`HEADER_LEN`] bytes.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.protocol_version);
        buf.put_u16(self.app_version);
        buf.put_i64(self.timestamp);
        buf.put_u32(self.sender.0);
        buf.put_u32(self.target.0);
        buf.put_u32(self.length);
    }

    /// Decode a header from `bytes`, which must hold at least
    /// [`HEADER_LEN`] bytes.
    pub fn decode(mut bytes: &[u8]) -> PacketHeader {
        debug_assert!(bytes.len() >= HEADER_LEN);
        PacketHeader {
            protocol_version: bytes.get_u16(),
            app_version: bytes.get_u16(),
            timestamp: bytes.get_i64(),
            sender: ClientId(bytes.get_u32()),
            target: ClientId(bytes.get_u32()),
            length: bytes.get_u32(),
        }
    }
}
