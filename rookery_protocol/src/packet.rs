// Packet framing and reassembly.
//
// A `Packet` is one unit of wire traffic on either channel: a fixed header
// (`header.rs`) followed by a sequence of length-prefixed messages:
//
// ```text
// [ header (24) | len (2) | message | len (2) | message | ... ]
// ```
//
// Message length prefixes are big-endian `u16`. The header's `length` field
// declares the total packet size, which is how `from_bytes` knows whether it
// has seen the whole packet yet — reliable-channel reads can return a
// partial packet, several packets, or a packet boundary mid-message, and the
// session engine feeds whatever it read into `from_bytes` until the packet
// reports complete. Unreliable datagrams always carry exactly one packet.
//
// The same type is used for building outgoing packets: `get_span` reserves a
// length-prefixed region to encode a message into, and `to_wire` stamps the
// declared length and produces the full wire image. `reset` keeps the header
// version fields so an outgoing packet can be reused across send cycles.

use bytes::{BufMut, Bytes, BytesMut};

use crate::header::{HEADER_LEN, PacketHeader};

/// Hard cap on a declared packet length. Protects against unbounded
/// allocation from malformed or malicious headers.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Size of the per-message length prefix.
pub const MSG_PREFIX_LEN: usize = 2;

/// A reusable packet buffer: header plus length-prefixed message bytes.
#[derive(Debug)]
pub struct Packet {
    /// Header fields. Version fields are set once by the owner; `timestamp`
    /// and `length` are stamped by `to_wire` / the send cycle.
    pub header: PacketHeader,
    body: BytesMut,
    header_buf: [u8; HEADER_LEN],
    header_filled: usize,
    expected_body: Option<usize>,
    malformed: bool,
    cursor: usize,
}

impl Packet {
    pub fn new() -> Packet {
        Packet {
            header: PacketHeader::default(),
            body: BytesMut::new(),
            header_buf: [0; HEADER_LEN],
            header_filled: 0,
            expected_body: None,
            malformed: false,
            cursor: 0,
        }
    }

    /// Consume as many header and message bytes from `src` as this packet
    /// still needs, returning the number of bytes consumed. Bytes beyond the
    /// declared packet length are left untouched — they belong to the next
    /// packet on the stream.
    ///
    /// After the call, `incomplete()` reports whether the declared length
    /// exceeds what has been supplied so far; feed more bytes until it
    /// clears. A declared length that is impossible (smaller than the header)
    /// or larger than [`MAX_PACKET_SIZE`] sets `malformed()` and stops
    /// consuming.
    pub fn from_bytes(&mut self, src: &[u8]) -> usize {
        let mut consumed = 0;
        let mut rest = src;

        if self.header_filled < HEADER_LEN {
            let take = (HEADER_LEN - self.header_filled).min(rest.len());
            self.header_buf[self.header_filled..self.header_filled + take]
                .copy_from_slice(&rest[..take]);
            self.header_filled += take;
            consumed += take;
            rest = &rest[take..];

            if self.header_filled < HEADER_LEN {
                return consumed;
            }

            self.header = PacketHeader::decode(&self.header_buf);
            let declared = self.header.length as usize;
            if declared < HEADER_LEN || declared > MAX_PACKET_SIZE {
                self.malformed = true;
                self.expected_body = Some(0);
            } else {
                self.expected_body = Some(declared - HEADER_LEN);
            }
        }

        let expected = self.expected_body.unwrap_or(0);
        let take = expected.saturating_sub(self.body.len()).min(rest.len());
        self.body.extend_from_slice(&rest[..take]);
        consumed + take
    }

    /// True while fewer header or body bytes have been supplied than the
    /// packet declares. Gates message extraction in the reassembly loop.
    pub fn incomplete(&self) -> bool {
        match self.expected_body {
            None => true,
            Some(expected) => self.body.len() < expected,
        }
    }

    /// True if the declared length was impossible. The stream behind a
    /// malformed packet is desynced and cannot be recovered.
    pub fn malformed(&self) -> bool {
        self.malformed
    }

    /// True if no message bytes have been written or received.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Reserve a length-prefixed region for a new `len`-byte message and
    /// return it for the caller to encode into. `len` must fit a `u16`.
    pub fn get_span(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= u16::MAX as usize);
        self.body.put_u16(len as u16);
        let start = self.body.len();
        self.body.resize(start + len, 0);
        &mut self.body[start..]
    }

    /// Reset the message-read cursor to the first message.
    pub fn start_message_read(&mut self) {
        self.cursor = 0;
    }

    /// Yield the next complete message, advancing the cursor. Returns `None`
    /// when the buffer is exhausted or only a truncated tail remains (a
    /// partially received message is never surfaced).
    pub fn next_message(&mut self) -> Option<&[u8]> {
        if self.cursor + MSG_PREFIX_LEN > self.body.len() {
            return None;
        }
        let len =
            u16::from_be_bytes([self.body[self.cursor], self.body[self.cursor + 1]]) as usize;
        let start = self.cursor + MSG_PREFIX_LEN;
        if start + len > self.body.len() {
            return None;
        }
        self.cursor = start + len;
        Some(&self.body[start..start + len])
    }

    /// Stamp the declared length and return the full wire image
    /// (header + messages).
    pub fn to_wire(&mut self) -> Bytes {
        self.header.length = (HEADER_LEN + self.body.len()) as u32;
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        self.header.encode(&mut out);
        out.extend_from_slice(&self.body);
        out.freeze()
    }

    /// Human-readable dump of the header and each message in hex, for the
    /// optional diagnostic side channel. Does not disturb the read cursor.
    pub fn describe(&self) -> String {
        use std::fmt::Write;

        let h = &self.header;
        let mut out = format!(
            "proto v{} app v{} ts {} sender {} target {} declared {}\n",
            h.protocol_version, h.app_version, h.timestamp, h.sender, h.target, h.length
        );
        let mut cursor = 0;
        let mut index = 0;
        while cursor + MSG_PREFIX_LEN <= self.body.len() {
            let len =
                u16::from_be_bytes([self.body[cursor], self.body[cursor + 1]]) as usize;
            let start = cursor + MSG_PREFIX_LEN;
            if start + len > self.body.len() {
                let _ = writeln!(out, "  [{index}] truncated ({len} declared)");
                break;
            }
            let _ = write!(out, "  [{index}] {len}B:");
            for byte in &self.body[start..start + len] {
                let _ = write!(out, " {byte:02x}");
            }
            out.push('\n');
            cursor = start + len;
            index += 1;
        }
        out
    }

    /// Clear message bytes and reassembly state but keep the header's
    /// version fields — used after sending so the packet can be refilled.
    pub fn reset(&mut self) {
        self.body.clear();
        self.header_filled = 0;
        self.expected_body = None;
        self.malformed = false;
        self.cursor = 0;
    }

    /// Full wipe, header included — used before reading a fresh packet.
    pub fn clear(&mut self) {
        self.reset();
        self.header = PacketHeader::default();
    }
}

impl Default for Packet {
    fn default() -> Packet {
        Packet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientId;

    /// Build a packet with the given messages and return its wire bytes.
    fn wire_with_messages(messages: &[&[u8]]) -> Bytes {
        let mut packet = Packet::new();
        packet.header.protocol_version = 1;
        packet.header.app_version = 1;
        packet.header.sender = ClientId(3);
        for msg in messages {
            packet.get_span(msg.len()).copy_from_slice(msg);
        }
        packet.to_wire()
    }

    /// Collect all messages currently readable from a packet.
    fn collect(packet: &mut Packet) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        packet.start_message_read();
        while let Some(msg) = packet.next_message() {
            out.push(msg.to_vec());
        }
        out
    }

    #[test]
    fn single_read_roundtrip() {
        let wire = wire_with_messages(&[b"hello", b"world!"]);

        let mut packet = Packet::new();
        let consumed = packet.from_bytes(&wire);
        assert_eq!(consumed, wire.len());
        assert!(!packet.incomplete());
        assert_eq!(packet.header.sender, ClientId(3));
        assert_eq!(collect(&mut packet), vec![b"hello".to_vec(), b"world!".to_vec()]);
    }

    #[test]
    fn split_read_reassembles_identically() {
        // A 50-byte message delivered as 20 bytes then the rest must decode
        // exactly as a single delivery would.
        let payload = vec![0xA7u8; 50];
        let wire = wire_with_messages(&[&payload]);

        let mut packet = Packet::new();
        let first = packet.from_bytes(&wire[..20]);
        assert_eq!(first, 20);
        assert!(packet.incomplete());
        assert!(collect(&mut packet).is_empty());

        let second = packet.from_bytes(&wire[20..]);
        assert_eq!(first + second, wire.len());
        assert!(!packet.incomplete());
        assert_eq!(collect(&mut packet), vec![payload]);
    }

    #[test]
    fn byte_by_byte_reassembly() {
        let wire = wire_with_messages(&[b"drip"]);
        let mut packet = Packet::new();
        for b in wire.iter() {
            assert_eq!(packet.from_bytes(std::slice::from_ref(b)), 1);
        }
        assert!(!packet.incomplete());
        assert_eq!(collect(&mut packet), vec![b"drip".to_vec()]);
    }

    #[test]
    fn stops_at_packet_boundary() {
        // Two packets back to back in one read buffer: the first from_bytes
        // pass must stop at the boundary, leaving the rest for a new packet.
        let first_wire = wire_with_messages(&[b"one"]);
        let second_wire = wire_with_messages(&[b"two"]);
        let mut stream = first_wire.to_vec();
        stream.extend_from_slice(&second_wire);

        let mut packet = Packet::new();
        let consumed = packet.from_bytes(&stream);
        assert_eq!(consumed, first_wire.len());
        assert_eq!(collect(&mut packet), vec![b"one".to_vec()]);

        let mut next = Packet::new();
        let consumed2 = next.from_bytes(&stream[consumed..]);
        assert_eq!(consumed2, second_wire.len());
        assert_eq!(collect(&mut next), vec![b"two".to_vec()]);
    }

    #[test]
    fn truncated_tail_not_yielded() {
        let wire = wire_with_messages(&[b"full", b"partial"]);
        // Deliver everything except the last 3 bytes.
        let mut packet = Packet::new();
        packet.from_bytes(&wire[..wire.len() - 3]);
        assert!(packet.incomplete());
        // Only the complete first message is readable.
        assert_eq!(collect(&mut packet), vec![b"full".to_vec()]);
    }

    #[test]
    fn malformed_declared_length_flagged() {
        let mut header_only = Packet::new();
        header_only.header.length = (MAX_PACKET_SIZE + 1) as u32;
        let mut wire = Vec::new();
        header_only.header.encode(&mut wire);

        let mut packet = Packet::new();
        packet.from_bytes(&wire);
        assert!(packet.malformed());
    }

    #[test]
    fn impossible_short_length_flagged() {
        // Declared length below the header size can never be valid.
        let wire = vec![0u8; HEADER_LEN];
        let mut packet = Packet::new();
        packet.from_bytes(&wire);
        assert!(packet.malformed());
    }

    #[test]
    fn reset_keeps_versions_clear_wipes() {
        let mut packet = Packet::new();
        packet.header.protocol_version = 2;
        packet.header.app_version = 9;
        packet.get_span(4).copy_from_slice(b"data");

        packet.reset();
        assert!(packet.is_empty());
        assert_eq!(packet.header.protocol_version, 2);
        assert_eq!(packet.header.app_version, 9);

        packet.clear();
        assert_eq!(packet.header.protocol_version, 0);
    }

    #[test]
    fn message_read_is_restartable() {
        let wire = wire_with_messages(&[b"a", b"b"]);
        let mut packet = Packet::new();
        packet.from_bytes(&wire);

        assert_eq!(collect(&mut packet).len(), 2);
        // A second pass yields the same sequence.
        assert_eq!(collect(&mut packet).len(), 2);
    }

    #[test]
    fn empty_message_allowed() {
        let wire = wire_with_messages(&[b""]);
        let mut packet = Packet::new();
        packet.from_bytes(&wire);
        assert_eq!(collect(&mut packet), vec![Vec::<u8>::new()]);
    }
}
