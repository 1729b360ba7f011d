// rookery_protocol — wire protocol for the Rookery session transport.
//
// This crate defines the byte-level vocabulary shared by the session engine
// (`rookery_session`) and client connectors: packet framing, the fixed
// packet header, and the RPC message encoding. It performs no I/O and has no
// dependency on sockets — everything operates on byte slices so the same
// code serves stream reassembly and single-datagram parsing.
//
// Module overview:
// - `types.rs`:  Core ID types — `ClientId`, `AppId`, `Channel`, the
//                admission `ConnectionResponse` code.
// - `header.rs`: The fixed 24-byte packet header and its explicit
//                big-endian codec.
// - `packet.rs`: `Packet` — growable packet buffer with incremental
//                reassembly (`from_bytes`), message reservation
//                (`get_span`), and cursor-based message iteration.
// - `rpc.rs`:    Reserved lifecycle ids, the `RpcMessage` unit, lifecycle
//                message codecs, and the application-supplied
//                `RpcRegistry`.
//
// Design decisions:
// - **Explicit binary layout.** Every field has a fixed width and defined
//   (big-endian) byte order, written through `bytes::{Buf, BufMut}` — no
//   type punning, so the format survives platform changes.
// - **Payloads are opaque.** The transport moves application payload bytes
//   verbatim; value encoding belongs to the layers above.
// - **No async runtime.** Pure byte manipulation, driven by the
//   poll-based session engine.

pub mod header;
pub mod packet;
pub mod rpc;
pub mod types;

pub use header::{HEADER_LEN, PacketHeader};
pub use packet::{MAX_PACKET_SIZE, Packet};
pub use rpc::{
    ClientIdAssignment, CodecError, ConnectionRequest, RpcDirection, RpcId, RpcMessage,
    RpcRegistry, RpcSignature,
};
pub use types::{AppId, Channel, ClientId, ConnectionResponse};
