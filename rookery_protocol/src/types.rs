// Core ID types for the session transport.
//
// These are lightweight newtypes shared by the packet codec (`header.rs`,
// `packet.rs`), the RPC layer (`rpc.rs`), and the session engine in
// `rookery_session`. They are transport-scoped identifiers — the session
// authority assigns compact integer IDs to clients at admission time for
// efficient wire representation.

use std::fmt;

/// Session-assigned client ID. Minted by the authority at admission, never
/// reused within a session. The zero value is reserved as [`ClientId::NONE`],
/// denoting absence (no sender) or a broadcast target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    /// Reserved "no client" value. As a callee it means broadcast.
    pub const NONE: ClientId = ClientId(0);

    /// Returns true if this is the reserved NONE value.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "client(none)")
        } else {
            write!(f, "client({})", self.0)
        }
    }
}

/// Application identifier carried in admission requests. Peers from a
/// different application (different ID) are rejected during admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppId(pub u64);

/// Which of the two session channels a message travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Ordered, connection-oriented byte stream (TCP).
    Reliable,
    /// Connectionless datagram path (UDP), demultiplexed by source endpoint.
    Unreliable,
}

/// Result code sent back over the unreliable channel in response to an
/// admission request. Encoded as a 4-byte big-endian integer on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionResponse {
    Accepted,
    Rejected,
}

impl ConnectionResponse {
    /// Wire code for this response.
    pub fn code(self) -> u32 {
        match self {
            ConnectionResponse::Accepted => 0,
            ConnectionResponse::Rejected => 1,
        }
    }

    /// Decode a wire code. Unknown codes are treated as rejections — a
    /// desynced or hostile peer must not be able to fake an acceptance.
    pub fn from_code(code: u32) -> ConnectionResponse {
        match code {
            0 => ConnectionResponse::Accepted,
            _ => ConnectionResponse::Rejected,
        }
    }
}
