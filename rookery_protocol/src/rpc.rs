// RPC message encoding and the reserved lifecycle vocabulary.
//
// Every message inside a packet starts with a `u16` operation id. Ids below
// `RpcId::FIRST_RPC_ID` are reserved for session lifecycle traffic
// (admission, membership notices, migration, object spawn/despawn); the
// application layer assigns its callable operations ids at or above it.
//
// User RPC messages carry a 10-byte header {id (2), caller (4), callee (4)}
// followed by an opaque payload the transport never inspects. Lifecycle
// messages use small fixed layouts defined here. All integers big-endian,
// matching `header.rs`.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::types::{AppId, Channel, ClientId};

/// Operation identifier for one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId(pub u16);

impl RpcId {
    /// A remote client joined the session.
    pub const CLIENT_CONNECTED: RpcId = RpcId(1);
    /// Tells a newly admitted client its own id and the current authority.
    pub const LOCAL_CLIENT_CONNECTED: RpcId = RpcId(2);
    /// A remote client left the session. Sent by the authority it is a
    /// forced disconnect order.
    pub const CLIENT_DISCONNECTED: RpcId = RpcId(3);
    /// The session authority moved to a different client.
    pub const HOST_MIGRATION: RpcId = RpcId(4);
    /// Network object spawn, relayed verbatim (the transport has no object
    /// model).
    pub const NETWORK_OBJECT_SPAWN: RpcId = RpcId(5);
    /// Network object despawn, relayed verbatim.
    pub const NETWORK_OBJECT_DESPAWN: RpcId = RpcId(6);
    /// Unreliable admission handshake request.
    pub const CONNECTION_REQUEST: RpcId = RpcId(7);
    /// First id available to application-defined operations.
    pub const FIRST_RPC_ID: RpcId = RpcId(10);

    /// True for application-assignable ids.
    pub fn is_user_rpc(self) -> bool {
        self >= Self::FIRST_RPC_ID
    }
}

/// Encoded size of the user RPC message header.
pub const RPC_HEADER_LEN: usize = 10;
/// Encoded size of a membership/migration notice.
pub const CLIENT_NOTICE_LEN: usize = 6;
/// Encoded size of the local client id assignment.
pub const ASSIGNMENT_LEN: usize = 10;
/// Encoded size of an admission request.
pub const CONNECTION_REQUEST_LEN: usize = 11;

/// Decode failures. The session engine maps these to silent drops — a
/// malformed message from a peer is never an error surfaced to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("unexpected operation id {0:?}")]
    UnexpectedId(RpcId),
    #[error("id {0:?} is reserved for lifecycle messages")]
    ReservedId(RpcId),
}

/// The decoded form of one relayed message. Ephemeral: built during decode,
/// consumed during dispatch or relay.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcMessage {
    pub rpc_id: RpcId,
    pub caller: ClientId,
    /// [`ClientId::NONE`] means broadcast.
    pub callee: ClientId,
    pub channel: Channel,
    /// Opaque payload bytes, moved verbatim.
    pub payload: Bytes,
}

/// Read the leading operation id without consuming anything else.
pub fn peek_rpc_id(bytes: &[u8]) -> Result<RpcId, CodecError> {
    if bytes.len() < 2 {
        return Err(CodecError::Truncated {
            expected: 2,
            got: bytes.len(),
        });
    }
    Ok(RpcId(u16::from_be_bytes([bytes[0], bytes[1]])))
}

/// Encode a user RPC message header into `span`, which must be exactly
/// [`RPC_HEADER_LEN`] plus the payload length.
pub fn encode_rpc(span: &mut [u8], msg: &RpcMessage) {
    let mut span = &mut span[..];
    span.put_u16(msg.rpc_id.0);
    span.put_u32(msg.caller.0);
    span.put_u32(msg.callee.0);
    span.put_slice(&msg.payload);
}

/// Decode a user RPC message header, returning the id, caller, callee, and
/// payload bytes.
pub fn decode_rpc(bytes: &[u8], channel: Channel) -> Result<RpcMessage, CodecError> {
    if bytes.len() < RPC_HEADER_LEN {
        return Err(CodecError::Truncated {
            expected: RPC_HEADER_LEN,
            got: bytes.len(),
        });
    }
    let mut buf = bytes;
    let rpc_id = RpcId(buf.get_u16());
    let caller = ClientId(buf.get_u32());
    let callee = ClientId(buf.get_u32());
    Ok(RpcMessage {
        rpc_id,
        caller,
        callee,
        channel,
        payload: Bytes::copy_from_slice(buf),
    })
}

/// Payload of a [`RpcId::LOCAL_CLIENT_CONNECTED`] message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIdAssignment {
    /// The id minted for the receiving client.
    pub assigned: ClientId,
    /// The current session authority ([`ClientId::NONE`] when the session
    /// itself is authoritative).
    pub authority: ClientId,
}

/// Encode the id assignment into a span of [`ASSIGNMENT_LEN`] bytes.
pub fn encode_assignment(span: &mut [u8], assignment: ClientIdAssignment) {
    let mut span = &mut span[..];
    span.put_u16(RpcId::LOCAL_CLIENT_CONNECTED.0);
    span.put_u32(assignment.assigned.0);
    span.put_u32(assignment.authority.0);
}

pub fn decode_assignment(bytes: &[u8]) -> Result<ClientIdAssignment, CodecError> {
    if bytes.len() < ASSIGNMENT_LEN {
        return Err(CodecError::Truncated {
            expected: ASSIGNMENT_LEN,
            got: bytes.len(),
        });
    }
    let mut buf = bytes;
    let id = RpcId(buf.get_u16());
    if id != RpcId::LOCAL_CLIENT_CONNECTED {
        return Err(CodecError::UnexpectedId(id));
    }
    Ok(ClientIdAssignment {
        assigned: ClientId(buf.get_u32()),
        authority: ClientId(buf.get_u32()),
    })
}

/// Encode a membership or migration notice ({id, subject client}) into a
/// span of [`CLIENT_NOTICE_LEN`] bytes. Used for client-connected,
/// client-disconnected, and host-migration messages.
pub fn encode_client_notice(span: &mut [u8], id: RpcId, client: ClientId) {
    let mut span = &mut span[..];
    span.put_u16(id.0);
    span.put_u32(client.0);
}

/// Decode the subject client of a membership/migration notice.
pub fn decode_client_notice(bytes: &[u8]) -> Result<ClientId, CodecError> {
    if bytes.len() < CLIENT_NOTICE_LEN {
        return Err(CodecError::Truncated {
            expected: CLIENT_NOTICE_LEN,
            got: bytes.len(),
        });
    }
    Ok(ClientId(u32::from_be_bytes([
        bytes[2], bytes[3], bytes[4], bytes[5],
    ])))
}

/// Admission request carried in the first unreliable datagram from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub app_id: AppId,
    pub is_host: bool,
}

/// Encode an admission request into a span of [`CONNECTION_REQUEST_LEN`]
/// bytes.
pub fn encode_connection_request(span: &mut [u8], request: ConnectionRequest) {
    let mut span = &mut span[..];
    span.put_u16(RpcId::CONNECTION_REQUEST.0);
    span.put_u64(request.app_id.0);
    span.put_u8(u8::from(request.is_host));
}

pub fn decode_connection_request(bytes: &[u8]) -> Result<ConnectionRequest, CodecError> {
    if bytes.len() < CONNECTION_REQUEST_LEN {
        return Err(CodecError::Truncated {
            expected: CONNECTION_REQUEST_LEN,
            got: bytes.len(),
        });
    }
    let mut buf = bytes;
    let id = RpcId(buf.get_u16());
    if id != RpcId::CONNECTION_REQUEST {
        return Err(CodecError::UnexpectedId(id));
    }
    Ok(ConnectionRequest {
        app_id: AppId(buf.get_u64()),
        is_host: buf.get_u8() != 0,
    })
}

/// Which direction an application operation is legal on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcDirection {
    /// Invoked by clients, dispatched at the session authority.
    ClientToAuthority,
    /// Invoked by the authority, delivered to clients.
    AuthorityToClients,
}

/// Application-declared shape of one callable operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcSignature {
    pub direction: RpcDirection,
    /// Whether the invoking peer is included among the recipients.
    pub invoke_on_caller: bool,
}

/// Registry of callable operations, supplied by the application layer and
/// consumed by the session engine for direction enforcement. The transport
/// never owns or inspects the operations themselves.
#[derive(Clone, Debug, Default)]
pub struct RpcRegistry {
    entries: HashMap<RpcId, RpcSignature>,
}

impl RpcRegistry {
    pub fn new() -> RpcRegistry {
        RpcRegistry {
            entries: HashMap::new(),
        }
    }

    /// Register an operation. Ids below [`RpcId::FIRST_RPC_ID`] are reserved
    /// and rejected.
    pub fn register(&mut self, id: RpcId, signature: RpcSignature) -> Result<(), CodecError> {
        if !id.is_user_rpc() {
            return Err(CodecError::ReservedId(id));
        }
        self.entries.insert(id, signature);
        Ok(())
    }

    pub fn get(&self, id: RpcId) -> Option<&RpcSignature> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: RpcId) -> bool {
        self.entries.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_RPC: RpcId = RpcId(42);

    #[test]
    fn rpc_roundtrip() {
        let msg = RpcMessage {
            rpc_id: TEST_RPC,
            caller: ClientId(2),
            callee: ClientId(5),
            channel: Channel::Reliable,
            payload: Bytes::from_static(b"move e2e4"),
        };
        let mut span = vec![0u8; RPC_HEADER_LEN + msg.payload.len()];
        encode_rpc(&mut span, &msg);

        assert_eq!(peek_rpc_id(&span), Ok(TEST_RPC));
        let decoded = decode_rpc(&span, Channel::Reliable).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rpc_truncated_header_rejected() {
        let err = decode_rpc(&[0, 42, 0], Channel::Unreliable).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn assignment_roundtrip() {
        let assignment = ClientIdAssignment {
            assigned: ClientId(4),
            authority: ClientId(1),
        };
        let mut span = vec![0u8; ASSIGNMENT_LEN];
        encode_assignment(&mut span, assignment);
        assert_eq!(decode_assignment(&span), Ok(assignment));
    }

    #[test]
    fn assignment_wrong_id_rejected() {
        let mut span = vec![0u8; ASSIGNMENT_LEN];
        encode_client_notice(&mut span, RpcId::CLIENT_CONNECTED, ClientId(4));
        assert!(matches!(
            decode_assignment(&span),
            Err(CodecError::UnexpectedId(_))
        ));
    }

    #[test]
    fn client_notice_roundtrip() {
        let mut span = vec![0u8; CLIENT_NOTICE_LEN];
        encode_client_notice(&mut span, RpcId::CLIENT_DISCONNECTED, ClientId(9));
        assert_eq!(peek_rpc_id(&span), Ok(RpcId::CLIENT_DISCONNECTED));
        assert_eq!(decode_client_notice(&span), Ok(ClientId(9)));
    }

    #[test]
    fn connection_request_roundtrip() {
        let request = ConnectionRequest {
            app_id: AppId(0xFEED_F00D),
            is_host: false,
        };
        let mut span = vec![0u8; CONNECTION_REQUEST_LEN];
        encode_connection_request(&mut span, request);
        assert_eq!(decode_connection_request(&span), Ok(request));
    }

    #[test]
    fn lifecycle_ids_below_user_range() {
        for id in [
            RpcId::CLIENT_CONNECTED,
            RpcId::LOCAL_CLIENT_CONNECTED,
            RpcId::CLIENT_DISCONNECTED,
            RpcId::HOST_MIGRATION,
            RpcId::NETWORK_OBJECT_SPAWN,
            RpcId::NETWORK_OBJECT_DESPAWN,
            RpcId::CONNECTION_REQUEST,
        ] {
            assert!(!id.is_user_rpc());
        }
        assert!(RpcId::FIRST_RPC_ID.is_user_rpc());
    }

    #[test]
    fn registry_rejects_reserved_ids() {
        let mut registry = RpcRegistry::new();
        let signature = RpcSignature {
            direction: RpcDirection::ClientToAuthority,
            invoke_on_caller: false,
        };
        assert!(matches!(
            registry.register(RpcId::HOST_MIGRATION, signature),
            Err(CodecError::ReservedId(_))
        ));
        registry.register(TEST_RPC, signature).unwrap();
        assert!(registry.contains(TEST_RPC));
        assert_eq!(registry.get(TEST_RPC).unwrap().direction, signature.direction);
    }
}
