// Client-side connector for a session.
//
// `SessionClient::connect` performs the two-step admission handshake in
// blocking mode — unreliable request, response code, reliable connect, id
// assignment — and then switches both sockets to non-blocking for the same
// read/send cycle the server side uses:
//
//   client.read();   // drain sockets, update membership, queue messages
//   // ... application work ...
//   client.send();   // flush outgoing packets
//
// Membership and authority are tracked from lifecycle notices on the
// reliable channel; the application observes them through `poll_events`.

use std::collections::{BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use rookery_protocol::rpc::{
    CLIENT_NOTICE_LEN, CONNECTION_REQUEST_LEN, ConnectionRequest, RPC_HEADER_LEN, RpcMessage,
    decode_assignment, decode_client_notice, decode_rpc, encode_client_notice,
    encode_connection_request, encode_rpc, peek_rpc_id,
};
use rookery_protocol::types::{AppId, Channel, ClientId, ConnectionResponse};
use rookery_protocol::{Packet, RpcId};

use crate::transform::{PacketTransform, apply_read_steps, apply_send_steps};

/// How many consecutive `WouldBlock` stalls a reliable write tolerates
/// before the session is considered wedged. Resets on any progress.
const MAX_WRITE_STALLS: u32 = 10;

/// Connection parameters for a [`SessionClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_addr: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub app_id: u64,
    pub protocol_version: u16,
    pub app_version: u16,
    /// Budget for each blocking step of the handshake.
    pub connect_timeout_ms: u64,
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 7878,
            udp_port: 7879,
            app_id: 0,
            protocol_version: 1,
            app_version: 1,
            connect_timeout_ms: 3000,
            read_buffer_size: 8192,
        }
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("admission rejected by the session")]
    Rejected,
    #[error("handshake timed out waiting for the {0}")]
    TimedOut(&'static str),
    #[error("malformed {0} from the session")]
    Malformed(&'static str),
}

/// Session changes observed by a connected client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Another client joined the session.
    ClientConnected(ClientId),
    /// Another client left the session.
    ClientDisconnected(ClientId),
    /// The session authority moved.
    AuthorityMigrated(ClientId),
    /// This client was disconnected (ordered out, or the session closed).
    Disconnected,
}

/// A connected session endpoint on the client side.
pub struct SessionClient {
    config: ClientConfig,
    tcp: TcpStream,
    udp: UdpSocket,
    udp_peer: SocketAddr,
    local_id: ClientId,
    authority: ClientId,
    peers: BTreeSet<ClientId>,
    tcp_packet: Packet,
    udp_packet: Packet,
    read_packet: Packet,
    read_buf: Vec<u8>,
    incoming: VecDeque<RpcMessage>,
    events: VecDeque<ClientEvent>,
    transforms: Vec<Box<dyn PacketTransform>>,
    open: bool,
}

impl SessionClient {
    /// Run the admission handshake and return a connected client.
    pub fn connect(config: ClientConfig) -> Result<SessionClient, ConnectError> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let udp_peer = SocketAddr::new(config.server_addr, config.udp_port);
        let tcp_peer = SocketAddr::new(config.server_addr, config.tcp_port);

        // Step one: the unreliable request, which also tells the session
        // which source port our unreliable traffic will come from.
        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        udp.set_read_timeout(Some(timeout))?;

        let mut request = Packet::new();
        request.header.protocol_version = config.protocol_version;
        request.header.app_version = config.app_version;
        request.header.timestamp = unix_ms();
        encode_connection_request(
            request.get_span(CONNECTION_REQUEST_LEN),
            ConnectionRequest {
                app_id: AppId(config.app_id),
                is_host: false,
            },
        );
        udp.send_to(&request.to_wire(), udp_peer)?;

        let mut buf = vec![0; config.read_buffer_size];
        let len = match udp.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(ConnectError::TimedOut("admission response"));
            }
            Err(e) => return Err(e.into()),
        };
        let mut response = Packet::new();
        response.from_bytes(&buf[..len]);
        response.start_message_read();
        let code = response
            .next_message()
            .filter(|msg| msg.len() == 4)
            .map(|msg| u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]))
            .ok_or(ConnectError::Malformed("admission response"))?;
        if ConnectionResponse::from_code(code) != ConnectionResponse::Accepted {
            return Err(ConnectError::Rejected);
        }

        // Step two: the reliable connection, answered with our id assignment
        // and the current membership.
        let tcp = TcpStream::connect_timeout(&tcp_peer, timeout)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_nodelay(true)?;

        let mut client = SessionClient {
            config,
            tcp,
            udp,
            udp_peer,
            local_id: ClientId::NONE,
            authority: ClientId::NONE,
            peers: BTreeSet::new(),
            tcp_packet: Packet::new(),
            udp_packet: Packet::new(),
            read_packet: Packet::new(),
            read_buf: buf,
            incoming: VecDeque::new(),
            events: VecDeque::new(),
            transforms: Vec::new(),
            open: true,
        };
        client.tcp_packet.header.protocol_version = client.config.protocol_version;
        client.tcp_packet.header.app_version = client.config.app_version;
        client.udp_packet.header.protocol_version = client.config.protocol_version;
        client.udp_packet.header.app_version = client.config.app_version;

        client.await_assignment(timeout)?;

        client.tcp.set_nonblocking(true)?;
        client.udp.set_nonblocking(true)?;
        info!(local = %client.local_id, authority = %client.authority, "session joined");
        Ok(client)
    }

    /// Blockingly reassemble the assignment packet: first message is the id
    /// assignment, any following messages are membership notices.
    fn await_assignment(&mut self, timeout: Duration) -> Result<(), ConnectError> {
        let deadline = Instant::now() + timeout;
        self.read_packet.clear();
        while self.read_packet.incomplete() {
            if Instant::now() >= deadline {
                return Err(ConnectError::TimedOut("id assignment"));
            }
            let len = match self.tcp.read(&mut self.read_buf) {
                Ok(0) => return Err(ConnectError::Malformed("id assignment")),
                Ok(len) => len,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(ConnectError::TimedOut("id assignment"));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.read_packet.from_bytes(&self.read_buf[..len]);
            if self.read_packet.malformed() {
                return Err(ConnectError::Malformed("id assignment"));
            }
        }

        apply_read_steps(&mut self.transforms, &mut self.read_packet);
        self.read_packet.start_message_read();
        let assignment = self
            .read_packet
            .next_message()
            .ok_or(ConnectError::Malformed("id assignment"))
            .and_then(|msg| {
                decode_assignment(msg).map_err(|_| ConnectError::Malformed("id assignment"))
            })?;
        self.local_id = assignment.assigned;
        self.authority = assignment.authority;

        while let Some(msg) = self.read_packet.next_message() {
            if peek_rpc_id(msg) != Ok(RpcId::CLIENT_CONNECTED) {
                continue;
            }
            if let Ok(peer) = decode_client_notice(msg) {
                self.peers.insert(peer);
            }
        }
        self.read_packet.clear();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    pub fn authority(&self) -> ClientId {
        self.authority
    }

    /// True while this client holds the authority role.
    pub fn is_authority(&self) -> bool {
        self.local_id == self.authority
    }

    /// The other clients currently in the session, in id order.
    pub fn peers(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.peers.iter().copied()
    }

    pub fn add_transform(&mut self, step: Box<dyn PacketTransform>) {
        self.transforms.push(step);
    }

    /// Drain messages received since the last call.
    pub fn incoming(&mut self) -> impl Iterator<Item = RpcMessage> + '_ {
        self.incoming.drain(..)
    }

    /// Drain session events observed since the last call.
    pub fn poll_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.events.drain(..)
    }

    /// Queue an RPC invocation with this client as the caller.
    /// [`ClientId::NONE`] as the callee broadcasts.
    pub fn call(&mut self, rpc_id: RpcId, callee: ClientId, channel: Channel, payload: Bytes) {
        let msg = RpcMessage {
            rpc_id,
            caller: self.local_id,
            callee,
            channel,
            payload,
        };
        self.queue_message(&msg);
    }

    /// Queue a pre-built message. The caller field must be this client's id
    /// or the session will drop it on arrival.
    pub fn queue_message(&mut self, msg: &RpcMessage) {
        let len = RPC_HEADER_LEN + msg.payload.len();
        if len > u16::MAX as usize {
            warn!(rpc = ?msg.rpc_id, len, "outgoing message exceeds the per-message limit");
            return;
        }
        let packet = match msg.channel {
            Channel::Reliable => &mut self.tcp_packet,
            Channel::Unreliable => &mut self.udp_packet,
        };
        encode_rpc(packet.get_span(len), msg);
    }

    /// Authority only: order `target` out of the session. The session
    /// ignores this from any other client.
    pub fn order_disconnect(&mut self, target: ClientId) {
        encode_client_notice(
            self.tcp_packet.get_span(CLIENT_NOTICE_LEN),
            RpcId::CLIENT_DISCONNECTED,
            target,
        );
    }

    /// Authority only: hand the authority role to `target`. The session
    /// ignores this from any other client, and ignores unknown targets.
    pub fn order_migration(&mut self, target: ClientId) {
        encode_client_notice(
            self.tcp_packet.get_span(CLIENT_NOTICE_LEN),
            RpcId::HOST_MIGRATION,
            target,
        );
    }

    /// One read pass over both sockets.
    pub fn read(&mut self) {
        if !self.open {
            return;
        }
        self.read_reliable();
        self.read_unreliable();
    }

    /// Flush both outgoing packets if they carry anything.
    pub fn send(&mut self) {
        if !self.open {
            return;
        }
        let timestamp = unix_ms();
        if !self.tcp_packet.is_empty() {
            self.tcp_packet.header.timestamp = timestamp;
            self.tcp_packet.header.sender = self.local_id;
            apply_send_steps(&mut self.transforms, &mut self.tcp_packet);
            let wire = self.tcp_packet.to_wire();
            if let Err(e) = write_all(&mut self.tcp, &wire) {
                warn!(error = %e, "reliable send failed");
                self.close();
            }
            self.tcp_packet.reset();
        }
        if self.open && !self.udp_packet.is_empty() {
            self.udp_packet.header.timestamp = timestamp;
            self.udp_packet.header.sender = self.local_id;
            apply_send_steps(&mut self.transforms, &mut self.udp_packet);
            let wire = self.udp_packet.to_wire();
            let _ = self.udp.send_to(&wire, self.udp_peer);
            self.udp_packet.reset();
        }
    }

    /// Leave the session. Idempotent.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.tcp.shutdown(Shutdown::Both);
        self.events.push_back(ClientEvent::Disconnected);
        info!(local = %self.local_id, "session left");
    }

    fn read_reliable(&mut self) {
        loop {
            let len = match self.tcp.read(&mut self.read_buf) {
                Ok(0) => {
                    // The session closed our stream.
                    self.close();
                    return;
                }
                Ok(len) => len,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "reliable read failed");
                    self.close();
                    return;
                }
            };

            let mut offset = 0;
            while offset < len {
                offset += self.read_packet.from_bytes(&self.read_buf[offset..len]);
                if self.read_packet.malformed() {
                    warn!("malformed packet from the session");
                    self.close();
                    return;
                }
                if self.read_packet.incomplete() {
                    break;
                }
                apply_read_steps(&mut self.transforms, &mut self.read_packet);
                let messages = collect_messages(&mut self.read_packet);
                for msg in messages {
                    self.handle_message(Channel::Reliable, msg);
                    if !self.open {
                        return;
                    }
                }
                self.read_packet.clear();
            }
        }
    }

    fn read_unreliable(&mut self) {
        loop {
            let (len, src) = match self.udp.recv_from(&mut self.read_buf) {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "unreliable read failed");
                    return;
                }
            };
            if src != self.udp_peer {
                continue;
            }
            let mut packet = Packet::new();
            packet.from_bytes(&self.read_buf[..len]);
            if packet.malformed() || packet.incomplete() {
                continue;
            }
            apply_read_steps(&mut self.transforms, &mut packet);
            let messages = collect_messages(&mut packet);
            for msg in messages {
                self.handle_message(Channel::Unreliable, msg);
            }
        }
    }

    /// Lifecycle notices update membership; everything else is queued for
    /// the application.
    fn handle_message(&mut self, channel: Channel, bytes: Bytes) {
        let Ok(rpc_id) = peek_rpc_id(&bytes) else {
            return;
        };
        match rpc_id {
            RpcId::CLIENT_CONNECTED => {
                if let Ok(peer) = decode_client_notice(&bytes) {
                    self.peers.insert(peer);
                    self.events.push_back(ClientEvent::ClientConnected(peer));
                }
            }
            RpcId::CLIENT_DISCONNECTED => {
                if let Ok(peer) = decode_client_notice(&bytes) {
                    if peer == self.local_id {
                        self.close();
                    } else {
                        self.peers.remove(&peer);
                        self.events.push_back(ClientEvent::ClientDisconnected(peer));
                    }
                }
            }
            RpcId::HOST_MIGRATION => {
                if let Ok(new_authority) = decode_client_notice(&bytes) {
                    self.authority = new_authority;
                    self.events
                        .push_back(ClientEvent::AuthorityMigrated(new_authority));
                }
            }
            _ => {
                if !rpc_id.is_user_rpc() {
                    debug!(?rpc_id, "unexpected lifecycle message");
                    return;
                }
                if let Ok(msg) = decode_rpc(&bytes, channel) {
                    self.incoming.push_back(msg);
                }
            }
        }
    }
}

fn collect_messages(packet: &mut Packet) -> Vec<Bytes> {
    let mut out = Vec::new();
    packet.start_message_read();
    while let Some(msg) = packet.next_message() {
        out.push(Bytes::copy_from_slice(msg));
    }
    out
}

fn write_all(stream: &mut TcpStream, mut wire: &[u8]) -> io::Result<()> {
    let mut stalls = 0u32;
    while !wire.is_empty() {
        match stream.write(wire) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                wire = &wire[n..];
                stalls = 0;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                stalls += 1;
                if stalls >= MAX_WRITE_STALLS {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
