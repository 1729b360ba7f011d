// The session engine: admission, reassembly, routing, and flushing.
//
// `SessionBuffer` owns both listening sockets, the client registry, and the
// pending-request tracker, and drives everything from a single-threaded
// read/send cycle:
//
//   buffer.read();   // accept, reassemble, route
//   // ... application work ...
//   buffer.send();   // drain outgoing queue, flush per-client packets
//
// All sockets are non-blocking; `WouldBlock` means "nothing ready" and the
// cycle moves on. Admitted peers are the only ones that can make the engine
// do work — traffic from unknown endpoints is either an admission handshake
// or it is dropped without a reply.
//
// The two roles (authoritative server, forwarding relay) differ only in the
// decisions delegated to a `SessionPolicy`; everything else is shared.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use rookery_protocol::rpc::{
    ASSIGNMENT_LEN, CLIENT_NOTICE_LEN, ClientIdAssignment, RPC_HEADER_LEN, RpcDirection,
    RpcMessage, RpcRegistry, decode_client_notice, decode_connection_request, decode_rpc,
    encode_assignment, encode_client_notice, encode_rpc, peek_rpc_id,
};
use rookery_protocol::types::{Channel, ClientId, ConnectionResponse};
use rookery_protocol::{Packet, RpcId};

use crate::config::SessionConfig;
use crate::policy::{AuthorityPolicy, BroadcastRouting, RelayPolicy, SessionPolicy};
use crate::registry::{ClientRecord, ClientRegistry};
use crate::requests::ConnectionRequestTracker;
use crate::transform::{PacketTransform, apply_read_steps, apply_send_steps};

/// How many times a reliable read may stall mid-packet before the peer is
/// considered dead. Stalls between packets are normal and never counted.
const MAX_REASSEMBLY_STALLS: u32 = 10;

/// How many times a reliable write may hit a full send buffer before the
/// peer is considered dead.
const MAX_WRITE_STALLS: u32 = 10;

/// Wire size of an admission response (one 4-byte code message).
const RESPONSE_LEN: usize = 4;

/// Failures surfaced to the embedding application. Peer misbehavior is never
/// in here — malformed or hostile traffic is dropped silently.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("this session role does not support authority migration")]
    MigrationUnsupported,
}

/// Observable session lifecycle changes, drained via
/// [`SessionBuffer::poll_events`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    ClientConnected(ClientId),
    ClientDisconnected(ClientId),
    AuthorityMigrated(ClientId),
}

/// A running session endpoint: sockets, clients, and routing state.
pub struct SessionBuffer {
    config: SessionConfig,
    policy: Box<dyn SessionPolicy>,
    rpcs: RpcRegistry,
    tcp_listener: TcpListener,
    udp_socket: UdpSocket,
    clients: ClientRegistry,
    requests: ConnectionRequestTracker,
    /// Current session authority. [`ClientId::NONE`] when the buffer itself
    /// is authoritative (or the relay's host hasn't connected yet).
    authority: ClientId,
    incoming_tx: Sender<RpcMessage>,
    incoming_rx: Option<Receiver<RpcMessage>>,
    outgoing_tx: Sender<RpcMessage>,
    outgoing_rx: Receiver<RpcMessage>,
    events: VecDeque<SessionEvent>,
    transforms: Vec<Box<dyn PacketTransform>>,
    read_packet: Packet,
    read_buf: Vec<u8>,
    open: bool,
}

impl SessionBuffer {
    /// Bind an authoritative session: broadcast traffic is decoded and
    /// dispatched locally, and the authority role never moves.
    pub fn authoritative(
        config: SessionConfig,
        rpcs: RpcRegistry,
    ) -> Result<SessionBuffer, SessionError> {
        Self::bind(config, rpcs, Box::new(AuthorityPolicy))
    }

    /// Bind a forwarding relay: broadcast traffic is forwarded undecoded,
    /// and the authority role belongs to the host client.
    pub fn relay(config: SessionConfig, rpcs: RpcRegistry) -> Result<SessionBuffer, SessionError> {
        let host_addr = config.host_addr;
        Self::bind(config, rpcs, Box::new(RelayPolicy::new(host_addr)))
    }

    fn bind(
        config: SessionConfig,
        rpcs: RpcRegistry,
        policy: Box<dyn SessionPolicy>,
    ) -> Result<SessionBuffer, SessionError> {
        let tcp_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.tcp_port))?;
        tcp_listener.set_nonblocking(true)?;
        let udp_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.udp_port))?;
        udp_socket.set_nonblocking(true)?;

        info!(
            tcp = %tcp_listener.local_addr()?,
            udp = %udp_socket.local_addr()?,
            "session listening"
        );

        let (incoming_tx, incoming_rx) = mpsc::channel();
        let (outgoing_tx, outgoing_rx) = mpsc::channel();
        let requests = ConnectionRequestTracker::new(config.request_timeout());
        let read_buf = vec![0; config.read_buffer_size];

        Ok(SessionBuffer {
            config,
            policy,
            rpcs,
            tcp_listener,
            udp_socket,
            clients: ClientRegistry::new(),
            requests,
            authority: ClientId::NONE,
            incoming_tx,
            incoming_rx: Some(incoming_rx),
            outgoing_tx,
            outgoing_rx,
            events: VecDeque::new(),
            transforms: Vec::new(),
            read_packet: Packet::new(),
            read_buf,
            open: true,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn authority(&self) -> ClientId {
        self.authority
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn local_tcp_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_listener.local_addr()
    }

    pub fn local_udp_addr(&self) -> io::Result<SocketAddr> {
        self.udp_socket.local_addr()
    }

    /// Append a packet transform step. Steps apply to outgoing packets in
    /// registration order and to incoming packets in reverse.
    pub fn add_transform(&mut self, step: Box<dyn PacketTransform>) {
        self.transforms.push(step);
    }

    /// Queue a message for the next send cycle. The clone of this sender
    /// from [`outgoing_sender`](Self::outgoing_sender) may be used from
    /// other threads; the sockets themselves are only ever touched by the
    /// cycle thread.
    pub fn enqueue(&self, msg: RpcMessage) {
        let _ = self.outgoing_tx.send(msg);
    }

    pub fn outgoing_sender(&self) -> Sender<RpcMessage> {
        self.outgoing_tx.clone()
    }

    /// Drain messages dispatched to the local application since the last
    /// call. Only the authoritative role ever produces these. Empty once the
    /// receiver has been split off with [`take_incoming`](Self::take_incoming).
    pub fn incoming(&mut self) -> impl Iterator<Item = RpcMessage> + '_ {
        self.incoming_rx.iter().flat_map(|rx| rx.try_iter())
    }

    /// Detach the incoming-message receiver, for driving the buffer on a
    /// background thread while the application consumes messages elsewhere.
    pub fn take_incoming(&mut self) -> Option<Receiver<RpcMessage>> {
        self.incoming_rx.take()
    }

    /// Drain lifecycle events observed since the last call.
    pub fn poll_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// One read pass: purge stale admissions, accept reliable connections,
    /// then drain both sockets, routing every complete message.
    pub fn read(&mut self) {
        if !self.open {
            return;
        }
        let purged = self.requests.clear_timeouts();
        if purged > 0 {
            debug!(purged, "purged expired admission requests");
        }
        self.accept_pending();
        self.read_unreliable();
        self.read_reliable();
    }

    /// One send pass: drain the outgoing queue into per-client packets, then
    /// flush every non-empty packet.
    pub fn send(&mut self) {
        if !self.open {
            return;
        }
        while let Ok(msg) = self.outgoing_rx.try_recv() {
            self.queue_message(&msg);
        }
        self.flush();
    }

    /// Accept pending reliable connections. Each must be preceded by a
    /// verified unreliable request from the same address; anything else is
    /// closed without a word.
    fn accept_pending(&mut self) {
        loop {
            let (stream, peer) = match self.tcp_listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };
            let Some(udp_port) = self.requests.take(peer.ip()) else {
                if self.config.diagnostics.connection_attempts {
                    debug!(%peer, "reliable connection without pending request refused");
                }
                drop(stream);
                continue;
            };
            if stream.set_nonblocking(true).is_err() || stream.set_nodelay(true).is_err() {
                continue;
            }

            let id = self.clients.mint_id();
            let udp_addr = SocketAddr::new(peer.ip(), udp_port);
            let mut record = ClientRecord::new(id, stream, udp_addr);
            record.tcp_packet.header.protocol_version = self.config.protocol_version;
            record.tcp_packet.header.app_version = self.config.app_version;
            record.udp_packet.header.protocol_version = self.config.protocol_version;
            record.udp_packet.header.app_version = self.config.app_version;

            if self.policy.claims_authority(peer.ip(), self.authority) {
                self.authority = id;
            }
            info!(client = %id, %peer, authority = %self.authority, "client connected");
            self.events.push_back(SessionEvent::ClientConnected(id));

            // Preload the new client's packet with its id assignment and the
            // current membership, and announce it to everyone already here.
            let assignment = ClientIdAssignment {
                assigned: id,
                authority: self.authority,
            };
            encode_assignment(record.tcp_packet.get_span(ASSIGNMENT_LEN), assignment);
            for (other_id, other) in self.clients.iter_mut() {
                encode_client_notice(
                    record.tcp_packet.get_span(CLIENT_NOTICE_LEN),
                    RpcId::CLIENT_CONNECTED,
                    *other_id,
                );
                encode_client_notice(
                    other.tcp_packet.get_span(CLIENT_NOTICE_LEN),
                    RpcId::CLIENT_CONNECTED,
                    id,
                );
            }

            // Flush immediately so the client learns its id without waiting
            // for the next send cycle. A dead socket here is caught by the
            // normal read path next cycle.
            record.tcp_packet.header.timestamp = unix_ms();
            apply_send_steps(&mut self.transforms, &mut record.tcp_packet);
            let wire = record.tcp_packet.to_wire();
            if let Err(e) = write_wire(&mut record.tcp, &wire) {
                warn!(client = %id, error = %e, "assignment flush failed");
            }
            record.tcp_packet.reset();
            self.clients.insert(record);
        }
    }

    /// Drain the unreliable socket. Datagrams from admitted endpoints carry
    /// session traffic; datagrams from anyone else are admission handshakes
    /// or garbage.
    fn read_unreliable(&mut self) {
        loop {
            let (len, src) = match self.udp_socket.recv_from(&mut self.read_buf) {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "unreliable recv failed");
                    break;
                }
            };
            self.read_packet.clear();
            self.read_packet.from_bytes(&self.read_buf[..len]);
            if self.read_packet.malformed() || self.read_packet.incomplete() {
                continue;
            }
            if self.read_packet.header.protocol_version < self.config.min_protocol_version
                || self.read_packet.header.app_version < self.config.min_app_version
            {
                continue;
            }

            match self.clients.find_by_udp_addr(src) {
                Some(sender) => {
                    if self.config.diagnostics.unreliable_pre_transform {
                        debug!(peer = %src, packet = %self.read_packet.describe(), "unreliable read");
                    }
                    apply_read_steps(&mut self.transforms, &mut self.read_packet);
                    if self.config.diagnostics.unreliable_post_transform {
                        debug!(peer = %src, packet = %self.read_packet.describe(), "unreliable read (transformed)");
                    }
                    let messages = collect_messages(&mut self.read_packet);
                    for msg in messages {
                        self.route_message(Channel::Unreliable, sender, msg);
                    }
                }
                None => self.handle_admission(src),
            }
        }
    }

    /// First contact from an unknown endpoint: expects a single connection
    /// request message and answers with a 4-byte response code. Anything
    /// that isn't a well-formed request gets no reply at all.
    fn handle_admission(&mut self, src: SocketAddr) {
        if !self.policy.may_admit(src.ip(), self.authority) {
            return;
        }
        self.read_packet.start_message_read();
        let Some(first) = self.read_packet.next_message() else {
            return;
        };
        let Ok(request) = decode_connection_request(first) else {
            return;
        };

        let accepted = request.app_id == self.config.app_id()
            && !request.is_host
            && self.clients.len() < self.config.max_clients
            && self.requests.len() < self.config.max_clients;
        if accepted {
            self.requests.add(src);
        }
        if self.config.diagnostics.connection_attempts {
            debug!(peer = %src, accepted, "admission request");
        }

        let response = if accepted {
            ConnectionResponse::Accepted
        } else {
            ConnectionResponse::Rejected
        };
        let mut packet = Packet::new();
        packet.header.protocol_version = self.config.protocol_version;
        packet.header.app_version = self.config.app_version;
        packet.header.timestamp = unix_ms();
        packet
            .get_span(RESPONSE_LEN)
            .copy_from_slice(&response.code().to_be_bytes());
        apply_send_steps(&mut self.transforms, &mut packet);
        let _ = self.udp_socket.send_to(&packet.to_wire(), src);
    }

    /// Drain every client's reliable stream, reassembling packets across
    /// partial reads. A stall between packets is normal; a stall that lasts
    /// mid-packet, a malformed length, or a version below the floor costs
    /// the client its connection.
    fn read_reliable(&mut self) {
        let mut to_drop = Vec::new();

        'clients: for id in self.clients.ids() {
            self.read_packet.clear();
            let mut buffered = 0;
            let mut offset = 0;
            let mut stalls = 0u32;
            let mut packet_started = false;

            loop {
                if offset == buffered {
                    let Some(record) = self.clients.get_mut(id) else {
                        continue 'clients;
                    };
                    match record.tcp.read(&mut self.read_buf) {
                        Ok(0) => {
                            to_drop.push(id);
                            continue 'clients;
                        }
                        Ok(n) => {
                            buffered = n;
                            offset = 0;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            if !packet_started {
                                continue 'clients;
                            }
                            stalls += 1;
                            if stalls >= MAX_REASSEMBLY_STALLS {
                                warn!(client = %id, "peer stalled mid-packet");
                                to_drop.push(id);
                                continue 'clients;
                            }
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => {
                            to_drop.push(id);
                            continue 'clients;
                        }
                    }
                }

                offset += self.read_packet.from_bytes(&self.read_buf[offset..buffered]);
                packet_started = true;
                if self.read_packet.malformed() {
                    // The stream is desynced beyond recovery.
                    warn!(client = %id, "malformed packet on reliable channel");
                    to_drop.push(id);
                    continue 'clients;
                }
                if self.read_packet.incomplete() {
                    continue;
                }
                if self.read_packet.header.protocol_version < self.config.min_protocol_version
                    || self.read_packet.header.app_version < self.config.min_app_version
                {
                    to_drop.push(id);
                    continue 'clients;
                }

                if self.config.diagnostics.reliable_pre_transform {
                    debug!(client = %id, packet = %self.read_packet.describe(), "reliable read");
                }
                apply_read_steps(&mut self.transforms, &mut self.read_packet);
                if self.config.diagnostics.reliable_post_transform {
                    debug!(client = %id, packet = %self.read_packet.describe(), "reliable read (transformed)");
                }
                let messages = collect_messages(&mut self.read_packet);
                for msg in messages {
                    self.route_message(Channel::Reliable, id, msg);
                }
                if !self.open || !self.clients.contains(id) {
                    continue 'clients;
                }
                self.read_packet.clear();
                packet_started = false;
                stalls = 0;
            }
        }

        for id in to_drop {
            self.disconnect_client(id);
        }
    }

    /// Route one received message: authority control traffic first, then
    /// user RPCs by callee and role. Every rejection here is a silent drop.
    fn route_message(&mut self, channel: Channel, sender: ClientId, bytes: Bytes) {
        let Ok(rpc_id) = peek_rpc_id(&bytes) else {
            return;
        };

        // Control traffic is only honored from the authority, and only on
        // the reliable channel.
        if channel == Channel::Reliable && !self.authority.is_none() && sender == self.authority {
            match rpc_id {
                RpcId::CLIENT_DISCONNECTED => {
                    if let Ok(target) = decode_client_notice(&bytes) {
                        info!(client = %target, "authority ordered disconnect");
                        self.disconnect_client(target);
                    }
                    return;
                }
                RpcId::HOST_MIGRATION => {
                    if let Ok(target) = decode_client_notice(&bytes) {
                        let _ = self.migrate_authority(target);
                    }
                    return;
                }
                RpcId::NETWORK_OBJECT_SPAWN | RpcId::NETWORK_OBJECT_DESPAWN => {
                    self.forward_to_all(channel, sender, &bytes);
                    return;
                }
                _ => {}
            }
        }

        if !rpc_id.is_user_rpc() {
            // Lifecycle ids from anyone else are spoofing attempts.
            return;
        }
        let Ok(msg) = decode_rpc(&bytes, channel) else {
            return;
        };
        if msg.caller != sender {
            debug!(claimed = %msg.caller, actual = %sender, "dropped message with spoofed caller");
            return;
        }

        match (msg.callee.is_none(), self.policy.broadcast_routing()) {
            // Broadcast at the authoritative buffer: this buffer is the
            // addressee. Enforce the declared direction before dispatching.
            (true, BroadcastRouting::Dispatch) => match self.rpcs.get(msg.rpc_id) {
                Some(sig) if sig.direction == RpcDirection::ClientToAuthority => {
                    let _ = self.incoming_tx.send(msg);
                }
                _ => {}
            },
            (true, BroadcastRouting::Forward) => self.forward_to_all(channel, sender, &bytes),
            // Directed through the authoritative buffer: re-queued for the
            // callee on the next send cycle.
            (false, BroadcastRouting::Dispatch) => {
                let _ = self.outgoing_tx.send(msg);
            }
            (false, BroadcastRouting::Forward) => self.forward_to(msg.callee, channel, &bytes),
        }
    }

    /// Append raw message bytes to every client's outgoing packet except the
    /// sender's.
    fn forward_to_all(&mut self, channel: Channel, exclude: ClientId, bytes: &[u8]) {
        for (id, record) in self.clients.iter_mut() {
            if *id == exclude {
                continue;
            }
            let packet = match channel {
                Channel::Reliable => &mut record.tcp_packet,
                Channel::Unreliable => &mut record.udp_packet,
            };
            packet.get_span(bytes.len()).copy_from_slice(bytes);
        }
    }

    /// Append raw message bytes to one client's outgoing packet. An unknown
    /// callee is a silent drop.
    fn forward_to(&mut self, callee: ClientId, channel: Channel, bytes: &[u8]) {
        if let Some(record) = self.clients.get_mut(callee) {
            let packet = match channel {
                Channel::Reliable => &mut record.tcp_packet,
                Channel::Unreliable => &mut record.udp_packet,
            };
            packet.get_span(bytes.len()).copy_from_slice(bytes);
        }
    }

    /// Encode one queued outgoing message into the packet(s) it targets.
    fn queue_message(&mut self, msg: &RpcMessage) {
        let len = RPC_HEADER_LEN + msg.payload.len();
        if len > u16::MAX as usize {
            warn!(rpc = ?msg.rpc_id, len, "outgoing message exceeds the per-message limit");
            return;
        }
        if msg.callee.is_none() {
            // The caller only hears its own broadcast when the operation's
            // signature says so.
            let include_caller = self
                .rpcs
                .get(msg.rpc_id)
                .is_some_and(|sig| sig.invoke_on_caller);
            for (id, record) in self.clients.iter_mut() {
                if *id == msg.caller && !include_caller {
                    continue;
                }
                let packet = match msg.channel {
                    Channel::Reliable => &mut record.tcp_packet,
                    Channel::Unreliable => &mut record.udp_packet,
                };
                encode_rpc(packet.get_span(len), msg);
            }
        } else if let Some(record) = self.clients.get_mut(msg.callee) {
            let packet = match msg.channel {
                Channel::Reliable => &mut record.tcp_packet,
                Channel::Unreliable => &mut record.udp_packet,
            };
            encode_rpc(packet.get_span(len), msg);
        }
    }

    /// Flush every non-empty per-client packet. A failed reliable write
    /// disconnects the client; unreliable sends are fire-and-forget.
    fn flush(&mut self) {
        let timestamp = unix_ms();
        let diags = self.config.diagnostics;
        let mut failed = Vec::new();

        for (id, record) in self.clients.iter_mut() {
            if !record.tcp_packet.is_empty() {
                record.tcp_packet.header.timestamp = timestamp;
                if diags.reliable_pre_transform {
                    debug!(client = %id, packet = %record.tcp_packet.describe(), "reliable send");
                }
                apply_send_steps(&mut self.transforms, &mut record.tcp_packet);
                if diags.reliable_post_transform {
                    debug!(client = %id, packet = %record.tcp_packet.describe(), "reliable send (transformed)");
                }
                let wire = record.tcp_packet.to_wire();
                if write_wire(&mut record.tcp, &wire).is_err() {
                    failed.push(*id);
                }
                record.tcp_packet.reset();
            }

            if !record.udp_packet.is_empty() {
                record.udp_packet.header.timestamp = timestamp;
                if diags.unreliable_pre_transform {
                    debug!(client = %id, packet = %record.udp_packet.describe(), "unreliable send");
                }
                apply_send_steps(&mut self.transforms, &mut record.udp_packet);
                if diags.unreliable_post_transform {
                    debug!(client = %id, packet = %record.udp_packet.describe(), "unreliable send (transformed)");
                }
                let wire = record.udp_packet.to_wire();
                let _ = self.udp_socket.send_to(&wire, record.udp_addr);
                record.udp_packet.reset();
            }
        }

        for id in failed {
            self.disconnect_client(id);
        }
    }

    /// Remove a client, notify the others, and resolve the authority role if
    /// it just walked out. Unknown ids are ignored.
    pub fn disconnect_client(&mut self, id: ClientId) {
        if !self.clients.contains(id) {
            return;
        }
        let was_authority = id == self.authority;
        self.drop_client(id);

        if was_authority && self.open {
            if self.policy.supports_migration()
                && self.config.migratable
                && !self.clients.is_empty()
            {
                if let Some(next) = self.clients.first_other(id) {
                    let _ = self.migrate_authority(next);
                }
            } else {
                // The session dies with its authority.
                self.authority = ClientId::NONE;
                self.shutdown();
            }
        }
    }

    /// Remove the record, close its stream, and queue disconnect notices to
    /// everyone remaining. No authority resolution here.
    fn drop_client(&mut self, id: ClientId) {
        let Some(record) = self.clients.remove(id) else {
            return;
        };
        let _ = record.tcp.shutdown(Shutdown::Both);
        info!(client = %id, "client disconnected");
        self.events.push_back(SessionEvent::ClientDisconnected(id));
        for (_, other) in self.clients.iter_mut() {
            encode_client_notice(
                other.tcp_packet.get_span(CLIENT_NOTICE_LEN),
                RpcId::CLIENT_DISCONNECTED,
                id,
            );
        }
    }

    /// Hand the authority role to `new_authority` and notify every client.
    /// On a role that cannot migrate this is an error; an unknown id is
    /// ignored so a stale order cannot disturb the session.
    pub fn migrate_authority(&mut self, new_authority: ClientId) -> Result<(), SessionError> {
        if !self.policy.supports_migration() {
            return Err(SessionError::MigrationUnsupported);
        }
        if !self.clients.contains(new_authority) {
            debug!(target = %new_authority, "migration target unknown, ignoring");
            return Ok(());
        }
        self.authority = new_authority;
        for (_, record) in self.clients.iter_mut() {
            encode_client_notice(
                record.tcp_packet.get_span(CLIENT_NOTICE_LEN),
                RpcId::HOST_MIGRATION,
                new_authority,
            );
        }
        self.events
            .push_back(SessionEvent::AuthorityMigrated(new_authority));
        info!(authority = %new_authority, "authority migrated");
        Ok(())
    }

    /// Close the session: every client is disconnected, the authority last
    /// so departing clients can still observe an intact session.
    pub fn shutdown(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        info!("session closing");

        let mut ids = self.clients.ids();
        ids.sort_by_key(|id| *id == self.authority);
        for id in ids {
            self.drop_client(id);
        }
        self.authority = ClientId::NONE;
    }
}

/// Copy every complete message out of a packet. Collecting first keeps the
/// routing step free to mutate the registry and queues.
fn collect_messages(packet: &mut Packet) -> Vec<Bytes> {
    let mut out = Vec::new();
    packet.start_message_read();
    while let Some(msg) = packet.next_message() {
        out.push(Bytes::copy_from_slice(msg));
    }
    out
}

/// Write a full wire image to a non-blocking stream, tolerating a bounded
/// number of full-buffer stalls.
fn write_wire(stream: &mut TcpStream, mut wire: &[u8]) -> io::Result<()> {
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
                thread::sleep(Duration::from_millis(1));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Milliseconds since the Unix epoch, for packet timestamps.
fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use rookery_protocol::rpc::{CONNECTION_REQUEST_LEN, ConnectionRequest, encode_connection_request};
    use rookery_protocol::types::AppId;

    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            tcp_port: 0,
            udp_port: 0,
            app_id: 0xC0FFEE,
            ..SessionConfig::default()
        }
    }

    /// A raw unreliable endpoint posing as a connecting peer.
    fn peer_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        socket
    }

    fn request_wire(app_id: u64, is_host: bool) -> Bytes {
        let mut packet = Packet::new();
        packet.header.protocol_version = 1;
        packet.header.app_version = 1;
        let request = ConnectionRequest {
            app_id: AppId(app_id),
            is_host,
        };
        encode_connection_request(packet.get_span(CONNECTION_REQUEST_LEN), request);
        packet.to_wire()
    }

    /// Pump the buffer until the peer receives a datagram, then decode the
    /// 4-byte response code.
    fn response_for(buffer: &mut SessionBuffer, peer: &UdpSocket, wire: &[u8]) -> ConnectionResponse {
        peer.send_to(wire, buffer.local_udp_addr().unwrap()).unwrap();
        let mut buf = [0u8; 64];
        let mut attempts = 0;
        let len = loop {
            buffer.read();
            match peer.recv(&mut buf) {
                Ok(len) => break len,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    attempts += 1;
                    assert!(attempts < 50, "no admission response");
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        };
        let mut packet = Packet::new();
        packet.from_bytes(&buf[..len]);
        packet.start_message_read();
        let msg = packet.next_message().unwrap();
        ConnectionResponse::from_code(u32::from_be_bytes(msg.try_into().unwrap()))
    }

    #[test]
    fn migration_refused_on_authoritative_role() {
        let mut buffer =
            SessionBuffer::authoritative(test_config(), RpcRegistry::new()).unwrap();
        assert!(matches!(
            buffer.migrate_authority(ClientId(1)),
            Err(SessionError::MigrationUnsupported)
        ));
    }

    #[test]
    fn migration_to_unknown_id_is_ignored() {
        let mut buffer = SessionBuffer::relay(test_config(), RpcRegistry::new()).unwrap();
        buffer.migrate_authority(ClientId(7)).unwrap();
        assert_eq!(buffer.authority(), ClientId::NONE);
        assert_eq!(buffer.poll_events().count(), 0);
    }

    #[test]
    fn valid_admission_request_accepted() {
        let mut buffer =
            SessionBuffer::authoritative(test_config(), RpcRegistry::new()).unwrap();
        let peer = peer_socket();
        let response = response_for(&mut buffer, &peer, &request_wire(0xC0FFEE, false));
        assert_eq!(response, ConnectionResponse::Accepted);
    }

    #[test]
    fn wrong_app_id_rejected() {
        let mut buffer =
            SessionBuffer::authoritative(test_config(), RpcRegistry::new()).unwrap();
        let peer = peer_socket();
        let response = response_for(&mut buffer, &peer, &request_wire(0xBAD, false));
        assert_eq!(response, ConnectionResponse::Rejected);
    }

    #[test]
    fn host_claim_rejected() {
        // Hosts are identified by address, never by a flag in the request.
        let mut buffer =
            SessionBuffer::authoritative(test_config(), RpcRegistry::new()).unwrap();
        let peer = peer_socket();
        let response = response_for(&mut buffer, &peer, &request_wire(0xC0FFEE, true));
        assert_eq!(response, ConnectionResponse::Rejected);
    }

    #[test]
    fn reliable_version_gate_disconnects() {
        use rookery_protocol::rpc::RpcSignature;

        const OP: RpcId = RpcId(42);
        let mut rpcs = RpcRegistry::new();
        rpcs.register(
            OP,
            RpcSignature {
                direction: RpcDirection::ClientToAuthority,
                invoke_on_caller: false,
            },
        )
        .unwrap();
        let config = SessionConfig {
            protocol_version: 2,
            min_protocol_version: 2,
            ..test_config()
        };
        let mut buffer = SessionBuffer::authoritative(config, rpcs).unwrap();
        let peer = peer_socket();

        // Admit a client at the current version.
        let mut request = Packet::new();
        request.header.protocol_version = 2;
        request.header.app_version = 1;
        encode_connection_request(
            request.get_span(CONNECTION_REQUEST_LEN),
            ConnectionRequest {
                app_id: AppId(0xC0FFEE),
                is_host: false,
            },
        );
        assert_eq!(
            response_for(&mut buffer, &peer, &request.to_wire()),
            ConnectionResponse::Accepted
        );
        let mut tcp = TcpStream::connect(buffer.local_tcp_addr().unwrap()).unwrap();
        for _ in 0..50 {
            buffer.read();
            if buffer.client_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buffer.client_count(), 1);
        buffer.poll_events().for_each(drop);

        // An under-versioned reliable packet carrying an otherwise valid
        // RPC: never dispatched, and the stream is cut.
        let mut stale = Packet::new();
        stale.header.protocol_version = 1;
        stale.header.app_version = 1;
        let msg = RpcMessage {
            rpc_id: OP,
            caller: ClientId(1),
            callee: ClientId::NONE,
            channel: Channel::Reliable,
            payload: Bytes::from_static(b"late"),
        };
        encode_rpc(stale.get_span(RPC_HEADER_LEN + msg.payload.len()), &msg);
        tcp.write_all(&stale.to_wire()).unwrap();

        for _ in 0..50 {
            buffer.read();
            if buffer.client_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buffer.client_count(), 0);
        assert!(buffer.incoming().next().is_none());
        assert!(
            buffer
                .poll_events()
                .any(|e| e == SessionEvent::ClientDisconnected(ClientId(1)))
        );
    }

    #[test]
    fn old_protocol_version_gets_no_response() {
        let config = SessionConfig {
            min_protocol_version: 2,
            ..test_config()
        };
        let mut buffer = SessionBuffer::authoritative(config, RpcRegistry::new()).unwrap();
        let peer = peer_socket();
        peer.send_to(
            &request_wire(0xC0FFEE, false),
            buffer.local_udp_addr().unwrap(),
        )
        .unwrap();

        let mut buf = [0u8; 64];
        for _ in 0..5 {
            buffer.read();
        }
        assert!(peer.recv(&mut buf).is_err());
    }

    #[test]
    fn capacity_rejection() {
        let config = SessionConfig {
            max_clients: 1,
            ..test_config()
        };
        let mut buffer = SessionBuffer::authoritative(config, RpcRegistry::new()).unwrap();
        let first = peer_socket();
        let second = peer_socket();
        let wire = request_wire(0xC0FFEE, false);

        assert_eq!(
            response_for(&mut buffer, &first, &wire),
            ConnectionResponse::Accepted
        );
        // One pending request already fills the single slot.
        assert_eq!(
            response_for(&mut buffer, &second, &wire),
            ConnectionResponse::Rejected
        );
    }

    #[test]
    fn handshake_then_connect_yields_assignment() {
        let mut buffer =
            SessionBuffer::authoritative(test_config(), RpcRegistry::new()).unwrap();
        let peer = peer_socket();
        assert_eq!(
            response_for(&mut buffer, &peer, &request_wire(0xC0FFEE, false)),
            ConnectionResponse::Accepted
        );

        let mut tcp = TcpStream::connect(buffer.local_tcp_addr().unwrap()).unwrap();
        tcp.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        for _ in 0..50 {
            buffer.read();
            if buffer.client_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buffer.client_count(), 1);
        assert_eq!(
            buffer.poll_events().collect::<Vec<_>>(),
            vec![SessionEvent::ClientConnected(ClientId(1))]
        );

        // The assignment packet is flushed at admission, not on the next
        // send cycle.
        let mut buf = [0u8; 256];
        let mut packet = Packet::new();
        while packet.incomplete() {
            let len = tcp.read(&mut buf).unwrap();
            assert!(len > 0);
            packet.from_bytes(&buf[..len]);
        }
        packet.start_message_read();
        let assignment =
            rookery_protocol::rpc::decode_assignment(packet.next_message().unwrap()).unwrap();
        assert_eq!(assignment.assigned, ClientId(1));
        assert_eq!(assignment.authority, ClientId::NONE);
    }

    #[test]
    fn connect_without_handshake_is_refused() {
        let mut buffer =
            SessionBuffer::authoritative(test_config(), RpcRegistry::new()).unwrap();
        let mut tcp = TcpStream::connect(buffer.local_tcp_addr().unwrap()).unwrap();
        tcp.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        for _ in 0..50 {
            buffer.read();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buffer.client_count(), 0);

        // The refused stream is closed without a byte sent.
        let mut buf = [0u8; 16];
        assert_eq!(tcp.read(&mut buf).unwrap(), 0);
    }
}
