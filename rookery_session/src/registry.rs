// Client registry for a session buffer.
//
// One `ClientRecord` per admitted client: the reliable stream, the
// unreliable peer endpoint, and one outgoing `Packet` per channel. Records
// live in a `BTreeMap` keyed by id so iteration order is stable — the
// "first other connected client" migration heuristic relies on it. All
// mutation happens from the session engine's single-threaded cycle.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream};

use rookery_protocol::{ClientId, Packet};

/// Per-client connection state owned by a session buffer.
#[derive(Debug)]
pub struct ClientRecord {
    pub id: ClientId,
    /// Reliable channel, non-blocking.
    pub tcp: TcpStream,
    /// Where this client's unreliable traffic comes from and goes to.
    pub udp_addr: SocketAddr,
    /// Outgoing reliable packet, flushed by the send cycle.
    pub tcp_packet: Packet,
    /// Outgoing unreliable packet, flushed by the send cycle.
    pub udp_packet: Packet,
}

impl ClientRecord {
    pub fn new(id: ClientId, tcp: TcpStream, udp_addr: SocketAddr) -> ClientRecord {
        ClientRecord {
            id,
            tcp,
            udp_addr,
            tcp_packet: Packet::new(),
            udp_packet: Packet::new(),
        }
    }
}

/// Ordered collection of connected clients with id-minting.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: BTreeMap<ClientId, ClientRecord>,
    next_id: u32,
}

impl Default for ClientRegistry {
    fn default() -> ClientRegistry {
        ClientRegistry::new()
    }
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            clients: BTreeMap::new(),
            // 0 is ClientId::NONE, so ids start at 1.
            next_id: 1,
        }
    }

    /// Mint the next client id. Ids are never reused within a session, even
    /// after the client disconnects.
    pub fn mint_id(&mut self) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, record: ClientRecord) {
        self.clients.insert(record.id, record);
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        self.clients.remove(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.clients.get_mut(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Look up the client bound to an unreliable source endpoint.
    pub fn find_by_udp_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .values()
            .find(|record| record.udp_addr == addr)
            .map(|record| record.id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of connected ids in id order.
    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ClientId, &mut ClientRecord)> {
        self.clients.iter_mut()
    }

    /// The first connected client other than `excluded`, in id order.
    /// Placeholder host-reselection heuristic — deliberately simple.
    pub fn first_other(&self, excluded: ClientId) -> Option<ClientId> {
        self.clients.keys().copied().find(|id| *id != excluded)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    /// Create a connected TCP pair; the registry only needs the server half.
    fn server_stream() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server
    }

    fn udp_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut registry = ClientRegistry::new();
        let a = registry.mint_id();
        let b = registry.mint_id();
        assert_eq!(a, ClientId(1));
        assert_eq!(b, ClientId(2));

        registry.insert(ClientRecord::new(a, server_stream(), udp_addr(9001)));
        registry.remove(a);
        // Minting after a removal must not hand the old id back.
        assert_eq!(registry.mint_id(), ClientId(3));
    }

    #[test]
    fn lookup_by_udp_endpoint() {
        let mut registry = ClientRegistry::new();
        let a = registry.mint_id();
        let b = registry.mint_id();
        registry.insert(ClientRecord::new(a, server_stream(), udp_addr(9001)));
        registry.insert(ClientRecord::new(b, server_stream(), udp_addr(9002)));

        assert_eq!(registry.find_by_udp_addr(udp_addr(9002)), Some(b));
        assert_eq!(registry.find_by_udp_addr(udp_addr(9009)), None);
    }

    #[test]
    fn first_other_skips_excluded() {
        let mut registry = ClientRegistry::new();
        let a = registry.mint_id();
        let b = registry.mint_id();
        registry.insert(ClientRecord::new(a, server_stream(), udp_addr(9001)));
        registry.insert(ClientRecord::new(b, server_stream(), udp_addr(9002)));

        assert_eq!(registry.first_other(a), Some(b));
        assert_eq!(registry.first_other(b), Some(a));

        registry.remove(b);
        assert_eq!(registry.first_other(a), None);
    }

    #[test]
    fn remove_returns_record() {
        let mut registry = ClientRegistry::new();
        let a = registry.mint_id();
        registry.insert(ClientRecord::new(a, server_stream(), udp_addr(9001)));
        assert_eq!(registry.len(), 1);

        let record = registry.remove(a).unwrap();
        assert_eq!(record.id, a);
        assert!(registry.is_empty());
        assert!(registry.remove(a).is_none());
    }
}
