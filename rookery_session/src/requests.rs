// Pending admission request tracker.
//
// The admission handshake happens in two steps on two sockets: a verified
// unreliable request first, then a reliable connection from the same
// address. This table correlates the two — it remembers, per peer address,
// the unreliable source port the peer used, so the reliable handshake can
// bind the new client to its unreliable endpoint.
//
// Entries are bounded (capacity checked by the caller before `add`) and
// time-limited: anything older than the timeout is purged lazily by
// `clear_timeouts` at the top of each read cycle. No event is raised for an
// expired entry — the peer simply finds its reliable connection closed.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

struct PendingRequest {
    udp_port: u16,
    created: Instant,
}

/// Bounded, time-limited table of verified-but-unfinished admissions.
pub struct ConnectionRequestTracker {
    entries: HashMap<IpAddr, PendingRequest>,
    timeout: Duration,
}

impl ConnectionRequestTracker {
    pub fn new(timeout: Duration) -> ConnectionRequestTracker {
        ConnectionRequestTracker {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Record a verified admission request from `source`. A repeat request
    /// from the same address refreshes the entry.
    pub fn add(&mut self, source: SocketAddr) {
        self.entries.insert(
            source.ip(),
            PendingRequest {
                udp_port: source.port(),
                created: Instant::now(),
            },
        );
    }

    /// Consume the pending entry for `peer`, returning the unreliable port
    /// it negotiated. `None` means no live handshake is on record and the
    /// reliable connection must be refused.
    pub fn take(&mut self, peer: IpAddr) -> Option<u16> {
        let entry = self.entries.remove(&peer)?;
        if entry.created.elapsed() > self.timeout {
            // Expired but not yet purged — still a refusal.
            return None;
        }
        Some(entry.udp_port)
    }

    /// Purge expired entries. Returns how many were dropped.
    pub fn clear_timeouts(&mut self) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries
            .retain(|_, entry| entry.created.elapsed() <= timeout);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use super::*;

    fn source(ip: &str, port: u16) -> SocketAddr {
        format!("{ip}:{port}").parse().unwrap()
    }

    #[test]
    fn take_consumes_entry() {
        let mut tracker = ConnectionRequestTracker::new(Duration::from_secs(5));
        tracker.add(source("10.0.0.1", 40001));

        assert_eq!(tracker.take("10.0.0.1".parse().unwrap()), Some(40001));
        // Consumed: a second reliable connection finds nothing.
        assert_eq!(tracker.take("10.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn unknown_peer_refused() {
        let mut tracker = ConnectionRequestTracker::new(Duration::from_secs(5));
        assert_eq!(tracker.take("10.0.0.9".parse().unwrap()), None);
    }

    #[test]
    fn repeat_request_refreshes_port() {
        let mut tracker = ConnectionRequestTracker::new(Duration::from_secs(5));
        tracker.add(source("10.0.0.1", 40001));
        tracker.add(source("10.0.0.1", 40002));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.take("10.0.0.1".parse().unwrap()), Some(40002));
    }

    #[test]
    fn expired_entries_purged() {
        let mut tracker = ConnectionRequestTracker::new(Duration::from_millis(10));
        tracker.add(source("10.0.0.1", 40001));
        tracker.add(source("10.0.0.2", 40002));
        sleep(Duration::from_millis(25));

        assert_eq!(tracker.clear_timeouts(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn late_handshake_refused_even_before_purge() {
        let mut tracker = ConnectionRequestTracker::new(Duration::from_millis(10));
        tracker.add(source("10.0.0.1", 40001));
        sleep(Duration::from_millis(25));

        // No clear_timeouts ran yet, but the entry is stale.
        assert_eq!(tracker.take("10.0.0.1".parse().unwrap()), None);
    }
}
