// Test-only session peer for integration tests.
//
// Wraps the real `SessionClient` with synchronous polling helpers so tests
// can express "connect, do X, wait until Y" against a real session running
// on a background thread. All networking uses the same code paths as an
// embedding application — the only test-specific code is the blocking
// wrappers and the event/message accumulators.
//
// See `tests/session_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use rookery_protocol::{ClientId, RpcMessage};
use rookery_session::client::{ClientConfig, ClientEvent, SessionClient};

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A test peer wrapping a real `SessionClient`, accumulating everything the
/// client observes so assertions can look back at history.
pub struct TestPeer {
    pub client: SessionClient,
    pub events: Vec<ClientEvent>,
    pub messages: Vec<RpcMessage>,
}

impl TestPeer {
    /// Connect to a session bound on localhost at the given addresses.
    pub fn connect(tcp_addr: SocketAddr, udp_addr: SocketAddr, app_id: u64) -> TestPeer {
        let config = ClientConfig {
            tcp_port: tcp_addr.port(),
            udp_port: udp_addr.port(),
            app_id,
            ..ClientConfig::default()
        };
        let client = SessionClient::connect(config).expect("TestPeer::connect failed");
        TestPeer {
            client,
            events: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.client.local_id()
    }

    /// One cycle: read, bank events and messages, send.
    pub fn pump(&mut self) {
        self.client.read();
        self.events.extend(self.client.poll_events());
        self.messages.extend(self.client.incoming());
        self.client.send();
    }

    /// Pump until the predicate holds over the accumulated state.
    pub fn wait_until(&mut self, what: &str, mut pred: impl FnMut(&TestPeer) -> bool) {
        let start = Instant::now();
        loop {
            self.pump();
            if pred(self) {
                return;
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {what}"
            );
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Pump until an event matching the predicate has been observed.
    pub fn wait_for_event(&mut self, what: &str, pred: impl Fn(&ClientEvent) -> bool) {
        self.wait_until(what, |peer| peer.events.iter().any(&pred));
    }

    /// Pump until at least `count` messages have arrived.
    pub fn wait_for_messages(&mut self, what: &str, count: usize) {
        self.wait_until(what, |peer| peer.messages.len() >= count);
    }

    /// Pump for a while and assert nothing arrives. For verifying silent
    /// drops.
    pub fn expect_silence(&mut self, what: &str) {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(300) {
            self.pump();
            thread::sleep(POLL_INTERVAL);
        }
        assert!(self.messages.is_empty(), "expected no messages: {what}");
    }
}
