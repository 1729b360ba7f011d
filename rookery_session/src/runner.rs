// Background driver for a session buffer.
//
// `start_session` binds a buffer, moves it onto a thread that runs the
// read/send cycle at a fixed cadence, and returns a handle for talking to
// it: a sender for outgoing messages, a receiver for dispatched incoming
// messages, and `stop()`.
//
// The buffer and its sockets never leave the cycle thread. Only the `mpsc`
// endpoints cross — the same split the engine is built around.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryIter};
use std::thread;
use std::time::Duration;

use rookery_protocol::{RpcMessage, RpcRegistry};

use crate::buffer::{SessionBuffer, SessionError};
use crate::config::SessionConfig;

/// Which buffer variant `start_session` binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    /// The buffer is the session authority and dispatches broadcast RPCs.
    Authoritative,
    /// The buffer forwards traffic; the host client holds authority.
    Relay,
}

/// Handle returned by `start_session` to control the running session.
pub struct SessionHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    outgoing: Sender<RpcMessage>,
    incoming: Receiver<RpcMessage>,
}

impl SessionHandle {
    /// A sender for queueing outgoing messages. Cloneable and usable from
    /// any thread.
    pub fn sender(&self) -> Sender<RpcMessage> {
        self.outgoing.clone()
    }

    /// Drain RPC messages dispatched to this endpoint since the last call.
    pub fn incoming(&self) -> TryIter<'_, RpcMessage> {
        self.incoming.try_iter()
    }

    /// Signal the session to shut down and wait for the cycle thread.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// How often the cycle thread runs a read/send pass.
const CYCLE_CADENCE: Duration = Duration::from_millis(1);

/// Start a session on a background thread. Returns the handle plus the
/// actual bound TCP and UDP addresses (useful when port 0 lets the OS pick).
pub fn start_session(
    role: SessionRole,
    config: SessionConfig,
    rpcs: RpcRegistry,
) -> Result<(SessionHandle, SocketAddr, SocketAddr), SessionError> {
    let mut buffer = match role {
        SessionRole::Authoritative => SessionBuffer::authoritative(config, rpcs)?,
        SessionRole::Relay => SessionBuffer::relay(config, rpcs)?,
    };
    let tcp_addr = buffer.local_tcp_addr()?;
    let udp_addr = buffer.local_udp_addr()?;
    let outgoing = buffer.outgoing_sender();
    let incoming = buffer
        .take_incoming()
        .expect("freshly bound buffer owns its receiver");

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_cycle = keep_running.clone();

    let thread = thread::spawn(move || {
        run_session(buffer, keep_running_cycle);
    });

    Ok((
        SessionHandle {
            keep_running,
            thread: Some(thread),
            outgoing,
            incoming,
        },
        tcp_addr,
        udp_addr,
    ))
}

/// The cycle loop. Runs until stopped or the session closes itself (for
/// example when a non-migratable authority disconnects).
fn run_session(mut buffer: SessionBuffer, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) && buffer.is_open() {
        buffer.read();
        buffer.send();
        // Events are drained so the queue doesn't grow unbounded; the
        // buffer already logs each one.
        buffer.poll_events().for_each(drop);
        thread::sleep(CYCLE_CADENCE);
    }
    buffer.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_and_stops_cleanly() {
        let config = SessionConfig {
            tcp_port: 0,
            udp_port: 0,
            ..SessionConfig::default()
        };
        let (handle, tcp_addr, udp_addr) =
            start_session(SessionRole::Relay, config, RpcRegistry::new()).unwrap();
        assert_ne!(tcp_addr.port(), 0);
        assert_ne!(udp_addr.port(), 0);
        handle.stop();
    }
}
