// rookery_session — session engine and client connector for Rookery.
//
// This crate implements both ends of a Rookery session over the wire format
// defined in `rookery_protocol`. A session buffer listens on a TCP/UDP port
// pair, admits clients through a two-step verified handshake, reassembles
// packets, and routes RPC messages. It comes in two roles behind one engine:
// the authoritative server dispatches traffic to the local application, the
// forwarding relay moves bytes between clients while one of them (the host)
// holds authority.
//
// Module overview:
// - `config.rs`:    `SessionConfig` and the diagnostic toggles, JSON-loadable
//                   for the standalone binary.
// - `policy.rs`:    The role seam — `SessionPolicy` with the authoritative
//                   and relay implementations.
// - `registry.rs`:  Per-client connection records and id minting.
// - `requests.rs`:  The pending-admission tracker correlating the unreliable
//                   handshake with the reliable connection.
// - `transform.rs`: Ordered packet transform steps (send forward, read
//                   reverse).
// - `buffer.rs`:    `SessionBuffer` — the single-threaded read/send engine.
// - `client.rs`:    `SessionClient` — the connecting side of the handshake
//                   and the same cycle for clients.
// - `runner.rs`:    `start_session` — drives a buffer on a background thread.
//
// Concurrency model: all sockets are non-blocking and owned by one cycle
// thread; only `mpsc` endpoints cross threads. There is no async runtime.
//
// The session can run as a standalone binary (`main.rs`, the `rookery-relay`
// executable) or be embedded via the library API (`start_session`).

pub mod buffer;
pub mod client;
pub mod config;
pub mod policy;
pub mod registry;
pub mod requests;
pub mod runner;
pub mod transform;

pub use buffer::{SessionBuffer, SessionError, SessionEvent};
pub use client::{ClientConfig, ClientEvent, ConnectError, SessionClient};
pub use config::{DiagnosticFlags, SessionConfig};
pub use runner::{SessionHandle, SessionRole, start_session};
pub use transform::PacketTransform;
