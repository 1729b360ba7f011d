// Configuration for session buffers.
//
// `SessionConfig` is passed into the `SessionBuffer` constructors and
// otherwise untouched by the core logic. It derives `Deserialize` so the
// standalone relay binary can load it from a JSON file (`--config`); every
// field has a default so partial files work.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use rookery_protocol::AppId;

/// Per-event verbosity toggles for the diagnostic side channel. Packet dumps
/// are expensive to format, so each capture point is gated individually.
/// None of these affect control flow.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DiagnosticFlags {
    /// Log admission attempts and their outcomes.
    pub connection_attempts: bool,
    /// Dump reliable-channel packets before read/send transforms.
    pub reliable_pre_transform: bool,
    /// Dump reliable-channel packets after read/send transforms.
    pub reliable_post_transform: bool,
    /// Dump unreliable-channel packets before read/send transforms.
    pub unreliable_pre_transform: bool,
    /// Dump unreliable-channel packets after read/send transforms.
    pub unreliable_post_transform: bool,
}

/// Configuration for a session buffer (either variant).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reliable listening port. 0 lets the OS pick (useful in tests).
    pub tcp_port: u16,
    /// Unreliable listening port. 0 lets the OS pick.
    pub udp_port: u16,
    /// Application identifier admission requests must present.
    pub app_id: u64,
    /// Transport protocol version stamped on outgoing packets.
    pub protocol_version: u16,
    /// Application version stamped on outgoing packets.
    pub app_version: u16,
    /// Packets declaring a protocol version below this floor are dropped.
    pub min_protocol_version: u16,
    /// Packets declaring an app version below this floor are dropped.
    pub min_app_version: u16,
    /// Maximum concurrently connected clients (also bounds pending
    /// admission requests).
    pub max_clients: usize,
    /// How long a verified admission request waits for its reliable
    /// handshake before being purged.
    pub request_timeout_ms: u64,
    /// Relay only: whether the authority role survives the authority's
    /// disconnect. If false the whole session tears down with it.
    pub migratable: bool,
    /// Relay only: designated host address. Until a client from this
    /// address connects, admission requests from other addresses are
    /// ignored. `None` makes the first client the host.
    pub host_addr: Option<IpAddr>,
    /// Size of the socket read scratch buffer.
    pub read_buffer_size: usize,
    pub diagnostics: DiagnosticFlags,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tcp_port: 7878,
            udp_port: 7879,
            app_id: 0,
            protocol_version: 1,
            app_version: 1,
            min_protocol_version: 1,
            min_app_version: 1,
            max_clients: 16,
            request_timeout_ms: 5000,
            migratable: false,
            host_addr: None,
            read_buffer_size: 8192,
            diagnostics: DiagnosticFlags::default(),
        }
    }
}

impl SessionConfig {
    pub fn app_id(&self) -> AppId {
        AppId(self.app_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
