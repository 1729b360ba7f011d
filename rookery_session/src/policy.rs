// Session role policies.
//
// The two buffer variants (authoritative server vs forwarding relay) share
// one admission/read/send engine (`buffer.rs`); the handful of decisions
// that actually differ live behind this small trait, selected at
// construction. Policies return decisions — they never touch sockets or the
// registry, which keeps the engine's borrow structure simple.

use std::net::IpAddr;

use rookery_protocol::ClientId;

/// How broadcast application traffic is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastRouting {
    /// Decode into RPC message units for local application dispatch (the
    /// buffer itself is the addressee).
    Dispatch,
    /// Forward the raw undecoded bytes to every other client (the buffer
    /// has no application logic of its own).
    Forward,
}

/// Role-specific decisions for the shared session engine.
pub trait SessionPolicy: Send {
    fn broadcast_routing(&self) -> BroadcastRouting;

    /// Whether `migrate_host` is a legal operation on this buffer.
    fn supports_migration(&self) -> bool;

    /// Gate on unreliable admission datagrams. `false` drops the request
    /// silently, without a response code.
    fn may_admit(&self, peer: IpAddr, authority: ClientId) -> bool;

    /// Called when a reliable connection from `peer` is admitted; `true`
    /// makes the new client the session authority. `authority` is the
    /// current holder of the role.
    fn claims_authority(&mut self, peer: IpAddr, authority: ClientId) -> bool;
}

/// Sole-server role: the buffer itself is the authority, clients never are.
pub struct AuthorityPolicy;

impl SessionPolicy for AuthorityPolicy {
    fn broadcast_routing(&self) -> BroadcastRouting {
        BroadcastRouting::Dispatch
    }

    fn supports_migration(&self) -> bool {
        false
    }

    fn may_admit(&self, _peer: IpAddr, _authority: ClientId) -> bool {
        true
    }

    fn claims_authority(&mut self, _peer: IpAddr, _authority: ClientId) -> bool {
        false
    }
}

/// Forwarding-hub role for a peer-to-peer session with a designated host.
pub struct RelayPolicy {
    host_addr: Option<IpAddr>,
}

impl RelayPolicy {
    /// `host_addr = None` makes the first connected client the host;
    /// otherwise only a client from that address can claim the role.
    pub fn new(host_addr: Option<IpAddr>) -> RelayPolicy {
        RelayPolicy { host_addr }
    }
}

impl SessionPolicy for RelayPolicy {
    fn broadcast_routing(&self) -> BroadcastRouting {
        BroadcastRouting::Forward
    }

    fn supports_migration(&self) -> bool {
        true
    }

    fn may_admit(&self, peer: IpAddr, authority: ClientId) -> bool {
        // While the designated host hasn't connected, no-one else can join.
        match self.host_addr {
            Some(host) if authority.is_none() => peer == host,
            _ => true,
        }
    }

    fn claims_authority(&mut self, peer: IpAddr, authority: ClientId) -> bool {
        // The role is only open while nobody holds it. Several clients can
        // share one address, so the holder is tracked by id, not address.
        if !authority.is_none() {
            return false;
        }
        match self.host_addr {
            None => true,
            Some(host) => host == peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn authority_policy_never_yields() {
        let mut policy = AuthorityPolicy;
        assert_eq!(policy.broadcast_routing(), BroadcastRouting::Dispatch);
        assert!(!policy.supports_migration());
        assert!(policy.may_admit(ip("10.0.0.1"), ClientId::NONE));
        assert!(!policy.claims_authority(ip("10.0.0.1"), ClientId::NONE));
    }

    #[test]
    fn relay_first_client_becomes_host() {
        let mut policy = RelayPolicy::new(None);
        assert!(policy.claims_authority(ip("10.0.0.1"), ClientId::NONE));
        // Once the role is held, later clients never claim it, even from
        // the same address.
        assert!(!policy.claims_authority(ip("10.0.0.1"), ClientId(1)));
        assert!(!policy.claims_authority(ip("10.0.0.2"), ClientId(1)));
    }

    #[test]
    fn relay_designated_host_gates_admission() {
        let policy = RelayPolicy::new(Some(ip("10.0.0.7")));
        // Host absent: only the designated address may start admission.
        assert!(!policy.may_admit(ip("10.0.0.1"), ClientId::NONE));
        assert!(policy.may_admit(ip("10.0.0.7"), ClientId::NONE));
        // Host present: everyone may join.
        assert!(policy.may_admit(ip("10.0.0.1"), ClientId(1)));
    }

    #[test]
    fn relay_designated_host_claims_role() {
        let mut policy = RelayPolicy::new(Some(ip("10.0.0.7")));
        assert!(!policy.claims_authority(ip("10.0.0.1"), ClientId::NONE));
        assert!(policy.claims_authority(ip("10.0.0.7"), ClientId::NONE));
    }
}
