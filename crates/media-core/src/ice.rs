//! ICE agent interface
//!
//! Candidate gathering beyond host addresses, STUN and TURN belong to an
//! external agent plugged in through [`IceAgent`]. [`HostIceAgent`] covers
//! the common LAN case: it offers host candidates and picks the best
//! remote candidate pair without connectivity checks.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use lws_sip_core::sdp::Candidate;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sdp::IceCredentials;

/// Component 1 carries RTP, component 2 RTCP
pub const COMPONENT_RTP: u16 = 1;
pub const COMPONENT_RTCP: u16 = 2;

/// ICE agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceState {
    New,
    Gathering,
    /// All local candidates gathered
    Complete,
    Checking,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceState::New => "new",
            IceState::Gathering => "gathering",
            IceState::Complete => "complete",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Caller is normally controlling, callee controlled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// A local socket to gather candidates for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceComponent {
    /// Stream index within the session
    pub stream: usize,
    pub component: u16,
    pub address: SocketAddr,
}

/// Chosen remote address for one component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPair {
    pub stream: usize,
    pub component: u16,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// What the media session expects from an ICE implementation
#[async_trait]
pub trait IceAgent: Send + Sync {
    fn role(&self) -> IceRole;

    fn local_credentials(&self) -> IceCredentials;

    /// Gather candidates for the given sockets. Returned candidates carry
    /// their stream index.
    async fn gather(&mut self, components: &[IceComponent]) -> Result<Vec<(usize, Candidate)>>;

    /// Remote credentials and candidates for one stream
    fn set_remote(&mut self, stream: usize, credentials: IceCredentials, candidates: Vec<Candidate>);

    /// Run connectivity checks until every component has a pair
    async fn connect(&mut self) -> Result<Vec<SelectedPair>>;

    fn selected(&self, stream: usize, component: u16) -> Option<SocketAddr>;

    fn state(&self) -> IceState;

    fn close(&mut self);
}

/// RFC 8445 §6.1.2.3 pair priority
pub fn pair_priority(role: IceRole, local: u32, remote: u32) -> u64 {
    let (g, d) = match role {
        IceRole::Controlling => (u64::from(local), u64::from(remote)),
        IceRole::Controlled => (u64::from(remote), u64::from(local)),
    };
    (1 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

struct RemoteStream {
    stream: usize,
    credentials: IceCredentials,
    candidates: Vec<Candidate>,
}

/// Host-candidate-only agent
pub struct HostIceAgent {
    role: IceRole,
    credentials: IceCredentials,
    state: IceState,
    /// Address advertised when a socket is bound to the unspecified address
    advertised_ip: IpAddr,
    local: Vec<(IceComponent, Candidate)>,
    remote: Vec<RemoteStream>,
    selected: Vec<SelectedPair>,
}

impl HostIceAgent {
    pub fn new(role: IceRole, advertised_ip: IpAddr) -> Self {
        Self {
            role,
            credentials: IceCredentials {
                ufrag: random_token(8),
                pwd: random_token(24),
            },
            state: IceState::New,
            advertised_ip,
            local: Vec::new(),
            remote: Vec::new(),
            selected: Vec::new(),
        }
    }

    /// Best remote candidate for every local component
    fn pair_components(&self) -> Result<Vec<SelectedPair>> {
        let mut selected = Vec::new();
        for (component, local) in &self.local {
            let Some(remote) = self.remote.iter().find(|r| r.stream == component.stream) else {
                continue;
            };
            let best = remote
                .candidates
                .iter()
                .filter(|c| c.component == component.component && c.transport.eq_ignore_ascii_case("udp"))
                .filter_map(|c| {
                    let ip: IpAddr = c.address.parse().ok()?;
                    (ip.is_ipv4() == component.address.is_ipv4()).then_some((c, SocketAddr::new(ip, c.port)))
                })
                .max_by_key(|(c, _)| pair_priority(self.role, local.priority, c.priority));
            match best {
                Some((candidate, addr)) => {
                    debug!(
                        stream = component.stream,
                        component = component.component,
                        remote = %addr,
                        typ = candidate.typ.as_str(),
                        ufrag = %remote.credentials.ufrag,
                        "Selected candidate pair"
                    );
                    selected.push(SelectedPair {
                        stream: component.stream,
                        component: component.component,
                        local: component.address,
                        remote: addr,
                    });
                }
                None if component.component == COMPONENT_RTP => {
                    return Err(Error::Ice(format!(
                        "no remote candidate for stream {}",
                        component.stream
                    )));
                }
                // RTCP falls back to the SDP address
                None => {}
            }
        }
        if selected.is_empty() {
            return Err(Error::Ice("no remote candidates".into()));
        }
        Ok(selected)
    }
}

#[async_trait]
impl IceAgent for HostIceAgent {
    fn role(&self) -> IceRole {
        self.role
    }

    fn local_credentials(&self) -> IceCredentials {
        self.credentials.clone()
    }

    async fn gather(&mut self, components: &[IceComponent]) -> Result<Vec<(usize, Candidate)>> {
        self.state = IceState::Gathering;
        self.local.clear();
        for component in components {
            let ip = if component.address.ip().is_unspecified() {
                self.advertised_ip
            } else {
                component.address.ip()
            };
            let foundation = (component.stream + 1).to_string();
            let candidate = Candidate::host(
                foundation,
                component.component,
                ip.to_string(),
                component.address.port(),
            );
            debug!(candidate = %candidate, "Gathered host candidate");
            self.local.push((*component, candidate));
        }
        self.state = IceState::Complete;
        Ok(self
            .local
            .iter()
            .map(|(c, candidate)| (c.stream, candidate.clone()))
            .collect())
    }

    fn set_remote(&mut self, stream: usize, credentials: IceCredentials, candidates: Vec<Candidate>) {
        self.remote.retain(|r| r.stream != stream);
        self.remote.push(RemoteStream {
            stream,
            credentials,
            candidates,
        });
    }

    async fn connect(&mut self) -> Result<Vec<SelectedPair>> {
        self.state = IceState::Checking;
        match self.pair_components() {
            Ok(selected) => {
                info!(pairs = selected.len(), "ICE connected");
                self.state = IceState::Connected;
                self.selected = selected.clone();
                Ok(selected)
            }
            Err(e) => {
                warn!(error = %e, "ICE failed");
                self.state = IceState::Failed;
                Err(e)
            }
        }
    }

    fn selected(&self, stream: usize, component: u16) -> Option<SocketAddr> {
        self.selected
            .iter()
            .find(|p| p.stream == stream && p.component == component)
            .map(|p| p.remote)
    }

    fn state(&self) -> IceState {
        self.state
    }

    fn close(&mut self) {
        self.selected.clear();
        self.state = IceState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(stream: usize, component: u16, addr: &str) -> IceComponent {
        IceComponent {
            stream,
            component,
            address: addr.parse().unwrap(),
        }
    }

    #[test]
    fn test_pair_priority_is_symmetric_across_roles() {
        let a = pair_priority(IceRole::Controlling, 100, 200);
        let b = pair_priority(IceRole::Controlled, 200, 100);
        assert_eq!(a, b);
        assert!(pair_priority(IceRole::Controlling, 500, 500) > a);
    }

    #[tokio::test]
    async fn test_host_gather_uses_advertised_ip() {
        let mut agent = HostIceAgent::new(IceRole::Controlling, "192.168.1.5".parse().unwrap());
        let candidates = agent
            .gather(&[component(0, 1, "0.0.0.0:4000"), component(0, 2, "127.0.0.1:4001")])
            .await
            .unwrap();
        assert_eq!(agent.state(), IceState::Complete);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].1.address, "192.168.1.5");
        assert_eq!(candidates[1].1.address, "127.0.0.1");
        assert_eq!(candidates[1].1.component, 2);
        assert!(agent.local_credentials().pwd.len() >= 22);
    }

    #[tokio::test]
    async fn test_connect_picks_highest_priority() {
        let mut agent = HostIceAgent::new(IceRole::Controlled, "127.0.0.1".parse().unwrap());
        agent.gather(&[component(0, 1, "127.0.0.1:4000")]).await.unwrap();

        let mut low = Candidate::host("1", 1, "10.0.0.9", 5000);
        low.priority = 10;
        let high = Candidate::host("2", 1, "10.0.0.8", 6000);
        let rtcp = Candidate::host("3", 2, "10.0.0.8", 6001);
        let v6 = Candidate::host("4", 1, "::1", 7000);
        agent.set_remote(
            0,
            IceCredentials {
                ufrag: "peer".into(),
                pwd: "peerpasswordpeerpassword".into(),
            },
            vec![low, high, rtcp, v6],
        );

        let pairs = agent.connect().await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(agent.state(), IceState::Connected);
        assert_eq!(agent.selected(0, 1), Some("10.0.0.8:6000".parse().unwrap()));
        assert_eq!(agent.selected(0, 2), None);

        agent.close();
        assert_eq!(agent.state(), IceState::Closed);
        assert!(agent.selected(0, 1).is_none());
    }

    #[tokio::test]
    async fn test_connect_without_candidates_fails() {
        let mut agent = HostIceAgent::new(IceRole::Controlling, "127.0.0.1".parse().unwrap());
        agent.gather(&[component(0, 1, "127.0.0.1:4000")]).await.unwrap();
        agent.set_remote(
            0,
            IceCredentials {
                ufrag: "x".into(),
                pwd: "y".into(),
            },
            Vec::new(),
        );
        assert!(matches!(agent.connect().await, Err(Error::Ice(_))));
        assert_eq!(agent.state(), IceState::Failed);
    }
}
