//! Node abstractions for the storage cluster.
//!
//! A node is reached through a `NodeId`: the transport it speaks plus the
//! I/O address and port it listens on. The id is immutable and cheap to
//! clone; connection state lives in the transport crate.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transport used to reach a node's I/O port.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Plain stream sockets.
    #[default]
    Tcp,
    /// RDMA verbs.
    Rdma,
}

impl TransportType {
    /// URL scheme used when formatting a connection target.
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::Rdma => "rdma",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportType::Tcp),
            "rdma" => Ok(TransportType::Rdma),
            other => Err(Error::InvalidNode(format!("unknown transport '{}'", other))),
        }
    }
}

/// Identifier of a node's I/O endpoint.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId {
    pub io_transport_type: TransportType,
    pub io_addr: IpAddr,
    pub io_port: u16,
}

impl NodeId {
    pub fn new(io_transport_type: TransportType, io_addr: IpAddr, io_port: u16) -> Self {
        Self {
            io_transport_type,
            io_addr,
            io_port,
        }
    }

    /// Stream endpoint at `addr`.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(TransportType::Tcp, addr.ip(), addr.port())
    }

    /// RDMA endpoint at `addr`.
    pub fn rdma(addr: SocketAddr) -> Self {
        Self::new(TransportType::Rdma, addr.ip(), addr.port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.io_addr, self.io_port)
    }

    /// Connection target, e.g. `tcp://10.0.0.1:7000` or `rdma://[fe80::1]:7000`.
    pub fn url(&self) -> String {
        format!("{}://{}", self.io_transport_type.scheme(), self.socket_addr())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Parses `[scheme://]addr:port`; the scheme defaults to `tcp`.
impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme.parse()?, rest),
            None => (TransportType::Tcp, s),
        };
        let addr: SocketAddr = rest
            .parse()
            .map_err(|e| Error::InvalidNode(format!("bad address '{}': {}", rest, e)))?;
        Ok(Self::new(transport, addr.ip(), addr.port()))
    }
}

/// Storage node participating in the cluster.
///
/// Keep this struct small and cheap to clone; connections live elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub nid: NodeId,
    /// Human‑readable name or hostname.
    pub name: String,
    /// Optional failure-zone label.
    pub zone: Option<u32>,
}

impl Node {
    /// Construct a new node with basic metadata.
    pub fn new(nid: NodeId, name: impl Into<String>) -> Self {
        Self {
            nid,
            name: name.into(),
            zone: None,
        }
    }

    pub fn with_zone(nid: NodeId, name: impl Into<String>, zone: impl Into<Option<u32>>) -> Self {
        Self {
            nid,
            name: name.into(),
            zone: zone.into(),
        }
    }
}
