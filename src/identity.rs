use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use crate::{key::Key, transport::socketaddr_to_multiaddr};

/// A network participant: its id and where it listens.
///
/// Two identities are equal only if id, address and port all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub key: Key,
    pub ip: IpAddr,
    pub port: u16,
}

impl Identity {
    pub fn new(key: Key, addr: SocketAddr) -> Self {
        Self {
            key,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn to_multiaddr(&self) -> Multiaddr {
        socketaddr_to_multiaddr(&self.socket_addr())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.socket_addr())
    }
}
