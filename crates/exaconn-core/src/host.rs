use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub const DEFAULT_PORT: u16 = 8563;

/// Fingerprint token that disables certificate validation for a host.
pub const NO_CERT_CHECK: &str = "NOCERTCHECK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Sha256(String),
    NoCertCheck,
}

impl Fingerprint {
    pub fn parse(raw: &str) -> Self {
        let upper = raw.to_ascii_uppercase();
        if upper == NO_CERT_CHECK {
            Fingerprint::NoCertCheck
        } else {
            Fingerprint::Sha256(upper)
        }
    }
}

/// One connectable endpoint derived from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub display_name: String,
    pub resolved_ip: IpAddr,
    pub port: u16,
    pub fingerprint: Option<Fingerprint>,
}

impl Host {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.resolved_ip, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.display_name == self.resolved_ip.to_string() {
            write!(f, "{}", self.socket_addr())
        } else {
            write!(f, "{} ({})", self.display_name, self.socket_addr())
        }
    }
}
