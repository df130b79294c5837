//! # Firewall
//!
//! Types describing the links and addresses the gateway routes between, the
//! rule contributions that turn a configuration into an ordered
//! [`RuleSet`], and the applier that feeds the set to the system firewall
//! tool.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

pub mod apply;
pub mod rules;

pub use self::apply::{apply, build_rule_set};
use self::rules::{Rule, RuleSet};

/// A connected network interface, identified by kernel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link(String);

impl Link {
    pub fn new(name: impl Into<String>) -> Self {
        Link(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An IP address paired with a CIDR mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    pub ip: IpAddr,
    pub prefix: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("{0:?} is not a valid IP address")]
    BadIp(String),
    #[error("{0:?} is not a valid prefix length")]
    BadPrefix(String),
    #[error("prefix /{prefix} out of range for {ip}")]
    PrefixOutOfRange { ip: IpAddr, prefix: u8 },
}

impl Addr {
    pub fn new(ip: IpAddr, prefix: u8) -> Self {
        Addr { ip, prefix }
    }
}

impl FromStr for Addr {
    type Err = AddrParseError;

    /// Parses `"a.b.c.d/len"`. Just an IP implies a `/32`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => {
                let prefix = prefix
                    .parse::<u8>()
                    .map_err(|_| AddrParseError::BadPrefix(prefix.to_owned()))?;
                (ip, prefix)
            }
            None => (s, 32),
        };
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| AddrParseError::BadIp(ip.to_owned()))?;
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(AddrParseError::PrefixOutOfRange { ip, prefix });
        }
        Ok(Addr { ip, prefix })
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

/// Union of a subnet specified in CIDR and the [`Link`] it can be reached on.
/// The static route will not be established in the reverse direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub link: Link,
    pub subnet: Addr,
}

/// The firewall-facing view of a gateway configuration.
pub trait FwConfig {
    /// Link connected to the network with local clients.
    fn lan(&self) -> &Link;

    /// Link connected to a broader network (possibly the internet) that will
    /// be used to masquerade outbound connections from [`FwConfig::lan`].
    fn uplink(&self) -> &Link;

    /// Other networks that can be routed to from LAN without masquerading.
    fn flat_networks(&self) -> &[StaticRoute];

    /// Caller-supplied rules appended after the gateway contribution.
    fn extra_rules(&self) -> RuleSet;
}

/// Allows traffic to be forwarded from `in_link` to `out_link`. Note that this
/// doesn't affect the routing rules at all.
pub fn forward(in_link: &Link, out_link: &Link) -> Rule {
    Rule(format!(
        "-t filter -A fw-interfaces -j ACCEPT -i {} -o {}",
        in_link.name(),
        out_link.name()
    ))
}

/// Allows traffic to be forwarded from `in_link` to `out_link` when directed
/// to a specific subnet.
pub fn forward_to_subnet(in_link: &Link, out_link: &Link, dst: &Addr) -> Rule {
    Rule(format!(
        "-t filter -A fw-interfaces -j ACCEPT -d {} -i {} -o {}",
        dst,
        in_link.name(),
        out_link.name()
    ))
}

/// Masquerades traffic forwarded to `out_link`.
pub fn masquerade(out_link: &Link) -> Rule {
    Rule(format!(
        "-t nat -A POSTROUTING -j MASQUERADE -o {}",
        out_link.name()
    ))
}

/// Protocols accepted by [`open_port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => f.write_str("tcp"),
            Proto::Udp => f.write_str("udp"),
        }
    }
}

/// Allows either tcp or udp input traffic to a specific port.
pub fn open_port(proto: Proto, port: u16) -> Rule {
    Rule(format!("-I in-{proto} -j ACCEPT -p {proto} --dport {port}"))
}

/// Drops all input traffic arriving on `link`.
pub fn drop_input(link: &Link) -> Rule {
    Rule(format!("-I INPUT -j DROP -i {}", link.name()))
}
