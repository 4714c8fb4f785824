//! Primitive value types shared by the compiler and the registry
//!
//! Addresses, ports, protocols, verdicts and chain attributes. Everything here
//! is a plain value: cheap to clone, comparable, and serializable so that
//! transport dumps can include it verbatim.

use crate::core::error::ValidationError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Address family of a table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum TableFamily {
    #[strum(serialize = "ip")]
    Ipv4,
    #[strum(serialize = "ip6")]
    Ipv6,
    #[strum(serialize = "inet")]
    Inet,
    #[strum(serialize = "arp")]
    Arp,
    #[strum(serialize = "bridge")]
    Bridge,
    #[strum(serialize = "netdev")]
    Netdev,
}

impl TableFamily {
    /// Netfilter protocol family number (`NFPROTO_*`)
    pub const fn nfproto(self) -> u8 {
        match self {
            TableFamily::Inet => 1,
            TableFamily::Ipv4 => 2,
            TableFamily::Arp => 3,
            TableFamily::Netdev => 5,
            TableFamily::Bridge => 7,
            TableFamily::Ipv6 => 10,
        }
    }

    /// IP version implied by the family, `None` for families carrying both or neither
    pub const fn ip_version(self) -> Option<IpVersion> {
        match self {
            TableFamily::Ipv4 => Some(IpVersion::V4),
            TableFamily::Ipv6 => Some(IpVersion::V6),
            _ => None,
        }
    }

    /// Returns `true` if rules in this family may match on IP and transport headers.
    pub const fn supports_ip(self) -> bool {
        matches!(
            self,
            TableFamily::Ipv4 | TableFamily::Ipv6 | TableFamily::Inet
        )
    }
}

/// IP protocol version, which fixes header offsets and address lengths
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
pub enum IpVersion {
    #[strum(serialize = "ipv4")]
    V4,
    #[strum(serialize = "ipv6")]
    V6,
}

impl IpVersion {
    pub const fn addr_len(self) -> u32 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 16,
        }
    }

    pub const fn max_prefix(self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }

    /// Offset of the source or destination address in the network header
    pub const fn addr_offset(self, direction: Direction) -> u32 {
        match (self, direction) {
            (IpVersion::V4, Direction::Source) => 12,
            (IpVersion::V4, Direction::Destination) => 16,
            (IpVersion::V6, Direction::Source) => 8,
            (IpVersion::V6, Direction::Destination) => 24,
        }
    }

    /// Offset of the protocol (v4) or next-header (v6) field
    pub const fn protocol_offset(self) -> u32 {
        match self {
            IpVersion::V4 => 9,
            IpVersion::V6 => 6,
        }
    }

    /// Value of the first header byte once masked with `0xf0`
    pub const fn version_nibble(self) -> u8 {
        match self {
            IpVersion::V4 => 0x40,
            IpVersion::V6 => 0x60,
        }
    }

    pub const fn nfproto(self) -> u8 {
        match self {
            IpVersion::V4 => TableFamily::Ipv4.nfproto(),
            IpVersion::V6 => TableFamily::Ipv6.nfproto(),
        }
    }
}

/// Which side of a flow a match refers to
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display,
)]
pub enum Direction {
    #[strum(serialize = "source")]
    Source,
    #[strum(serialize = "destination")]
    Destination,
}

impl Direction {
    /// Offset of the source or destination port in the transport header
    pub const fn port_offset(self) -> u32 {
        match self {
            Direction::Source => 0,
            Direction::Destination => 2,
        }
    }
}

/// Relational operator of a match
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display,
)]
pub enum RelOp {
    #[default]
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Neq,
}

/// IP address with an optional prefix length. Without a prefix it is a host address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address {
    net: IpNetwork,
    host: bool,
}

impl Address {
    /// Creates an address, rejecting prefixes longer than the address itself.
    pub fn new(addr: IpAddr, prefix: Option<u8>) -> Result<Self, ValidationError> {
        let max = if addr.is_ipv6() { 128 } else { 32 };
        let len = prefix.unwrap_or(max);
        if len > max {
            return Err(ValidationError::InvalidPrefix { prefix: len, max });
        }
        let net = IpNetwork::new(addr, len)
            .map_err(|_| ValidationError::InvalidPrefix { prefix: len, max })?;
        Ok(Self {
            net,
            host: prefix.is_none(),
        })
    }

    pub fn host(addr: IpAddr) -> Self {
        Self {
            net: IpNetwork::from(addr),
            host: true,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.net.ip()
    }

    pub fn is_v6(&self) -> bool {
        self.net.is_ipv6()
    }

    pub fn version(&self) -> IpVersion {
        if self.is_v6() {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }

    /// Explicit prefix length, `None` for host addresses
    pub fn prefix(&self) -> Option<u8> {
        (!self.host).then(|| self.net.prefix())
    }

    /// Effective prefix length (host addresses use the full length)
    pub fn prefix_len(&self) -> u8 {
        self.net.prefix()
    }

    /// Returns `true` if the address matches exactly one host.
    pub fn is_host(&self) -> bool {
        self.prefix_len() == self.version().max_prefix()
    }

    pub fn network(&self) -> IpNetwork {
        self.net
    }

    /// Raw address bytes, most significant first
    pub fn octets(&self) -> Vec<u8> {
        ip_octets(self.net.ip())
    }

    /// Address bytes with host bits cleared
    pub fn network_octets(&self) -> Vec<u8> {
        ip_octets(self.net.network())
    }
}

pub(crate) fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: IpNetwork = s
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidAddress(s.to_string()))?;
        Ok(Self {
            net,
            host: !s.contains('/'),
        })
    }
}

impl From<IpAddr> for Address {
    fn from(addr: IpAddr) -> Self {
        Self::host(addr)
    }
}

impl From<IpNetwork> for Address {
    fn from(net: IpNetwork) -> Self {
        Self { net, host: false }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host {
            write!(f, "{}", self.net.ip())
        } else {
            write!(f, "{}", self.net)
        }
    }
}

/// Address predicate for one direction: either a list or an inclusive range
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddrSpec {
    #[serde(default)]
    pub list: Vec<Address>,
    #[serde(default)]
    pub range: Option<[Address; 2]>,
    #[serde(default)]
    pub rel_op: RelOp,
}

impl AddrSpec {
    pub fn single(addr: Address) -> Self {
        Self::list(vec![addr])
    }

    pub fn list(list: Vec<Address>) -> Self {
        Self {
            list,
            ..Self::default()
        }
    }

    pub fn range(start: Address, end: Address) -> Self {
        Self {
            range: Some([start, end]),
            ..Self::default()
        }
    }

    pub fn negate(mut self) -> Self {
        self.rel_op = RelOp::Neq;
        self
    }

    /// IP version shared by every address, if any address is present
    pub fn version(&self) -> Option<IpVersion> {
        self.list
            .first()
            .or_else(|| self.range.as_ref().map(|r| &r[0]))
            .map(Address::version)
    }
}

/// Port predicate for one direction: either a list or an inclusive range
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortSpec {
    #[serde(default)]
    pub list: Vec<u16>,
    #[serde(default)]
    pub range: Option<[u16; 2]>,
    #[serde(default)]
    pub rel_op: RelOp,
}

impl PortSpec {
    pub fn single(port: u16) -> Self {
        Self::list(vec![port])
    }

    pub fn list(list: Vec<u16>) -> Self {
        Self {
            list,
            ..Self::default()
        }
    }

    pub fn range(start: u16, end: u16) -> Self {
        Self {
            range: Some([start, end]),
            ..Self::default()
        }
    }

    pub fn negate(mut self) -> Self {
        self.rel_op = RelOp::Neq;
        self
    }
}

/// Layer 4 protocol
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum L4Proto {
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "ipv6-icmp")]
    Icmpv6,
    #[strum(serialize = "sctp")]
    Sctp,
    #[strum(serialize = "udplite")]
    Udplite,
}

impl L4Proto {
    /// IANA protocol number
    pub const fn number(self) -> u8 {
        match self {
            L4Proto::Icmp => 1,
            L4Proto::Tcp => 6,
            L4Proto::Udp => 17,
            L4Proto::Icmpv6 => 58,
            L4Proto::Sctp => 132,
            L4Proto::Udplite => 136,
        }
    }

    pub const fn has_ports(self) -> bool {
        matches!(
            self,
            L4Proto::Tcp | L4Proto::Udp | L4Proto::Sctp | L4Proto::Udplite
        )
    }
}

/// Verdict applied when a rule matches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Drop,
    Continue,
    Return,
    Jump(String),
    Goto(String),
}

impl Verdict {
    /// Kernel verdict code (`NF_*` / `NFT_*`)
    pub const fn code(&self) -> i32 {
        match self {
            Verdict::Drop => 0,
            Verdict::Accept => 1,
            Verdict::Continue => -1,
            Verdict::Jump(_) => -3,
            Verdict::Goto(_) => -4,
            Verdict::Return => -5,
        }
    }

    /// Target chain of a jump or goto
    pub fn chain(&self) -> Option<&str> {
        match self {
            Verdict::Jump(chain) | Verdict::Goto(chain) => Some(chain),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => f.write_str("accept"),
            Verdict::Drop => f.write_str("drop"),
            Verdict::Continue => f.write_str("continue"),
            Verdict::Return => f.write_str("return"),
            Verdict::Jump(chain) => write!(f, "jump {chain}"),
            Verdict::Goto(chain) => write!(f, "goto {chain}"),
        }
    }
}

/// Netfilter hook a base chain attaches to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Hook {
    #[strum(serialize = "prerouting")]
    Prerouting,
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "forward")]
    Forward,
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "postrouting")]
    Postrouting,
    #[strum(serialize = "ingress")]
    Ingress,
}

impl Hook {
    pub const fn number(self) -> u32 {
        match self {
            Hook::Prerouting | Hook::Ingress => 0,
            Hook::Input => 1,
            Hook::Forward => 2,
            Hook::Output => 3,
            Hook::Postrouting => 4,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum ChainType {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "route")]
    Route,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum ChainPolicy {
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

/// Base chain priority. Lower values run first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainPriority(pub i32);

impl ChainPriority {
    pub const FIRST: Self = Self(i32::MIN);
    pub const RAW: Self = Self(-300);
    pub const MANGLE: Self = Self(-150);
    pub const DSTNAT: Self = Self(-100);
    pub const FILTER: Self = Self(0);
    pub const SECURITY: Self = Self(50);
    pub const SRCNAT: Self = Self(100);
    pub const LAST: Self = Self(i32::MAX);
}

impl fmt::Display for ChainPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base chain attributes. A chain without attributes is a regular chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainAttributes {
    #[serde(default)]
    pub hook: Option<Hook>,
    #[serde(default)]
    pub priority: Option<ChainPriority>,
    #[serde(default)]
    pub chain_type: Option<ChainType>,
    #[serde(default)]
    pub policy: Option<ChainPolicy>,
    /// Device for netdev ingress chains
    #[serde(default)]
    pub device: Option<String>,
}

impl ChainAttributes {
    pub fn base(hook: Hook, chain_type: ChainType, priority: ChainPriority) -> Self {
        Self {
            hook: Some(hook),
            priority: Some(priority),
            chain_type: Some(chain_type),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: ChainPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn is_base(&self) -> bool {
        self.hook.is_some()
    }

    /// Checks that hook, priority and type are either all set or all absent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let set = [
            self.hook.is_some(),
            self.priority.is_some(),
            self.chain_type.is_some(),
        ];
        if set.iter().any(|s| *s) && !set.iter().all(|s| *s) {
            return Err(ValidationError::ChainAttributes(
                "hook, priority and type must be set together".to_string(),
            ));
        }
        if !self.is_base() && self.policy.is_some() {
            return Err(ValidationError::ChainAttributes(
                "policy requires a base chain".to_string(),
            ));
        }
        if self.device.is_some() && self.hook != Some(Hook::Ingress) {
            return Err(ValidationError::ChainAttributes(
                "device requires the ingress hook".to_string(),
            ));
        }
        Ok(())
    }
}
