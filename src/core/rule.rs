//! Declarative rule specifications
//!
//! A [`Rule`] describes what to match (layer 2 interfaces, layer 3 addresses,
//! layer 4 ports, concatenated keys) and what to do about it (verdict,
//! redirect, NAT, verdict map lookup, dynamic set update, counter, log).
//! The compiler turns it into instructions; nothing here touches a transport.
//!
//! # Example
//!
//! ```
//! use nftkit::core::rule::{L3, Rule};
//! use nftkit::core::types::{AddrSpec, Verdict};
//!
//! let rule = Rule::new()
//!     .with_l3(L3::destination(AddrSpec::single("1.1.1.2".parse().unwrap())))
//!     .with_verdict(Verdict::Drop);
//! assert!(rule.has_match());
//! ```

use crate::core::expr::{DynsetOp, SetHandle};
use crate::core::set::SetKeyType;
use crate::core::types::{AddrSpec, Address, Direction, IpVersion, L4Proto, PortSpec, RelOp, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Interface name match
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub rel_op: RelOp,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rel_op: RelOp::Eq,
        }
    }

    pub fn negate(mut self) -> Self {
        self.rel_op = RelOp::Neq;
        self
    }
}

/// Layer 2 match: input and output interface names
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct L2 {
    #[serde(default)]
    pub iifname: Option<Interface>,
    #[serde(default)]
    pub oifname: Option<Interface>,
}

/// Layer 3 match
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct L3 {
    #[serde(default)]
    pub src: Option<AddrSpec>,
    #[serde(default)]
    pub dst: Option<AddrSpec>,
    /// Match on the IP version field only
    #[serde(default)]
    pub version: Option<IpVersion>,
    /// Match on the protocol (v4) / next header (v6) field
    #[serde(default)]
    pub protocol: Option<L4Proto>,
}

impl L3 {
    pub fn source(spec: AddrSpec) -> Self {
        Self {
            src: Some(spec),
            ..Self::default()
        }
    }

    pub fn destination(spec: AddrSpec) -> Self {
        Self {
            dst: Some(spec),
            ..Self::default()
        }
    }

    pub fn version(version: IpVersion) -> Self {
        Self {
            version: Some(version),
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: L4Proto) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn spec(&self, direction: Direction) -> Option<&AddrSpec> {
        match direction {
            Direction::Source => self.src.as_ref(),
            Direction::Destination => self.dst.as_ref(),
        }
    }
}

/// Layer 4 match
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct L4 {
    pub protocol: L4Proto,
    #[serde(default)]
    pub src: Option<PortSpec>,
    #[serde(default)]
    pub dst: Option<PortSpec>,
}

impl L4 {
    pub fn new(protocol: L4Proto) -> Self {
        Self {
            protocol,
            src: None,
            dst: None,
        }
    }

    pub fn with_src(mut self, spec: PortSpec) -> Self {
        self.src = Some(spec);
        self
    }

    pub fn with_dst(mut self, spec: PortSpec) -> Self {
        self.dst = Some(spec);
        self
    }

    pub fn spec(&self, direction: Direction) -> Option<&PortSpec> {
        match direction {
            Direction::Source => self.src.as_ref(),
            Direction::Destination => self.dst.as_ref(),
        }
    }
}

/// Redirect to a local port, or transparent proxy to it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Redirect {
    pub port: u16,
    #[serde(default)]
    pub tproxy: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
pub enum NatKind {
    #[strum(serialize = "snat")]
    Snat,
    #[strum(serialize = "dnat")]
    Dnat,
    #[strum(serialize = "masquerade")]
    Masquerade,
}

/// Source or destination address translation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Nat {
    pub kind: NatKind,
    #[serde(default)]
    pub addr: Option<Address>,
    #[serde(default)]
    pub addr_max: Option<Address>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub port_max: Option<u16>,
    #[serde(default)]
    pub random: bool,
    #[serde(default)]
    pub fully_random: bool,
    #[serde(default)]
    pub persistent: bool,
}

impl Nat {
    pub fn new(kind: NatKind) -> Self {
        Self {
            kind,
            addr: None,
            addr_max: None,
            port: None,
            port_max: None,
            random: false,
            fully_random: false,
            persistent: false,
        }
    }

    pub fn snat(addr: Address) -> Self {
        Self::new(NatKind::Snat).with_addr(addr)
    }

    pub fn dnat(addr: Address) -> Self {
        Self::new(NatKind::Dnat).with_addr(addr)
    }

    pub fn masquerade() -> Self {
        Self::new(NatKind::Masquerade)
    }

    pub fn with_addr(mut self, addr: Address) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_addr_range(mut self, min: Address, max: Address) -> Self {
        self.addr = Some(min);
        self.addr_max = Some(max);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port = Some(min);
        self.port_max = Some(max);
        self
    }
}

/// Field type of a concatenated set key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
pub enum ConcatField {
    #[strum(serialize = "ipv4_addr")]
    Ipv4Addr,
    #[strum(serialize = "ipv6_addr")]
    Ipv6Addr,
    #[strum(serialize = "inet_proto")]
    L4Proto,
    #[strum(serialize = "inet_service")]
    Port,
    #[strum(serialize = "ether_addr")]
    EtherAddr,
}

impl ConcatField {
    pub fn key_type(self) -> Option<SetKeyType> {
        match self {
            ConcatField::Ipv4Addr => Some(SetKeyType::Ipv4Addr),
            ConcatField::Ipv6Addr => Some(SetKeyType::Ipv6Addr),
            ConcatField::L4Proto => Some(SetKeyType::InetProto),
            ConcatField::Port => Some(SetKeyType::InetService),
            ConcatField::EtherAddr => None,
        }
    }
}

/// One field of a concatenated key
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcatElement {
    pub field: ConcatField,
    /// Protocol required before loading a port field
    #[serde(default)]
    pub protocol: Option<L4Proto>,
    pub direction: Direction,
    /// Prefix mask applied to address fields
    #[serde(default)]
    pub mask: Option<u8>,
}

impl ConcatElement {
    pub fn new(field: ConcatField, direction: Direction) -> Self {
        Self {
            field,
            protocol: None,
            direction,
            mask: None,
        }
    }

    pub fn with_protocol(mut self, protocol: L4Proto) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_mask(mut self, prefix: u8) -> Self {
        self.mask = Some(prefix);
        self
    }
}

/// Lookup of a multi-field key in a named set or verdict map
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Concat {
    pub elements: Vec<ConcatElement>,
    pub set: SetHandle,
    /// The set maps keys to verdicts and the lookup ends the rule
    #[serde(default)]
    pub vmap: bool,
}

impl Concat {
    /// Key type of a set this concatenation can be looked up in
    pub fn key_type(&self) -> Option<SetKeyType> {
        self.elements
            .iter()
            .map(|e| e.field.key_type())
            .collect::<Option<Vec<_>>>()
            .map(SetKeyType::Concat)
    }
}

/// Packet field used as key by match-action and dynamic set statements
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
pub enum MatchType {
    #[strum(serialize = "ether saddr")]
    L2Src,
    #[strum(serialize = "ether daddr")]
    L2Dst,
    #[strum(serialize = "ip saddr")]
    L3Src,
    #[strum(serialize = "ip daddr")]
    L3Dst,
    #[strum(serialize = "th sport")]
    L4Src,
    #[strum(serialize = "th dport")]
    L4Dst,
}

/// Two-stage verdict map: the match set maps a packet field to an integer,
/// and the action table maps that integer to a verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchAction {
    pub match_type: MatchType,
    #[serde(default)]
    pub match_set: Option<SetHandle>,
    #[serde(default)]
    pub actions: BTreeMap<u32, Option<Verdict>>,
}

impl MatchAction {
    pub fn new(match_type: MatchType, match_set: SetHandle) -> Self {
        Self {
            match_type,
            match_set: Some(match_set),
            actions: BTreeMap::new(),
        }
    }

    pub fn with_action(mut self, key: u32, verdict: Verdict) -> Self {
        self.actions.insert(key, Some(verdict));
        self
    }
}

/// Adds or refreshes the packet's key in a set from the packet path
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DynamicSet {
    pub op: DynsetOp,
    pub key: MatchType,
    pub set: SetHandle,
}

/// Log statement
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Log {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub level: Option<u32>,
}

/// Declarative rule
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    #[serde(default)]
    pub l2: Option<L2>,
    #[serde(default)]
    pub l3: Option<L3>,
    #[serde(default)]
    pub l4: Option<L4>,
    #[serde(default)]
    pub concat: Option<Concat>,
    #[serde(default)]
    pub dynamic_set: Option<DynamicSet>,
    #[serde(default)]
    pub counter: bool,
    #[serde(default)]
    pub log: Option<Log>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub nat: Option<Nat>,
    #[serde(default)]
    pub match_action: Option<MatchAction>,
    #[serde(default)]
    pub verdict: Option<Verdict>,
}

impl Rule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_l2(mut self, l2: L2) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn with_l3(mut self, l3: L3) -> Self {
        self.l3 = Some(l3);
        self
    }

    pub fn with_l4(mut self, l4: L4) -> Self {
        self.l4 = Some(l4);
        self
    }

    pub fn with_concat(mut self, concat: Concat) -> Self {
        self.concat = Some(concat);
        self
    }

    pub fn with_dynamic_set(mut self, dynamic_set: DynamicSet) -> Self {
        self.dynamic_set = Some(dynamic_set);
        self
    }

    pub fn with_counter(mut self) -> Self {
        self.counter = true;
        self
    }

    pub fn with_log(mut self, log: Log) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_redirect(mut self, redirect: Redirect) -> Self {
        self.redirect = Some(redirect);
        self
    }

    pub fn with_nat(mut self, nat: Nat) -> Self {
        self.nat = Some(nat);
        self
    }

    pub fn with_match_action(mut self, match_action: MatchAction) -> Self {
        self.match_action = Some(match_action);
        self
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    /// Returns `true` if the rule carries at least one match layer.
    pub fn has_match(&self) -> bool {
        self.l2.is_some() || self.l3.is_some() || self.l4.is_some() || self.concat.is_some()
    }

    /// IP version implied by the rule's addresses or version match
    pub fn ip_version(&self) -> Option<IpVersion> {
        let l3 = self.l3.as_ref();
        l3.and_then(|l3| l3.version)
            .or_else(|| l3.and_then(|l3| l3.src.as_ref()).and_then(AddrSpec::version))
            .or_else(|| l3.and_then(|l3| l3.dst.as_ref()).and_then(AddrSpec::version))
            .or_else(|| {
                self.nat
                    .as_ref()
                    .and_then(|nat| nat.addr.as_ref())
                    .map(Address::version)
            })
            .or_else(|| {
                self.concat.as_ref().and_then(|c| {
                    c.elements.iter().find_map(|e| match e.field {
                        ConcatField::Ipv4Addr => Some(IpVersion::V4),
                        ConcatField::Ipv6Addr => Some(IpVersion::V6),
                        _ => None,
                    })
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_version_inference() {
        let v6 = Rule::new().with_l3(L3::source(AddrSpec::single("2001:db8::1".parse().unwrap())));
        assert_eq!(v6.ip_version(), Some(IpVersion::V6));

        let versioned = Rule::new().with_l3(L3::version(IpVersion::V4));
        assert_eq!(versioned.ip_version(), Some(IpVersion::V4));

        let nat = Rule::new().with_nat(Nat::snat("10.0.0.1".parse().unwrap()));
        assert_eq!(nat.ip_version(), Some(IpVersion::V4));

        assert_eq!(Rule::new().with_verdict(Verdict::Accept).ip_version(), None);
    }

    #[test]
    fn test_concat_key_type() {
        let concat = Concat {
            elements: vec![
                ConcatElement::new(ConcatField::Ipv4Addr, Direction::Source),
                ConcatElement::new(ConcatField::Port, Direction::Destination),
            ],
            set: SetHandle::Named {
                name: "allowed".into(),
                id: 1,
            },
            vmap: false,
        };
        assert_eq!(
            concat.key_type(),
            Some(SetKeyType::Concat(vec![
                SetKeyType::Ipv4Addr,
                SetKeyType::InetService
            ]))
        );
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: Rule = serde_json::from_str(r#"{"verdict": "accept", "counter": true}"#).unwrap();
        assert_eq!(rule.verdict, Some(Verdict::Accept));
        assert!(rule.counter);
        assert!(!rule.has_match());
    }
}
