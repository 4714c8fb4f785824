//! Rule constraint functions
//!
//! This module centralizes the rules about valid field combinations in a
//! [`Rule`]. The compiler calls [`validate_rule`] before emitting anything, so
//! every instruction sequence it produces comes from a rule that passed here.
//!
//! # Examples
//!
//! ```
//! use nftkit::core::rule::MatchType;
//! use nftkit::core::rule_constraints::*;
//! use nftkit::core::types::L4Proto;
//!
//! assert!(protocol_supports_ports(L4Proto::Tcp));
//! assert!(!protocol_supports_ports(L4Proto::Icmp));
//!
//! assert!(match_type_is_supported(MatchType::L3Dst));
//! assert!(!match_type_is_supported(MatchType::L2Src));
//! ```

use crate::core::error::{ObjectKind, ValidationError};
use crate::core::rule::{ConcatField, L3, L4, MatchType, NatKind, Rule};
use crate::core::types::{AddrSpec, Address, Direction, IpVersion, L4Proto, PortSpec, RelOp, TableFamily};
use crate::validators::{validate_interface, validate_log_prefix, validate_object_name, validate_port_range};

// ═══════════════════════════════════════════════════════════════════════════
// Predicates
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol carries source and destination ports.
#[inline]
pub fn protocol_supports_ports(protocol: L4Proto) -> bool {
    protocol.has_ports()
}

/// Returns `true` if the match type can key a match-action map or dynamic set.
///
/// Only layer 3 addresses and layer 4 ports are loaded from the packet;
/// link-layer addresses are not.
#[inline]
pub fn match_type_is_supported(match_type: MatchType) -> bool {
    !matches!(match_type, MatchType::L2Src | MatchType::L2Dst)
}

/// Returns `true` if the match type reads a transport port.
#[inline]
pub fn match_type_needs_ports(match_type: MatchType) -> bool {
    matches!(match_type, MatchType::L4Src | MatchType::L4Dst)
}

/// Returns `true` if the match type reads an IP address.
#[inline]
pub fn match_type_needs_ip(match_type: MatchType) -> bool {
    matches!(match_type, MatchType::L3Src | MatchType::L3Dst)
}

/// Direction a supported match type reads from
#[inline]
pub fn match_type_direction(match_type: MatchType) -> Direction {
    match match_type {
        MatchType::L2Src | MatchType::L3Src | MatchType::L4Src => Direction::Source,
        MatchType::L2Dst | MatchType::L3Dst | MatchType::L4Dst => Direction::Destination,
    }
}

/// Returns `true` if the rule needs header offsets of a specific IP version.
pub fn rule_needs_ip_version(rule: &Rule) -> bool {
    rule.l3.is_some()
        || rule
            .nat
            .as_ref()
            .is_some_and(|nat| nat.addr.is_some())
        || rule
            .match_action
            .as_ref()
            .is_some_and(|ma| match_type_needs_ip(ma.match_type))
        || rule
            .dynamic_set
            .as_ref()
            .is_some_and(|ds| match_type_needs_ip(ds.key))
}

/// Returns `true` if the rule uses anything beyond interface names and plain statements.
fn rule_needs_ip_family(rule: &Rule) -> bool {
    rule.l3.is_some()
        || rule.l4.is_some()
        || rule.concat.is_some()
        || rule.redirect.is_some()
        || rule.nat.is_some()
        || rule.match_action.is_some()
        || rule.dynamic_set.is_some()
}

// ═══════════════════════════════════════════════════════════════════════════
// IP Version Resolution
// ═══════════════════════════════════════════════════════════════════════════

/// Resolves the IP version a rule is compiled for.
///
/// `ip` and `ip6` tables fix the version; `inet` tables take it from the rule
/// itself. Returns `Ok(None)` when the rule needs no version-specific offsets.
///
/// # Errors
///
/// Returns `Err` if the rule contradicts its table family, or if an `inet`
/// rule needs a version it does not state.
pub fn resolve_ip_version(
    rule: &Rule,
    family: TableFamily,
) -> Result<Option<IpVersion>, ValidationError> {
    if !family.supports_ip() {
        if rule_needs_ip_family(rule) {
            return Err(ValidationError::UnsupportedFamily(family));
        }
        return Ok(None);
    }

    let inferred = rule.ip_version();
    match (family.ip_version(), inferred) {
        (Some(fixed), Some(found)) if fixed != found => {
            Err(ValidationError::AddressFamilyMismatch(format!(
                "{found} match in {family} table"
            )))
        }
        (Some(fixed), _) => Ok(Some(fixed)),
        (None, Some(found)) => Ok(Some(found)),
        (None, None) if rule_needs_ip_version(rule) => {
            Err(ValidationError::UnknownIpVersion(family))
        }
        (None, None) => Ok(None),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rule Validation
// ═══════════════════════════════════════════════════════════════════════════

/// Validates every layer and action of a rule for the given table family.
///
/// # Errors
///
/// Returns the first constraint the rule violates.
pub fn validate_rule(rule: &Rule, family: TableFamily) -> Result<(), ValidationError> {
    let has_action = rule.verdict.is_some() || rule.nat.is_some() || rule.match_action.is_some();
    if !rule.has_match() && !has_action {
        return Err(ValidationError::EmptyRule);
    }

    validate_terminal_actions(rule)?;
    resolve_ip_version(rule, family)?;

    if let Some(l2) = &rule.l2 {
        for iface in [&l2.iifname, &l2.oifname].into_iter().flatten() {
            validate_interface(&iface.name)?;
        }
    }
    if let Some(l3) = &rule.l3 {
        validate_l3(l3)?;
    }
    if let Some(l4) = &rule.l4 {
        validate_l4(l4)?;
    }
    let l4_ports = rule
        .l4
        .as_ref()
        .is_some_and(|l4| protocol_supports_ports(l4.protocol));

    if let Some(concat) = &rule.concat {
        validate_concat(concat.elements.as_slice())?;
    }

    if let Some(redirect) = &rule.redirect
        && !l4_ports
    {
        return Err(ValidationError::MissingProtocolContext {
            action: if redirect.tproxy { "tproxy" } else { "redirect" },
        });
    }

    if let Some(nat) = &rule.nat {
        match nat.kind {
            NatKind::Snat if nat.addr.is_none() => return Err(ValidationError::NatMissingAddress("snat")),
            NatKind::Dnat if nat.addr.is_none() => return Err(ValidationError::NatMissingAddress("dnat")),
            _ => {}
        }
        if let (Some(min), Some(max)) = (&nat.addr, &nat.addr_max) {
            check_same_version(min, max)?;
        }
        if nat.port.is_some() && !l4_ports {
            return Err(ValidationError::MissingProtocolContext {
                action: "nat to port",
            });
        }
        if let (Some(min), Some(max)) = (nat.port, nat.port_max) {
            validate_port_range(min, max)?;
        }
    }

    if let Some(ma) = &rule.match_action {
        if !match_type_is_supported(ma.match_type) {
            return Err(ValidationError::UnsupportedMatchType(ma.match_type.to_string()));
        }
        if ma.match_set.is_none() {
            return Err(ValidationError::MissingMatchSet);
        }
        if ma.actions.is_empty() {
            return Err(ValidationError::EmptyActionTable);
        }
        if let Some((key, _)) = ma.actions.iter().find(|(_, v)| v.is_none()) {
            return Err(ValidationError::MissingVerdict(*key));
        }
        if match_type_needs_ports(ma.match_type) && !l4_ports {
            return Err(ValidationError::MissingProtocolContext {
                action: "match-action",
            });
        }
    }

    if let Some(ds) = &rule.dynamic_set {
        if !match_type_is_supported(ds.key) {
            return Err(ValidationError::UnsupportedMatchType(ds.key.to_string()));
        }
        if match_type_needs_ports(ds.key) && !l4_ports {
            return Err(ValidationError::MissingProtocolContext {
                action: "dynamic set",
            });
        }
    }

    if let Some(prefix) = rule.log.as_ref().and_then(|log| log.prefix.as_deref()) {
        validate_log_prefix(prefix)?;
    }

    if let Some(chain) = rule.verdict.as_ref().and_then(|v| v.chain()) {
        validate_object_name(ObjectKind::Chain, chain)?;
    }

    Ok(())
}

fn validate_terminal_actions(rule: &Rule) -> Result<(), ValidationError> {
    let terminal: Vec<&str> = [
        rule.redirect.map(|r| if r.tproxy { "tproxy" } else { "redirect" }),
        rule.nat.as_ref().map(|_| "nat"),
        rule.match_action.as_ref().map(|_| "match-action"),
        rule.concat.as_ref().filter(|c| c.vmap).map(|_| "verdict map"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if terminal.len() > 1 {
        return Err(ValidationError::ConflictingActions(terminal.join(", ")));
    }
    Ok(())
}

fn validate_l3(l3: &L3) -> Result<(), ValidationError> {
    if l3.src.is_none() && l3.dst.is_none() && l3.version.is_none() && l3.protocol.is_none() {
        return Err(ValidationError::EmptyL3);
    }

    let mut seen: Option<IpVersion> = None;
    for direction in [Direction::Source, Direction::Destination] {
        let Some(spec) = l3.spec(direction) else {
            continue;
        };
        if l3.version.is_some() {
            return Err(ValidationError::ConflictingAddressSpec(direction));
        }
        validate_addr_spec(spec, direction)?;
        if let Some(version) = spec.version() {
            if seen.is_some_and(|s| s != version) {
                return Err(ValidationError::AddressFamilyMismatch(
                    "source and destination use different IP versions".to_string(),
                ));
            }
            seen = Some(version);
        }
    }
    Ok(())
}

fn validate_addr_spec(spec: &AddrSpec, direction: Direction) -> Result<(), ValidationError> {
    match (&spec.list[..], &spec.range) {
        ([], None) => Err(ValidationError::EmptyAddressSpec(direction)),
        ([_, ..], Some(_)) => Err(ValidationError::ConflictingAddressSpec(direction)),
        (list, None) => {
            let first = &list[0];
            list[1..].iter().try_for_each(|addr| check_same_version(first, addr))
        }
        ([], Some([start, end])) => {
            check_same_version(start, end)?;
            if start.octets() > end.octets() {
                return Err(ValidationError::InvalidAddress(format!("{start}-{end}")));
            }
            Ok(())
        }
    }
}

fn check_same_version(a: &Address, b: &Address) -> Result<(), ValidationError> {
    if a.is_v6() == b.is_v6() {
        Ok(())
    } else {
        Err(ValidationError::AddressFamilyMismatch(format!("{a} and {b}")))
    }
}

fn validate_l4(l4: &L4) -> Result<(), ValidationError> {
    for direction in [Direction::Source, Direction::Destination] {
        let Some(spec) = l4.spec(direction) else {
            continue;
        };
        if !protocol_supports_ports(l4.protocol) {
            return Err(ValidationError::PortsNotSupported(l4.protocol.to_string()));
        }
        validate_port_spec(spec, direction)?;
    }
    Ok(())
}

fn validate_port_spec(spec: &PortSpec, direction: Direction) -> Result<(), ValidationError> {
    match (spec.list.is_empty(), spec.range) {
        (true, None) => Err(ValidationError::EmptyPortSpec(direction)),
        (false, Some(_)) => Err(ValidationError::ConflictingPortSpec(direction)),
        (_, Some([start, end])) => validate_port_range(start, end).map(|_| ()),
        (false, None) => Ok(()),
    }
}

fn validate_concat(elements: &[crate::core::rule::ConcatElement]) -> Result<(), ValidationError> {
    if elements.is_empty() {
        return Err(ValidationError::EmptyConcat);
    }

    let mut version: Option<IpVersion> = None;
    for element in elements {
        let element_version = match element.field {
            ConcatField::Ipv4Addr => Some(IpVersion::V4),
            ConcatField::Ipv6Addr => Some(IpVersion::V6),
            ConcatField::L4Proto => None,
            ConcatField::Port => {
                if !element.protocol.is_some_and(protocol_supports_ports) {
                    return Err(ValidationError::MissingProtocolContext {
                        action: "concatenated port",
                    });
                }
                None
            }
            ConcatField::EtherAddr => {
                return Err(ValidationError::UnsupportedConcatElement(element.field.to_string()));
            }
        };

        match (element_version, element.mask) {
            (None, Some(_)) => {
                return Err(ValidationError::UnsupportedConcatElement(format!(
                    "mask on {}",
                    element.field
                )));
            }
            (Some(v), Some(mask)) if mask > v.max_prefix() => {
                return Err(ValidationError::InvalidPrefix {
                    prefix: mask,
                    max: v.max_prefix(),
                });
            }
            _ => {}
        }

        if let Some(v) = element_version {
            if version.is_some_and(|seen| seen != v) {
                return Err(ValidationError::AddressFamilyMismatch(
                    "concatenation mixes IPv4 and IPv6 fields".to_string(),
                ));
            }
            version = Some(v);
        }
    }
    Ok(())
}

/// Relational operator of an address or port match as a negation flag
#[inline]
pub fn is_negated(rel_op: RelOp) -> bool {
    rel_op == RelOp::Neq
}
