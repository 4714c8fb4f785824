//! Match emission: interface, address, port and concatenated-key predicates

use super::{AnonymousSet, Compiler};
use crate::core::error::ValidationError;
use crate::core::expr::{
    CmpOp, Expr, MetaKey, NFT_REG_1, NFT_REG_VERDICT, NFT_REG32_00, PayloadBase, reg32_width,
};
use crate::core::interval::{build_interval_elements, mask_bytes};
use crate::core::rule::{Concat, ConcatElement, ConcatField, Interface, L2, L3, L4, MatchType};
use crate::core::rule_constraints::{is_negated, match_type_direction, match_type_needs_ports};
use crate::core::set::{SetElement, SetKeyType};
use crate::core::types::{AddrSpec, Address, Direction, IpVersion, L4Proto, PortSpec, RelOp};

/// Interface names are compared over the full `IFNAMSIZ` buffer
const IFNAMSIZ: usize = 16;

/// Comparison operator for a relational operator
pub(super) fn cmp_op(rel_op: RelOp) -> CmpOp {
    match rel_op {
        RelOp::Eq => CmpOp::Eq,
        RelOp::Neq => CmpOp::Neq,
    }
}

/// Compare data for an interface name. A trailing `*` matches by prefix.
fn ifname_bytes(name: &str) -> Vec<u8> {
    match name.strip_suffix('*') {
        Some(stem) => stem.as_bytes().to_vec(),
        None => {
            let mut bytes = name.as_bytes().to_vec();
            bytes.resize(IFNAMSIZ, 0);
            bytes
        }
    }
}

fn addr_key_type(version: IpVersion) -> SetKeyType {
    match version {
        IpVersion::V4 => SetKeyType::Ipv4Addr,
        IpVersion::V6 => SetKeyType::Ipv6Addr,
    }
}

impl Compiler {
    pub(super) fn nfproto_guard(&mut self, version: IpVersion) {
        self.exprs.push(Expr::Meta {
            key: MetaKey::NfProto,
            dreg: NFT_REG_1,
        });
        self.exprs.push(Expr::Cmp {
            sreg: NFT_REG_1,
            op: CmpOp::Eq,
            data: vec![version.nfproto()],
        });
    }

    pub(super) fn l2(&mut self, l2: &L2) {
        let matches = [(MetaKey::IifName, &l2.iifname), (MetaKey::OifName, &l2.oifname)];
        for (key, iface) in matches {
            if let Some(Interface { name, rel_op }) = iface {
                self.exprs.push(Expr::Meta {
                    key,
                    dreg: NFT_REG_1,
                });
                self.exprs.push(Expr::Cmp {
                    sreg: NFT_REG_1,
                    op: cmp_op(*rel_op),
                    data: ifname_bytes(name),
                });
            }
        }
    }

    pub(super) fn l3(&mut self, l3: &L3) -> Result<(), ValidationError> {
        let version = self.ip_version()?;

        if let Some(wanted) = l3.version {
            self.exprs.push(Expr::Payload {
                dreg: NFT_REG_1,
                base: PayloadBase::Network,
                offset: 0,
                len: 1,
            });
            self.exprs.push(Expr::Bitwise {
                sreg: NFT_REG_1,
                dreg: NFT_REG_1,
                len: 1,
                mask: vec![0xf0],
                xor: vec![0x00],
            });
            self.exprs.push(Expr::Cmp {
                sreg: NFT_REG_1,
                op: CmpOp::Eq,
                data: vec![wanted.version_nibble()],
            });
        }

        if let Some(protocol) = l3.protocol {
            self.exprs.push(Expr::Payload {
                dreg: NFT_REG_1,
                base: PayloadBase::Network,
                offset: version.protocol_offset(),
                len: 1,
            });
            self.exprs.push(Expr::Cmp {
                sreg: NFT_REG_1,
                op: CmpOp::Eq,
                data: vec![protocol.number()],
            });
        }

        for direction in [Direction::Source, Direction::Destination] {
            if let Some(spec) = l3.spec(direction) {
                self.addr_spec(version, direction, spec)?;
            }
        }
        Ok(())
    }

    fn load_addr(&mut self, version: IpVersion, direction: Direction, dreg: u32) {
        self.exprs.push(Expr::Payload {
            dreg,
            base: PayloadBase::Network,
            offset: version.addr_offset(direction),
            len: version.addr_len(),
        });
    }

    fn addr_spec(
        &mut self,
        version: IpVersion,
        direction: Direction,
        spec: &AddrSpec,
    ) -> Result<(), ValidationError> {
        self.load_addr(version, direction, NFT_REG_1);

        if let Some([start, end]) = &spec.range {
            self.range(spec.rel_op, start.octets(), end.octets());
            return Ok(());
        }

        match spec.list.as_slice() {
            [addr] => self.single_addr(version, addr, spec.rel_op),
            list => {
                let interval = list.iter().any(|a| !a.is_host());
                let elements = if interval {
                    build_interval_elements(list)?
                } else {
                    let mut keys: Vec<Vec<u8>> = list.iter().map(Address::octets).collect();
                    keys.sort();
                    keys.dedup();
                    keys.into_iter().map(SetElement::new).collect()
                };
                let set = self.push_set(AnonymousSet {
                    key: addr_key_type(version),
                    data: None,
                    interval,
                    elements,
                });
                self.exprs.push(Expr::Lookup {
                    sreg: NFT_REG_1,
                    dreg: None,
                    set,
                    invert: is_negated(spec.rel_op),
                });
            }
        }
        Ok(())
    }

    fn single_addr(&mut self, version: IpVersion, addr: &Address, rel_op: RelOp) {
        let len = version.addr_len();
        if !addr.is_host() {
            self.exprs.push(Expr::Bitwise {
                sreg: NFT_REG_1,
                dreg: NFT_REG_1,
                len,
                mask: mask_bytes(addr.prefix_len(), len as usize),
                xor: vec![0; len as usize],
            });
        }
        self.exprs.push(Expr::Cmp {
            sreg: NFT_REG_1,
            op: cmp_op(rel_op),
            data: addr.network_octets(),
        });
    }

    /// Inclusive range on the value in register 1
    fn range(&mut self, rel_op: RelOp, from: Vec<u8>, to: Vec<u8>) {
        match rel_op {
            RelOp::Eq => {
                self.exprs.push(Expr::Cmp {
                    sreg: NFT_REG_1,
                    op: CmpOp::Gte,
                    data: from,
                });
                self.exprs.push(Expr::Cmp {
                    sreg: NFT_REG_1,
                    op: CmpOp::Lte,
                    data: to,
                });
            }
            RelOp::Neq => self.exprs.push(Expr::Range {
                sreg: NFT_REG_1,
                op: CmpOp::Neq,
                from,
                to,
            }),
        }
    }

    fn l4_protocol(&mut self, protocol: L4Proto, dreg: u32) {
        self.exprs.push(Expr::Meta {
            key: MetaKey::L4Proto,
            dreg,
        });
        self.exprs.push(Expr::Cmp {
            sreg: dreg,
            op: CmpOp::Eq,
            data: vec![protocol.number()],
        });
    }

    fn load_port(&mut self, direction: Direction, dreg: u32) {
        self.exprs.push(Expr::Payload {
            dreg,
            base: PayloadBase::Transport,
            offset: direction.port_offset(),
            len: 2,
        });
    }

    pub(super) fn l4(&mut self, l4: &L4) {
        self.l4_protocol(l4.protocol, NFT_REG_1);
        for direction in [Direction::Source, Direction::Destination] {
            if let Some(spec) = l4.spec(direction) {
                self.port_spec(direction, spec);
            }
        }
    }

    fn port_spec(&mut self, direction: Direction, spec: &PortSpec) {
        self.load_port(direction, NFT_REG_1);

        if let Some([start, end]) = spec.range {
            self.range(spec.rel_op, start.to_be_bytes().to_vec(), end.to_be_bytes().to_vec());
            return;
        }

        match spec.list.as_slice() {
            [port] => self.exprs.push(Expr::Cmp {
                sreg: NFT_REG_1,
                op: cmp_op(spec.rel_op),
                data: port.to_be_bytes().to_vec(),
            }),
            list => {
                let mut ports = list.to_vec();
                ports.sort_unstable();
                ports.dedup();
                let set = self.push_set(AnonymousSet {
                    key: SetKeyType::InetService,
                    data: None,
                    interval: false,
                    elements: ports.into_iter().map(SetElement::port).collect(),
                });
                self.exprs.push(Expr::Lookup {
                    sreg: NFT_REG_1,
                    dreg: None,
                    set,
                    invert: is_negated(spec.rel_op),
                });
            }
        }
    }

    /// Loads every field of a concatenated key and looks it up.
    ///
    /// The first field goes to register 1; each following field starts at the
    /// 32-bit register right after the previous one.
    pub(super) fn concat(&mut self, concat: &Concat) -> Result<(), ValidationError> {
        let mut guarded: Vec<L4Proto> = Vec::new();
        for protocol in concat.elements.iter().filter_map(|e| e.protocol) {
            if !guarded.contains(&protocol) {
                self.l4_protocol(protocol, NFT_REG_1);
                guarded.push(protocol);
            }
        }

        let mut offset = 0;
        for element in &concat.elements {
            let dreg = if offset == 0 {
                NFT_REG_1
            } else {
                NFT_REG32_00 + offset
            };
            let len = self.concat_field(element, dreg)?;
            offset += reg32_width(len);
        }

        self.exprs.push(Expr::Lookup {
            sreg: NFT_REG_1,
            dreg: concat.vmap.then_some(NFT_REG_VERDICT),
            set: concat.set.clone(),
            invert: false,
        });
        Ok(())
    }

    /// Emits the load for one concatenated field and returns its length in bytes.
    fn concat_field(&mut self, element: &ConcatElement, dreg: u32) -> Result<u32, ValidationError> {
        let version = match element.field {
            ConcatField::Ipv4Addr => IpVersion::V4,
            ConcatField::Ipv6Addr => IpVersion::V6,
            ConcatField::L4Proto => {
                self.exprs.push(Expr::Meta {
                    key: MetaKey::L4Proto,
                    dreg,
                });
                return Ok(1);
            }
            ConcatField::Port => {
                self.load_port(element.direction, dreg);
                return Ok(2);
            }
            ConcatField::EtherAddr => {
                return Err(ValidationError::UnsupportedConcatElement(element.field.to_string()));
            }
        };

        let len = version.addr_len();
        self.load_addr(version, element.direction, dreg);
        if let Some(prefix) = element.mask.filter(|p| *p < version.max_prefix()) {
            self.exprs.push(Expr::Bitwise {
                sreg: dreg,
                dreg,
                len,
                mask: mask_bytes(prefix, len as usize),
                xor: vec![0; len as usize],
            });
        }
        Ok(len)
    }

    /// Loads the packet field a match-action or dynamic set is keyed on into register 1.
    pub(super) fn load_key(&mut self, match_type: MatchType) -> Result<SetKeyType, ValidationError> {
        let direction = match_type_direction(match_type);
        if match_type_needs_ports(match_type) {
            self.load_port(direction, NFT_REG_1);
            return Ok(SetKeyType::InetService);
        }
        match match_type {
            MatchType::L3Src | MatchType::L3Dst => {
                let version = self.ip_version()?;
                self.load_addr(version, direction, NFT_REG_1);
                Ok(addr_key_type(version))
            }
            _ => Err(ValidationError::UnsupportedMatchType(match_type.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifname_bytes() {
        let exact = ifname_bytes("eth0");
        assert_eq!(exact.len(), IFNAMSIZ);
        assert_eq!(&exact[..5], b"eth0\0");
        assert_eq!(ifname_bytes("wg*"), b"wg".to_vec());
    }

    #[test]
    fn test_cmp_op() {
        assert_eq!(cmp_op(RelOp::Eq), CmpOp::Eq);
        assert_eq!(cmp_op(RelOp::Neq), CmpOp::Neq);
    }
}
