//! Action emission: dynamic sets, redirects, NAT and match-action maps

use super::{AnonymousSet, Compiler};
use crate::core::error::ValidationError;
use crate::core::expr::{
    Expr, NAT_RANGE_MAP_IPS, NAT_RANGE_PERSISTENT, NAT_RANGE_PROTO_RANDOM,
    NAT_RANGE_PROTO_RANDOM_FULLY, NAT_RANGE_PROTO_SPECIFIED, NFT_REG_1, NFT_REG_2, NFT_REG_3,
    NFT_REG_4, NFT_REG_VERDICT, NatType,
};
use crate::core::interval::mask_bytes;
use crate::core::rule::{DynamicSet, MatchAction, Nat, NatKind, Redirect};
use crate::core::set::{SetElement, SetKeyType};
use crate::core::types::Address;

/// First and last address covered by a NAT target
fn nat_bounds(addr: &Address, addr_max: Option<&Address>) -> (Vec<u8>, Option<Vec<u8>>) {
    if let Some(max) = addr_max {
        return (addr.octets(), Some(max.octets()));
    }
    if addr.is_host() {
        return (addr.octets(), None);
    }
    let min = addr.network_octets();
    let mask = mask_bytes(addr.prefix_len(), min.len());
    let max = min.iter().zip(&mask).map(|(b, m)| b | !m).collect();
    (min, Some(max))
}

impl Compiler {
    fn immediate(&mut self, dreg: u32, data: Vec<u8>) {
        self.exprs.push(Expr::Immediate { dreg, data });
    }

    pub(super) fn dynamic_set(&mut self, dynamic_set: &DynamicSet) -> Result<(), ValidationError> {
        self.load_key(dynamic_set.key)?;
        self.exprs.push(Expr::Dynset {
            op: dynamic_set.op,
            sreg_key: NFT_REG_1,
            set: dynamic_set.set.clone(),
        });
        Ok(())
    }

    pub(super) fn redirect(&mut self, redirect: &Redirect) {
        self.immediate(NFT_REG_1, redirect.port.to_be_bytes().to_vec());
        if redirect.tproxy {
            // Without a known version the proxy serves both families
            let family = self.version.map_or(0, |v| v.nfproto());
            self.exprs.push(Expr::Tproxy {
                family,
                reg_addr: None,
                reg_port: NFT_REG_1,
            });
        } else {
            self.exprs.push(Expr::Redir {
                reg_proto_min: Some(NFT_REG_1),
                reg_proto_max: None,
                flags: NAT_RANGE_PROTO_SPECIFIED,
            });
        }
    }

    pub(super) fn nat(&mut self, nat: &Nat) {
        let mut flags = 0;
        let mut reg_addr_min = None;
        let mut reg_addr_max = None;
        let mut reg_proto_min = None;
        let mut reg_proto_max = None;

        if let Some(addr) = &nat.addr {
            let (min, max) = nat_bounds(addr, nat.addr_max.as_ref());
            self.immediate(NFT_REG_1, min);
            reg_addr_min = Some(NFT_REG_1);
            if let Some(max) = max {
                self.immediate(NFT_REG_2, max);
                reg_addr_max = Some(NFT_REG_2);
            }
            flags |= NAT_RANGE_MAP_IPS;
        }

        if let Some(port) = nat.port {
            self.immediate(NFT_REG_3, port.to_be_bytes().to_vec());
            reg_proto_min = Some(NFT_REG_3);
            if let Some(max) = nat.port_max {
                self.immediate(NFT_REG_4, max.to_be_bytes().to_vec());
                reg_proto_max = Some(NFT_REG_4);
            }
            flags |= NAT_RANGE_PROTO_SPECIFIED;
        }

        if nat.random {
            flags |= NAT_RANGE_PROTO_RANDOM;
        }
        if nat.fully_random {
            flags |= NAT_RANGE_PROTO_RANDOM_FULLY;
        }
        if nat.persistent {
            flags |= NAT_RANGE_PERSISTENT;
        }

        let nat_type = match nat.kind {
            NatKind::Snat => NatType::Snat,
            NatKind::Dnat => NatType::Dnat,
            NatKind::Masquerade => {
                self.exprs.push(Expr::Masq {
                    reg_proto_min,
                    reg_proto_max,
                    flags,
                });
                return;
            }
        };

        let family = nat
            .addr
            .as_ref()
            .map(Address::version)
            .or(self.version)
            .map_or(self.family.nfproto(), |v| v.nfproto());
        self.exprs.push(Expr::Nat {
            nat_type,
            family,
            reg_addr_min,
            reg_addr_max,
            reg_proto_min,
            reg_proto_max,
            flags,
        });
    }

    /// Two lookups: the match set maps the packet field to an action key in
    /// register 1, then a constant verdict map turns the key into a verdict.
    pub(super) fn match_action(&mut self, match_action: &MatchAction) -> Result<(), ValidationError> {
        let match_set = match_action
            .match_set
            .clone()
            .ok_or(ValidationError::MissingMatchSet)?;
        if match_action.actions.is_empty() {
            return Err(ValidationError::EmptyActionTable);
        }

        let elements = match_action
            .actions
            .iter()
            .map(|(key, verdict)| {
                verdict
                    .clone()
                    .map(|v| SetElement::integer(*key).with_verdict(v))
                    .ok_or(ValidationError::MissingVerdict(*key))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.load_key(match_action.match_type)?;
        self.exprs.push(Expr::Lookup {
            sreg: NFT_REG_1,
            dreg: Some(NFT_REG_1),
            set: match_set,
            invert: false,
        });

        let verdicts = self.push_set(AnonymousSet {
            key: SetKeyType::Integer,
            data: Some(SetKeyType::Verdict),
            interval: false,
            elements,
        });
        self.exprs.push(Expr::Lookup {
            sreg: NFT_REG_1,
            dreg: Some(NFT_REG_VERDICT),
            set: verdicts,
            invert: false,
        });
        Ok(())
    }
}
