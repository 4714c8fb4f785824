//! Register-machine instructions
//!
//! A compiled rule is a `Vec<Expr>` evaluated in order by the packet filter.
//! Registers follow the kernel layout: register 0 holds the verdict,
//! registers 1-4 are 16-byte registers, and 32-bit registers start at 8 so
//! that register 1 and 32-bit register 8 alias the same storage.

use crate::core::types::Verdict;
use serde::{Deserialize, Serialize};

pub const NFT_REG_VERDICT: u32 = 0;
pub const NFT_REG_1: u32 = 1;
pub const NFT_REG_2: u32 = 2;
pub const NFT_REG_3: u32 = 3;
pub const NFT_REG_4: u32 = 4;
pub const NFT_REG32_00: u32 = 8;

/// NAT range flags (`NF_NAT_RANGE_*`)
pub const NAT_RANGE_MAP_IPS: u32 = 0x01;
pub const NAT_RANGE_PROTO_SPECIFIED: u32 = 0x02;
pub const NAT_RANGE_PROTO_RANDOM: u32 = 0x04;
pub const NAT_RANGE_PERSISTENT: u32 = 0x08;
pub const NAT_RANGE_PROTO_RANDOM_FULLY: u32 = 0x10;

/// Header a payload load is relative to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum PayloadBase {
    #[strum(serialize = "link")]
    LinkLayer,
    #[strum(serialize = "network")]
    Network,
    #[strum(serialize = "transport")]
    Transport,
}

/// Packet metadata keys
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum MetaKey {
    #[strum(serialize = "iifname")]
    IifName,
    #[strum(serialize = "oifname")]
    OifName,
    #[strum(serialize = "nfproto")]
    NfProto,
    #[strum(serialize = "l4proto")]
    L4Proto,
    #[strum(serialize = "mark")]
    Mark,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Neq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Lte,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Gte,
}

/// Reference from an instruction to a set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SetHandle {
    /// Set registered with the transport
    Named { name: String, id: u32 },
    /// Set generated while compiling, indexed into `CompiledRule::sets`.
    /// Replaced by a named handle before the rule reaches the transport.
    Anonymous(usize),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    #[strum(serialize = "snat")]
    Snat,
    #[strum(serialize = "dnat")]
    Dnat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum DynsetOp {
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "update")]
    Update,
}

/// One register-machine instruction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Expr {
    Meta {
        key: MetaKey,
        dreg: u32,
    },
    Payload {
        dreg: u32,
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    Bitwise {
        sreg: u32,
        dreg: u32,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    Cmp {
        sreg: u32,
        op: CmpOp,
        data: Vec<u8>,
    },
    Range {
        sreg: u32,
        op: CmpOp,
        from: Vec<u8>,
        to: Vec<u8>,
    },
    Lookup {
        sreg: u32,
        dreg: Option<u32>,
        set: SetHandle,
        invert: bool,
    },
    Immediate {
        dreg: u32,
        data: Vec<u8>,
    },
    Counter,
    Log {
        prefix: Option<String>,
        level: Option<u32>,
    },
    Redir {
        reg_proto_min: Option<u32>,
        reg_proto_max: Option<u32>,
        flags: u32,
    },
    Tproxy {
        family: u8,
        reg_addr: Option<u32>,
        reg_port: u32,
    },
    Nat {
        nat_type: NatType,
        family: u8,
        reg_addr_min: Option<u32>,
        reg_addr_max: Option<u32>,
        reg_proto_min: Option<u32>,
        reg_proto_max: Option<u32>,
        flags: u32,
    },
    Masq {
        reg_proto_min: Option<u32>,
        reg_proto_max: Option<u32>,
        flags: u32,
    },
    Dynset {
        op: DynsetOp,
        sreg_key: u32,
        set: SetHandle,
    },
    Verdict(Verdict),
}

impl Expr {
    /// Kernel expression name
    pub const fn name(&self) -> &'static str {
        match self {
            Expr::Meta { .. } => "meta",
            Expr::Payload { .. } => "payload",
            Expr::Bitwise { .. } => "bitwise",
            Expr::Cmp { .. } => "cmp",
            Expr::Range { .. } => "range",
            Expr::Lookup { .. } => "lookup",
            Expr::Immediate { .. } | Expr::Verdict(_) => "immediate",
            Expr::Counter => "counter",
            Expr::Log { .. } => "log",
            Expr::Redir { .. } => "redir",
            Expr::Tproxy { .. } => "tproxy",
            Expr::Nat { .. } => "nat",
            Expr::Masq { .. } => "masq",
            Expr::Dynset { .. } => "dynset",
        }
    }

    /// Returns `true` for instructions after which evaluation of the rule stops.
    pub fn is_terminal(&self) -> bool {
        match self {
            Expr::Verdict(_)
            | Expr::Redir { .. }
            | Expr::Tproxy { .. }
            | Expr::Nat { .. }
            | Expr::Masq { .. } => true,
            Expr::Lookup { dreg, .. } => *dreg == Some(NFT_REG_VERDICT),
            _ => false,
        }
    }

    pub(crate) fn set_handle_mut(&mut self) -> Option<&mut SetHandle> {
        match self {
            Expr::Lookup { set, .. } | Expr::Dynset { set, .. } => Some(set),
            _ => None,
        }
    }
}

/// Number of 32-bit registers a value of `len` bytes occupies
pub const fn reg32_width(len: u32) -> u32 {
    len.div_ceil(4)
}
