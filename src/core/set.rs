//! Set and map descriptors
//!
//! Sets are keyed collections referenced from rules through lookup and
//! dynset instructions. A set with a data type is a map; a map whose data
//! type is [`SetKeyType::Verdict`] is a verdict map.

use crate::core::expr::SetHandle;
use crate::core::transport::TableRecord;
use crate::core::types::{Address, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Set flags (`NFT_SET_*`)
pub const NFT_SET_ANONYMOUS: u32 = 0x1;
pub const NFT_SET_CONSTANT: u32 = 0x2;
pub const NFT_SET_INTERVAL: u32 = 0x4;
pub const NFT_SET_MAP: u32 = 0x8;
pub const NFT_SET_EVAL: u32 = 0x20;

/// Bits per datatype in a concatenated key type
const TYPE_BITS: u32 = 6;

/// Process-wide counter for set identifiers.
static SET_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Returns the next set identifier. Identifiers are unique within the process.
pub fn next_set_id() -> u32 {
    SET_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Moves the counter past `id` so [`next_set_id`] never hands it out again.
pub fn reserve_set_id(id: u32) {
    SET_ID_COUNTER.fetch_max(id.saturating_add(1), Ordering::Relaxed);
}

/// Datatype of set keys and map data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SetKeyType {
    Verdict,
    Integer,
    IfName,
    Ipv4Addr,
    Ipv6Addr,
    InetProto,
    InetService,
    Mark,
    Concat(Vec<SetKeyType>),
}

impl SetKeyType {
    /// Datatype identifier as understood by the kernel and `nft`
    pub fn type_id(&self) -> u32 {
        match self {
            SetKeyType::Verdict => 1,
            SetKeyType::Integer => 4,
            SetKeyType::Ipv4Addr => 7,
            SetKeyType::Ipv6Addr => 8,
            SetKeyType::InetProto => 12,
            SetKeyType::InetService => 13,
            SetKeyType::Mark => 19,
            SetKeyType::IfName => 41,
            SetKeyType::Concat(fields) => fields
                .iter()
                .fold(0, |acc, field| (acc << TYPE_BITS) | field.type_id()),
        }
    }

    /// Key length in bytes. Concatenated fields are each padded to 4 bytes.
    pub fn len(&self) -> u32 {
        match self {
            SetKeyType::Verdict | SetKeyType::Integer | SetKeyType::Mark => 4,
            SetKeyType::Ipv4Addr => 4,
            SetKeyType::Ipv6Addr | SetKeyType::IfName => 16,
            SetKeyType::InetProto => 1,
            SetKeyType::InetService => 2,
            SetKeyType::Concat(fields) => fields.iter().map(|f| f.len().next_multiple_of(4)).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// User-supplied description of a set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetAttributes {
    pub name: String,
    pub key: SetKeyType,
    #[serde(default)]
    pub data: Option<SetKeyType>,
    #[serde(default)]
    pub constant: bool,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub interval: bool,
    /// Set may be updated from the packet path (dynset)
    #[serde(default)]
    pub dynamic: bool,
}

impl SetAttributes {
    pub fn new(name: impl Into<String>, key: SetKeyType) -> Self {
        Self {
            name: name.into(),
            key,
            data: None,
            constant: false,
            anonymous: false,
            interval: false,
            dynamic: false,
        }
    }

    /// Turns the set into a map with the given data type.
    pub fn with_data(mut self, data: SetKeyType) -> Self {
        self.data = Some(data);
        self
    }

    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    pub fn interval(mut self) -> Self {
        self.interval = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn is_map(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_vmap(&self) -> bool {
        self.data == Some(SetKeyType::Verdict)
    }

    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.anonymous {
            flags |= NFT_SET_ANONYMOUS;
        }
        if self.constant {
            flags |= NFT_SET_CONSTANT;
        }
        if self.interval {
            flags |= NFT_SET_INTERVAL;
        }
        if self.is_map() {
            flags |= NFT_SET_MAP;
        }
        if self.dynamic {
            flags |= NFT_SET_EVAL;
        }
        flags
    }
}

/// A set as registered with the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetRecord {
    pub table: TableRecord,
    pub id: u32,
    pub attrs: SetAttributes,
}

impl SetRecord {
    pub fn name(&self) -> &str {
        &self.attrs.name
    }

    /// Handle used by rule instructions to reference this set
    pub fn handle(&self) -> SetHandle {
        SetHandle::Named {
            name: self.attrs.name.clone(),
            id: self.id,
        }
    }
}

impl std::fmt::Display for SetRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "set {} {}", self.table, self.attrs.name)
    }
}

/// One set element: a key, optionally tagged as interval end, optionally carrying map data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SetElement {
    pub key: Vec<u8>,
    #[serde(default)]
    pub interval_end: bool,
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    #[serde(default)]
    pub verdict: Option<Verdict>,
}

impl SetElement {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            interval_end: false,
            data: None,
            verdict: None,
        }
    }

    /// Element closing a half-open interval at `key`
    pub fn interval_end(key: Vec<u8>) -> Self {
        Self {
            interval_end: true,
            ..Self::new(key)
        }
    }

    pub fn address(addr: &Address) -> Self {
        Self::new(addr.octets())
    }

    pub fn port(port: u16) -> Self {
        Self::new(port.to_be_bytes().to_vec())
    }

    /// Integer key in host byte order, as the kernel stores integer datatypes
    pub fn integer(value: u32) -> Self {
        Self::new(value.to_ne_bytes().to_vec())
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_type_and_len() {
        let key = SetKeyType::Concat(vec![
            SetKeyType::Ipv4Addr,
            SetKeyType::InetProto,
            SetKeyType::InetService,
        ]);
        assert_eq!(key.type_id(), (7 << 12) | (12 << 6) | 13);
        assert_eq!(key.len(), 12);

        let v6 = SetKeyType::Concat(vec![SetKeyType::Ipv6Addr, SetKeyType::InetService]);
        assert_eq!(v6.len(), 20);
    }

    #[test]
    fn test_set_flags() {
        let attrs = SetAttributes::new("blocked", SetKeyType::Ipv4Addr)
            .interval()
            .constant();
        assert_eq!(attrs.flags(), NFT_SET_CONSTANT | NFT_SET_INTERVAL);
        assert!(!attrs.is_map());

        let vmap = SetAttributes::new("dispatch", SetKeyType::InetService)
            .with_data(SetKeyType::Verdict);
        assert!(vmap.is_vmap());
        assert_eq!(vmap.flags(), NFT_SET_MAP);
    }

    #[test]
    fn test_set_ids_are_unique() {
        let a = next_set_id();
        let b = next_set_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_port_element_is_big_endian() {
        assert_eq!(SetElement::port(8080).key, vec![0x1f, 0x90]);
    }
}
