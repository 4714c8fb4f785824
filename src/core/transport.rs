//! Boundary to the packet filter
//!
//! The registry never talks to the kernel directly. It hands records to a
//! [`Transport`], which stages them and commits on [`Transport::flush`].
//! Implementations must be safe to share between threads; the registry calls
//! them while holding its own locks.

use crate::core::error::TransportError;
use crate::core::expr::Expr;
use crate::core::rule_list::{RuleId, RulePosition};
use crate::core::set::{SetElement, SetRecord};
use crate::core::types::{ChainAttributes, TableFamily};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRecord {
    pub family: TableFamily,
    pub name: String,
}

impl TableRecord {
    pub fn new(name: impl Into<String>, family: TableFamily) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table {} {}", self.family, self.name)
    }
}

/// A chain and its base-chain attributes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainRecord {
    pub table: TableRecord,
    pub name: String,
    #[serde(default)]
    pub attrs: ChainAttributes,
}

impl fmt::Display for ChainRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {} {} {}", self.table.family, self.table.name, self.name)
    }
}

/// A compiled rule addressed by table, chain and identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRecord {
    pub table: TableRecord,
    pub chain: String,
    pub id: RuleId,
    /// Neighbour the rule is placed against; `None` appends
    #[serde(default)]
    pub position: Option<RulePosition>,
    pub exprs: Vec<Expr>,
}

impl fmt::Display for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule {} {} {} handle {}",
            self.table.family, self.table.name, self.chain, self.id
        )
    }
}

/// Staging and commit interface to the packet filter.
///
/// Mutating calls only stage; nothing is visible to `list_*` until
/// [`flush`](Transport::flush) commits every staged change as one batch. A
/// failed flush discards the whole batch.
pub trait Transport: Send + Sync {
    fn add_table(&self, table: &TableRecord) -> Result<(), TransportError>;
    fn del_table(&self, table: &TableRecord) -> Result<(), TransportError>;

    fn add_chain(&self, chain: &ChainRecord) -> Result<(), TransportError>;
    fn del_chain(&self, chain: &ChainRecord) -> Result<(), TransportError>;

    fn add_rule(&self, rule: &RuleRecord) -> Result<(), TransportError>;
    fn del_rule(&self, rule: &RuleRecord) -> Result<(), TransportError>;

    /// Stages a set together with its initial elements.
    fn add_set(&self, set: &SetRecord, elements: &[SetElement]) -> Result<(), TransportError>;
    fn del_set(&self, set: &SetRecord) -> Result<(), TransportError>;
    fn add_set_elements(&self, set: &SetRecord, elements: &[SetElement]) -> Result<(), TransportError>;
    fn del_set_elements(&self, set: &SetRecord, elements: &[SetElement]) -> Result<(), TransportError>;

    /// Committed tables, optionally restricted to one family
    fn list_tables(&self, family: Option<TableFamily>) -> Result<Vec<TableRecord>, TransportError>;
    fn list_chains(&self, table: &TableRecord) -> Result<Vec<ChainRecord>, TransportError>;
    fn list_sets(&self, table: &TableRecord) -> Result<Vec<SetRecord>, TransportError>;
    fn list_set_elements(&self, set: &SetRecord) -> Result<Vec<SetElement>, TransportError>;
    /// Committed rules of a chain in evaluation order
    fn list_rules(&self, table: &TableRecord, chain: &str) -> Result<Vec<RuleRecord>, TransportError>;

    /// Commits all staged changes.
    fn flush(&self) -> Result<(), TransportError>;

    /// Discards every table, staged or committed.
    fn flush_ruleset(&self) -> Result<(), TransportError>;

    /// Structured representation of the committed ruleset
    fn dump(&self) -> Result<serde_json::Value, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_display() {
        let table = TableRecord::new("filter", TableFamily::Ipv4);
        assert_eq!(table.to_string(), "table ip filter");

        let chain = ChainRecord {
            table: table.clone(),
            name: "input".to_string(),
            attrs: ChainAttributes::default(),
        };
        assert_eq!(chain.to_string(), "chain ip filter input");

        let rule = RuleRecord {
            table,
            chain: "input".to_string(),
            id: RuleId(30),
            position: None,
            exprs: Vec::new(),
        };
        assert_eq!(rule.to_string(), "rule ip filter input handle 30");
    }
}
