//! Chains and their rules
//!
//! Rules are compiled, their anonymous sets named and bound, and the result
//! staged on the transport while the chain's rule list is locked, so list
//! order and transport order never diverge.

use super::Shared;
use crate::core::compiler::{CompiledRule, compile};
use crate::core::error::{Error, ObjectKind, Result};
use crate::core::rule::Rule;
use crate::core::rule_list::{RuleId, RuleList, RuleNode, RulePosition};
use crate::core::set::{SetElement, SetRecord, next_set_id};
use crate::core::transport::{ChainRecord, RuleRecord};
use crate::core::types::ChainAttributes;
use std::sync::Arc;
use tracing::{debug, info};

/// A chain and its rules in evaluation order
pub struct Chain {
    record: ChainRecord,
    shared: Arc<Shared>,
    rules: RuleList,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("record", &self.record)
            .field("rules", &self.rules.ids())
            .finish_non_exhaustive()
    }
}

impl Chain {
    pub(super) fn new(record: ChainRecord, shared: Arc<Shared>) -> Self {
        let rules = RuleList::new(shared.config.rule_id_step);
        Self {
            record,
            shared,
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn attributes(&self) -> &ChainAttributes {
        &self.record.attrs
    }

    pub fn record(&self) -> &ChainRecord {
        &self.record
    }

    /// Compiles a rule and stages it at the end of the chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the rule does not compile for the table's family or
    /// the transport rejects it.
    pub fn create_rule(&self, rule: &Rule) -> Result<RuleId> {
        self.add(rule, None, false)
    }

    /// Appends a rule and commits at once.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the rule does not compile, the transport rejects it,
    /// or the commit fails.
    pub fn create_rule_imm(&self, rule: &Rule) -> Result<RuleId> {
        self.add(rule, None, true)
    }

    /// Stages a rule directly after `anchor`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if `anchor` is not in the chain, otherwise as
    /// [`create_rule`](Self::create_rule).
    pub fn insert_rule_after(&self, anchor: RuleId, rule: &Rule) -> Result<RuleId> {
        self.add(rule, Some(RulePosition::After(anchor)), false)
    }

    /// Inserts a rule directly after `anchor` and commits at once.
    ///
    /// # Errors
    ///
    /// As [`insert_rule_after`](Self::insert_rule_after), plus commit failures.
    pub fn insert_rule_after_imm(&self, anchor: RuleId, rule: &Rule) -> Result<RuleId> {
        self.add(rule, Some(RulePosition::After(anchor)), true)
    }

    /// Stages a rule directly before `anchor`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if `anchor` is not in the chain, otherwise as
    /// [`create_rule`](Self::create_rule).
    pub fn insert_rule_before(&self, anchor: RuleId, rule: &Rule) -> Result<RuleId> {
        self.add(rule, Some(RulePosition::Before(anchor)), false)
    }

    /// Inserts a rule directly before `anchor` and commits at once.
    ///
    /// # Errors
    ///
    /// As [`insert_rule_before`](Self::insert_rule_before), plus commit failures.
    pub fn insert_rule_before_imm(&self, anchor: RuleId, rule: &Rule) -> Result<RuleId> {
        self.add(rule, Some(RulePosition::Before(anchor)), true)
    }

    fn add(&self, rule: &Rule, position: Option<RulePosition>, commit: bool) -> Result<RuleId> {
        let family = self.record.table.family;
        let mut compiled = compile(rule, family, &self.shared.config.compile_options())?;

        let prefix = &self.shared.config.anonymous_set_prefix;
        let records: Vec<SetRecord> = compiled
            .sets
            .iter()
            .map(|set| {
                let id = next_set_id();
                SetRecord {
                    table: self.record.table.clone(),
                    id,
                    attrs: set.attributes(format!("{prefix}{id}")),
                }
            })
            .collect();
        compiled.bind_sets(&records)?;

        let CompiledRule { exprs, sets } = compiled;
        let elements: Vec<Vec<SetElement>> = sets.into_iter().map(|s| s.elements).collect();
        let node = RuleNode::new(exprs).with_sets(records);

        // Runs under the list's write lock, so the transport sees rules in list order
        let stage = |node: &RuleNode, position: Option<RulePosition>| -> Result<()> {
            let transport = &self.shared.transport;
            for (set, elements) in node.sets.iter().zip(&elements) {
                transport
                    .add_set(set, elements)
                    .map_err(|e| Error::transport("create", set.to_string(), e))?;
            }
            let record = self.rule_record(node, position);
            transport
                .add_rule(&record)
                .map_err(|e| Error::transport("create", record.to_string(), e))?;
            if commit {
                self.shared.flush(&record)?;
            }
            Ok(())
        };

        let id = match position {
            None => self.rules.try_append(node, stage)?,
            Some(position) => self.rules.try_insert(node, position, stage)?,
        };
        debug!(chain = %self.record, rule = %id, ?position, "Rule created");
        Ok(id)
    }

    /// Stages removal of a rule. Sets generated for the rule go with it.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown identifier, or the transport's error.
    pub fn delete_rule(&self, id: RuleId) -> Result<()> {
        self.remove(id, false)
    }

    /// Removes a rule and commits at once.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown identifier, or the transport's error.
    pub fn delete_rule_imm(&self, id: RuleId) -> Result<()> {
        self.remove(id, true)
    }

    fn remove(&self, id: RuleId, commit: bool) -> Result<()> {
        self.rules.try_remove(id, |node| {
            let record = self.rule_record(node, None);
            self.shared
                .transport
                .del_rule(&record)
                .map_err(|e| Error::transport("delete", record.to_string(), e))?;
            if commit {
                self.shared.flush(&record)?;
            }
            Ok(())
        })?;
        info!(chain = %self.record, rule = %id, "Rule deleted");
        Ok(())
    }

    /// Returns a copy of the rule with the given identifier.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown identifier.
    pub fn rule(&self, id: RuleId) -> Result<RuleNode> {
        self.rules
            .get(id)
            .ok_or_else(|| Error::not_found(ObjectKind::Rule, format!("{} handle {id}", self.record.name)))
    }

    /// Snapshot of every rule in evaluation order
    pub fn rules(&self) -> Vec<RuleNode> {
        self.rules.dump()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.count()
    }

    /// Puts back a rule read from the transport with its identifier.
    pub(super) fn restore(&self, node: RuleNode) -> bool {
        self.rules.restore(node)
    }

    fn rule_record(&self, node: &RuleNode, position: Option<RulePosition>) -> RuleRecord {
        RuleRecord {
            table: self.record.table.clone(),
            chain: self.record.name.clone(),
            id: node.id,
            position,
            exprs: node.exprs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::error::{Error, ValidationError};
    use crate::core::expr::{Expr, SetHandle};
    use crate::core::memory::{MemoryTransport, OpKind};
    use crate::core::registry::{Chain, Nftables};
    use crate::core::rule::{L3, L4, Redirect, Rule};
    use crate::core::rule_list::RuleId;
    use crate::core::transport::Transport;
    use crate::core::types::{
        AddrSpec, ChainAttributes, ChainPriority, ChainType, Hook, L4Proto, PortSpec, TableFamily,
        Verdict,
    };
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryTransport>, Nftables, Arc<Chain>) {
        let transport = Arc::new(MemoryTransport::new());
        let nft = Nftables::new(transport.clone());
        let table = nft.create_table_imm("filter", TableFamily::Ipv4).unwrap();
        let chain = table
            .create_chain_imm(
                "input",
                ChainAttributes::base(Hook::Input, ChainType::Filter, ChainPriority::FILTER),
            )
            .unwrap();
        transport.reset_counters();
        (transport, nft, chain)
    }

    fn drop_dst(addr: &str) -> Rule {
        Rule::new()
            .with_l3(L3::destination(AddrSpec::single(addr.parse().unwrap())))
            .with_verdict(Verdict::Drop)
    }

    #[test]
    fn test_rule_ids_follow_step() {
        let (_, _, chain) = setup();
        let ids: Vec<_> = (1..=3)
            .map(|i| chain.create_rule_imm(&drop_dst(&format!("10.0.0.{i}"))).unwrap())
            .collect();
        assert_eq!(ids, vec![RuleId(10), RuleId(20), RuleId(30)]);
        assert_eq!(chain.rule_count(), 3);
        assert_eq!(chain.rule(RuleId(20)).unwrap().exprs.len(), 3);
    }

    #[test]
    fn test_positional_insert_matches_transport_order() {
        let (transport, nft, chain) = setup();
        let first = chain.create_rule(&drop_dst("10.0.0.1")).unwrap();
        let last = chain.create_rule(&drop_dst("10.0.0.3")).unwrap();
        let middle = chain.insert_rule_after(first, &drop_dst("10.0.0.2")).unwrap();
        let head = chain.insert_rule_before(first, &drop_dst("10.0.0.0")).unwrap();
        nft.flush().unwrap();

        let local: Vec<_> = chain.rules().iter().map(|n| n.id).collect();
        assert_eq!(local, vec![head, first, middle, last]);

        let table = nft.get_table("filter", TableFamily::Ipv4).unwrap();
        let remote: Vec<_> = transport
            .list_rules(table.record(), "input")
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remote, local);
    }

    #[test]
    fn test_anonymous_sets_named_and_staged() {
        let (transport, nft, chain) = setup();
        let rule = Rule::new()
            .with_l4(L4::new(L4Proto::Tcp).with_dst(PortSpec::list(vec![22, 80, 443])))
            .with_verdict(Verdict::Accept);
        let id = chain.create_rule_imm(&rule).unwrap();

        let node = chain.rule(id).unwrap();
        assert_eq!(node.sets.len(), 1);
        let set = &node.sets[0];
        assert!(set.name().starts_with("__set"));
        assert!(set.attrs.anonymous && set.attrs.constant);
        assert!(node.exprs.iter().any(|e| matches!(
            e,
            Expr::Lookup { set: SetHandle::Named { name, .. }, .. } if name == set.name()
        )));

        let table = nft.get_table("filter", TableFamily::Ipv4).unwrap();
        let listed = transport.list_sets(table.record()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(transport.list_set_elements(set).unwrap().len(), 3);

        // The set goes away with its rule
        chain.delete_rule_imm(id).unwrap();
        assert!(transport.list_sets(table.record()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_rule_never_reaches_transport() {
        let (transport, _, chain) = setup();
        let rule = drop_dst("10.0.0.1").with_redirect(Redirect {
            port: 8080,
            tproxy: false,
        });
        let err = chain.create_rule(&rule).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::MissingProtocolContext { .. })
        ));
        assert_eq!(transport.total_calls(), 0);
        assert_eq!(chain.rule_count(), 0);
    }

    #[test]
    fn test_failed_commit_keeps_chain_unchanged() {
        let (transport, _, chain) = setup();
        chain.create_rule_imm(&drop_dst("10.0.0.1")).unwrap();

        transport.fail_on(OpKind::Flush);
        let err = chain.create_rule_imm(&drop_dst("10.0.0.2")).unwrap_err();
        assert!(matches!(err, Error::Transport { op: "flush", .. }));
        assert_eq!(chain.rule_count(), 1);

        transport.clear_failures();
        assert_eq!(chain.create_rule_imm(&drop_dst("10.0.0.2")).unwrap(), RuleId(20));
    }

    #[test]
    fn test_delete_unknown_rule() {
        let (transport, _, chain) = setup();
        let err = chain.delete_rule(RuleId(10)).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(transport.calls(OpKind::DelRule), 0);

        assert!(chain.rule(RuleId(10)).unwrap_err().is_not_found());
        let err = chain.insert_rule_after(RuleId(10), &drop_dst("1.1.1.1")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let (_, _, chain) = setup();
        let err = chain.create_rule(&drop_dst("2001:db8::1")).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::AddressFamilyMismatch(_))
        ));
    }
}
