//! In-memory transport
//!
//! [`MemoryTransport`] behaves like a transactional packet filter: mutating
//! calls are queued, [`flush`](Transport::flush) applies the queue to a copy of
//! the committed state and swaps it in only if every change applies. It also
//! records every call so tests can assert on exactly what reached the
//! transport, and it can be told to fail a kind of call.

use crate::core::error::TransportError;
use crate::core::expr::{Expr, SetHandle};
use crate::core::rule_list::RulePosition;
use crate::core::set::{SetElement, SetRecord};
use crate::core::transport::{ChainRecord, RuleRecord, TableRecord, Transport};
use crate::core::types::TableFamily;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of transport call, used for counters and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumIter)]
pub enum OpKind {
    AddTable,
    DelTable,
    AddChain,
    DelChain,
    AddRule,
    DelRule,
    AddSet,
    DelSet,
    AddSetElements,
    DelSetElements,
    ListTables,
    ListChains,
    ListSets,
    ListSetElements,
    ListRules,
    Flush,
    FlushRuleset,
    Dump,
}

#[derive(Debug, Clone)]
enum StagedOp {
    AddTable(TableRecord),
    DelTable(TableRecord),
    AddChain(ChainRecord),
    DelChain(ChainRecord),
    AddRule(RuleRecord),
    DelRule(RuleRecord),
    AddSet(SetRecord, Vec<SetElement>),
    DelSet(SetRecord),
    AddSetElements(SetRecord, Vec<SetElement>),
    DelSetElements(SetRecord, Vec<SetElement>),
}

#[derive(Debug, Clone)]
struct SetState {
    record: SetRecord,
    elements: Vec<SetElement>,
}

#[derive(Debug, Clone)]
struct ChainState {
    record: ChainRecord,
    rules: Vec<RuleRecord>,
}

#[derive(Debug, Clone)]
struct TableState {
    record: TableRecord,
    chains: BTreeMap<String, ChainState>,
    sets: BTreeMap<String, SetState>,
}

type Committed = BTreeMap<TableRecord, TableState>;

#[derive(Debug, Default)]
struct Inner {
    staged: Vec<StagedOp>,
    committed: Committed,
    calls: BTreeMap<OpKind, usize>,
    history: Vec<OpKind>,
    failing: BTreeSet<OpKind>,
}

/// Recording, transactional in-memory [`Transport`]
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call of `kind` fail with [`TransportError::Rejected`].
    pub fn fail_on(&self, kind: OpKind) {
        self.inner.lock().failing.insert(kind);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failing.clear();
    }

    /// Number of calls of `kind` so far, failed ones included
    pub fn calls(&self, kind: OpKind) -> usize {
        self.inner.lock().calls.get(&kind).copied().unwrap_or(0)
    }

    /// Total number of calls of any kind
    pub fn total_calls(&self) -> usize {
        self.inner.lock().calls.values().sum()
    }

    /// Mutating and commit calls in the order they were made
    pub fn history(&self) -> Vec<OpKind> {
        self.inner.lock().history.clone()
    }

    pub fn reset_counters(&self) {
        let mut inner = self.inner.lock();
        inner.calls.clear();
        inner.history.clear();
    }

    /// Number of changes waiting for a flush
    pub fn staged_len(&self) -> usize {
        self.inner.lock().staged.len()
    }

    /// Number of committed tables
    pub fn table_count(&self) -> usize {
        self.inner.lock().committed.len()
    }

    fn record(&self, kind: OpKind) -> Result<parking_lot::MutexGuard<'_, Inner>, TransportError> {
        let mut inner = self.inner.lock();
        *inner.calls.entry(kind).or_default() += 1;
        if !kind.is_read() {
            inner.history.push(kind);
        }
        if inner.failing.contains(&kind) {
            return Err(TransportError::Rejected(format!("{kind} refused")));
        }
        Ok(inner)
    }

    fn stage(&self, kind: OpKind, op: StagedOp) -> Result<(), TransportError> {
        self.record(kind)?.staged.push(op);
        Ok(())
    }

    fn committed_table<'a>(
        committed: &'a Committed,
        table: &TableRecord,
    ) -> Result<&'a TableState, TransportError> {
        committed
            .get(table)
            .ok_or_else(|| TransportError::NotFound(table.to_string()))
    }
}

impl OpKind {
    fn is_read(self) -> bool {
        matches!(
            self,
            OpKind::ListTables
                | OpKind::ListChains
                | OpKind::ListSets
                | OpKind::ListSetElements
                | OpKind::ListRules
                | OpKind::Dump
        )
    }
}

fn table_mut<'a>(state: &'a mut Committed, table: &TableRecord) -> Result<&'a mut TableState, TransportError> {
    state
        .get_mut(table)
        .ok_or_else(|| TransportError::NotFound(table.to_string()))
}

fn chain_mut<'a>(
    state: &'a mut Committed,
    table: &TableRecord,
    chain: &str,
) -> Result<&'a mut ChainState, TransportError> {
    table_mut(state, table)?
        .chains
        .get_mut(chain)
        .ok_or_else(|| TransportError::NotFound(format!("chain {} {chain}", table.name)))
}

fn set_mut<'a>(state: &'a mut Committed, set: &SetRecord) -> Result<&'a mut SetState, TransportError> {
    table_mut(state, &set.table)?
        .sets
        .get_mut(set.name())
        .ok_or_else(|| TransportError::NotFound(set.to_string()))
}

/// Checks that every set and chain a rule refers to exists in its table.
fn check_references(table: &TableState, rule: &RuleRecord) -> Result<(), TransportError> {
    for expr in &rule.exprs {
        match expr {
            Expr::Lookup { set, .. } | Expr::Dynset { set, .. } => match set {
                SetHandle::Named { name, .. } if table.sets.contains_key(name) => {}
                SetHandle::Named { name, .. } => {
                    return Err(TransportError::NotFound(format!("set {name}")));
                }
                SetHandle::Anonymous(index) => {
                    return Err(TransportError::Rejected(format!(
                        "unbound anonymous set {index} in {rule}"
                    )));
                }
            },
            Expr::Verdict(verdict) => {
                if let Some(target) = verdict.chain()
                    && !table.chains.contains_key(target)
                {
                    return Err(TransportError::NotFound(format!("chain {target}")));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Names of anonymous sets a rule's instructions refer to
fn anonymous_sets(table: &TableState, rule: &RuleRecord) -> Vec<String> {
    rule.exprs
        .iter()
        .filter_map(|expr| match expr {
            Expr::Lookup {
                set: SetHandle::Named { name, .. },
                ..
            }
            | Expr::Dynset {
                set: SetHandle::Named { name, .. },
                ..
            } => Some(name),
            _ => None,
        })
        .filter(|name| table.sets.get(*name).is_some_and(|s| s.record.attrs.anonymous))
        .cloned()
        .collect()
}

fn apply(state: &mut Committed, op: StagedOp) -> Result<(), TransportError> {
    match op {
        StagedOp::AddTable(table) => {
            state.entry(table.clone()).or_insert_with(|| TableState {
                record: table,
                chains: BTreeMap::new(),
                sets: BTreeMap::new(),
            });
        }
        StagedOp::DelTable(table) => {
            state
                .remove(&table)
                .ok_or_else(|| TransportError::NotFound(table.to_string()))?;
        }
        StagedOp::AddChain(chain) => {
            let table = table_mut(state, &chain.table)?;
            match table.chains.get_mut(&chain.name) {
                Some(existing) => existing.record = chain,
                None => {
                    table.chains.insert(
                        chain.name.clone(),
                        ChainState {
                            record: chain,
                            rules: Vec::new(),
                        },
                    );
                }
            }
        }
        StagedOp::DelChain(chain) => {
            let table = table_mut(state, &chain.table)?;
            let removed = table
                .chains
                .remove(&chain.name)
                .ok_or_else(|| TransportError::NotFound(chain.to_string()))?;
            for rule in &removed.rules {
                for name in anonymous_sets(table, rule) {
                    table.sets.remove(&name);
                }
            }
        }
        StagedOp::AddRule(rule) => {
            check_references(table_mut(state, &rule.table)?, &rule)?;
            let chain = chain_mut(state, &rule.table, &rule.chain)?;
            if chain.rules.iter().any(|r| r.id == rule.id) {
                return Err(TransportError::Exists(rule.to_string()));
            }
            let index = match rule.position {
                None => chain.rules.len(),
                Some(pos) => {
                    let found = chain
                        .rules
                        .iter()
                        .position(|r| r.id == pos.anchor())
                        .ok_or_else(|| TransportError::NotFound(format!("rule handle {}", pos.anchor())))?;
                    match pos {
                        RulePosition::After(_) => found + 1,
                        RulePosition::Before(_) => found,
                    }
                }
            };
            let stored = RuleRecord {
                position: None,
                ..rule
            };
            chain.rules.insert(index, stored);
        }
        StagedOp::DelRule(rule) => {
            let chain = chain_mut(state, &rule.table, &rule.chain)?;
            let index = chain
                .rules
                .iter()
                .position(|r| r.id == rule.id)
                .ok_or_else(|| TransportError::NotFound(rule.to_string()))?;
            let removed = chain.rules.remove(index);

            // Anonymous sets live and die with the rule that uses them
            let table = table_mut(state, &rule.table)?;
            for name in anonymous_sets(table, &removed) {
                table.sets.remove(&name);
            }
        }
        StagedOp::AddSet(set, elements) => {
            let table = table_mut(state, &set.table)?;
            if table.sets.contains_key(set.name()) {
                return Err(TransportError::Exists(set.to_string()));
            }
            table.sets.insert(
                set.name().to_string(),
                SetState {
                    record: set,
                    elements,
                },
            );
        }
        StagedOp::DelSet(set) => {
            table_mut(state, &set.table)?
                .sets
                .remove(set.name())
                .ok_or_else(|| TransportError::NotFound(set.to_string()))?;
        }
        StagedOp::AddSetElements(set, elements) => {
            let target = set_mut(state, &set)?;
            for element in elements {
                if !target.elements.contains(&element) {
                    target.elements.push(element);
                }
            }
        }
        StagedOp::DelSetElements(set, elements) => {
            let target = set_mut(state, &set)?;
            for element in &elements {
                let index = target
                    .elements
                    .iter()
                    .position(|e| e == element)
                    .ok_or_else(|| TransportError::NotFound(format!("element of {set}")))?;
                target.elements.remove(index);
            }
        }
    }
    Ok(())
}

fn chain_json(chain: &ChainRecord) -> Value {
    let mut obj = json!({
        "family": chain.table.family.to_string(),
        "table": chain.table.name,
        "name": chain.name,
    });
    if let Some(hook) = chain.attrs.hook {
        obj["hook"] = json!(hook.to_string());
    }
    if let Some(prio) = chain.attrs.priority {
        obj["prio"] = json!(prio.0);
    }
    if let Some(chain_type) = chain.attrs.chain_type {
        obj["type"] = json!(chain_type.to_string());
    }
    if let Some(policy) = chain.attrs.policy {
        obj["policy"] = json!(policy.to_string());
    }
    if let Some(dev) = &chain.attrs.device {
        obj["dev"] = json!(dev);
    }
    json!({ "chain": obj })
}

impl Transport for MemoryTransport {
    fn add_table(&self, table: &TableRecord) -> Result<(), TransportError> {
        self.stage(OpKind::AddTable, StagedOp::AddTable(table.clone()))
    }

    fn del_table(&self, table: &TableRecord) -> Result<(), TransportError> {
        self.stage(OpKind::DelTable, StagedOp::DelTable(table.clone()))
    }

    fn add_chain(&self, chain: &ChainRecord) -> Result<(), TransportError> {
        self.stage(OpKind::AddChain, StagedOp::AddChain(chain.clone()))
    }

    fn del_chain(&self, chain: &ChainRecord) -> Result<(), TransportError> {
        self.stage(OpKind::DelChain, StagedOp::DelChain(chain.clone()))
    }

    fn add_rule(&self, rule: &RuleRecord) -> Result<(), TransportError> {
        self.stage(OpKind::AddRule, StagedOp::AddRule(rule.clone()))
    }

    fn del_rule(&self, rule: &RuleRecord) -> Result<(), TransportError> {
        self.stage(OpKind::DelRule, StagedOp::DelRule(rule.clone()))
    }

    fn add_set(&self, set: &SetRecord, elements: &[SetElement]) -> Result<(), TransportError> {
        self.stage(OpKind::AddSet, StagedOp::AddSet(set.clone(), elements.to_vec()))
    }

    fn del_set(&self, set: &SetRecord) -> Result<(), TransportError> {
        self.stage(OpKind::DelSet, StagedOp::DelSet(set.clone()))
    }

    fn add_set_elements(&self, set: &SetRecord, elements: &[SetElement]) -> Result<(), TransportError> {
        self.stage(
            OpKind::AddSetElements,
            StagedOp::AddSetElements(set.clone(), elements.to_vec()),
        )
    }

    fn del_set_elements(&self, set: &SetRecord, elements: &[SetElement]) -> Result<(), TransportError> {
        self.stage(
            OpKind::DelSetElements,
            StagedOp::DelSetElements(set.clone(), elements.to_vec()),
        )
    }

    fn list_tables(&self, family: Option<TableFamily>) -> Result<Vec<TableRecord>, TransportError> {
        let inner = self.record(OpKind::ListTables)?;
        Ok(inner
            .committed
            .keys()
            .filter(|t| family.is_none_or(|f| t.family == f))
            .cloned()
            .collect())
    }

    fn list_chains(&self, table: &TableRecord) -> Result<Vec<ChainRecord>, TransportError> {
        let inner = self.record(OpKind::ListChains)?;
        let table = Self::committed_table(&inner.committed, table)?;
        Ok(table.chains.values().map(|c| c.record.clone()).collect())
    }

    fn list_sets(&self, table: &TableRecord) -> Result<Vec<SetRecord>, TransportError> {
        let inner = self.record(OpKind::ListSets)?;
        let table = Self::committed_table(&inner.committed, table)?;
        Ok(table.sets.values().map(|s| s.record.clone()).collect())
    }

    fn list_set_elements(&self, set: &SetRecord) -> Result<Vec<SetElement>, TransportError> {
        let inner = self.record(OpKind::ListSetElements)?;
        let table = Self::committed_table(&inner.committed, &set.table)?;
        table
            .sets
            .get(set.name())
            .map(|s| s.elements.clone())
            .ok_or_else(|| TransportError::NotFound(set.to_string()))
    }

    fn list_rules(&self, table: &TableRecord, chain: &str) -> Result<Vec<RuleRecord>, TransportError> {
        let inner = self.record(OpKind::ListRules)?;
        let state = Self::committed_table(&inner.committed, table)?;
        state
            .chains
            .get(chain)
            .map(|c| c.rules.clone())
            .ok_or_else(|| TransportError::NotFound(format!("chain {} {chain}", table.name)))
    }

    fn flush(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        // A refused commit still consumes the batch
        let staged = std::mem::take(&mut inner.staged);
        drop(inner);

        let mut inner = self.record(OpKind::Flush)?;
        let mut next = inner.committed.clone();
        for op in staged {
            apply(&mut next, op)?;
        }
        inner.committed = next;
        Ok(())
    }

    fn flush_ruleset(&self) -> Result<(), TransportError> {
        let mut inner = self.record(OpKind::FlushRuleset)?;
        inner.staged.clear();
        inner.committed.clear();
        Ok(())
    }

    fn dump(&self) -> Result<Value, TransportError> {
        let inner = self.record(OpKind::Dump)?;
        let mut objects = Vec::new();
        for table in inner.committed.values() {
            objects.push(json!({
                "table": { "family": table.record.family.to_string(), "name": table.record.name }
            }));
            for chain in table.chains.values() {
                objects.push(chain_json(&chain.record));
            }
            for set in table.sets.values() {
                let attrs = &set.record.attrs;
                let elements: Vec<Value> = set
                    .elements
                    .iter()
                    .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
                    .collect();
                objects.push(json!({
                    "set": {
                        "family": table.record.family.to_string(),
                        "table": table.record.name,
                        "name": attrs.name,
                        "id": set.record.id,
                        "type": serde_json::to_value(&attrs.key).unwrap_or(Value::Null),
                        "flags": attrs.flags(),
                        "elem": elements,
                    }
                }));
            }
            for chain in table.chains.values() {
                for rule in &chain.rules {
                    objects.push(json!({
                        "rule": {
                            "family": table.record.family.to_string(),
                            "table": table.record.name,
                            "chain": chain.record.name,
                            "handle": rule.id,
                            "expr": serde_json::to_value(&rule.exprs).unwrap_or(Value::Null),
                        }
                    }));
                }
            }
        }
        Ok(json!({ "nftables": objects }))
    }
}
