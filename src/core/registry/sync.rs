//! Rebuilding the registry from what the transport reports
//!
//! Sync only reads from the transport. Objects the transport knows and the
//! registry does not are added; anything the registry already holds is kept
//! as is, even if the transport's copy differs.

use super::{Nftables, Table};
use crate::core::error::{Error, Result};
use crate::core::expr::{Expr, SetHandle};
use crate::core::rule_list::RuleNode;
use crate::core::set::{SetRecord, reserve_set_id};
use crate::core::transport::{RuleRecord, TableRecord};
use crate::core::types::TableFamily;
use std::sync::Arc;
use tracing::{debug, info};

/// Number of objects a sync added to the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub tables: usize,
    pub chains: usize,
    pub sets: usize,
    pub rules: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Anonymous sets a rule's instructions refer to
fn rule_sets(rule: &RuleRecord, anonymous: &[SetRecord]) -> Vec<SetRecord> {
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
            } => anonymous.iter().find(|s| s.name() == name),
            _ => None,
        })
        .cloned()
        .collect()
}

impl Nftables {
    /// Reads back tables of `family` (all families for `None`) from the
    /// transport and adds whatever the registry is missing.
    ///
    /// # Errors
    ///
    /// Returns the first transport error. Objects added before the error stay.
    pub fn sync(&self, family: Option<TableFamily>) -> Result<SyncReport> {
        let transport = &self.shared().transport;
        let mut report = SyncReport::default();

        let listed = transport
            .list_tables(family)
            .map_err(|e| Error::transport("list", "tables", e))?;
        for record in listed {
            let table = self.adopt_table(&record, &mut report);
            Self::sync_table(&table, &mut report)?;
        }

        info!(
            family = ?family,
            tables = report.tables,
            chains = report.chains,
            sets = report.sets,
            rules = report.rules,
            "Registry synced"
        );
        Ok(report)
    }

    fn adopt_table(&self, record: &TableRecord, report: &mut SyncReport) -> Arc<Table> {
        let mut tables = self.tables_mut();
        let by_name = tables.entry(record.family).or_default();
        if let Some(existing) = by_name.get(&record.name) {
            return Arc::clone(existing);
        }
        let table = Arc::new(Table::new(record.clone(), Arc::clone(self.shared())));
        by_name.insert(record.name.clone(), Arc::clone(&table));
        report.tables += 1;
        debug!(table = %record, "Table adopted from transport");
        table
    }

    fn sync_table(table: &Table, report: &mut SyncReport) -> Result<()> {
        let transport = &table.shared().transport;
        let record = table.record();

        let listed = transport
            .list_sets(record)
            .map_err(|e| Error::transport("list", record.to_string(), e))?;
        // Generated names embed the id, so new sets must not reuse one
        for set in &listed {
            reserve_set_id(set.id);
        }
        let (anonymous, named): (Vec<SetRecord>, Vec<SetRecord>) =
            listed.into_iter().partition(|s| s.attrs.anonymous);
        for set in named {
            if table.sets().adopt(set) {
                report.sets += 1;
            }
        }

        let chains = transport
            .list_chains(record)
            .map_err(|e| Error::transport("list", record.to_string(), e))?;
        for chain_record in chains {
            let name = chain_record.name.clone();
            let (chain, added) = table.adopt_chain(chain_record);
            if !added {
                continue;
            }
            report.chains += 1;

            let rules = transport
                .list_rules(record, &name)
                .map_err(|e| Error::transport("list", chain.record().to_string(), e))?;
            for rule in rules {
                let sets = rule_sets(&rule, &anonymous);
                let node = RuleNode {
                    id: rule.id,
                    exprs: rule.exprs,
                    sets,
                };
                if chain.restore(node) {
                    report.rules += 1;
                }
            }
            debug!(chain = %chain.record(), rules = chain.rule_count(), "Chain adopted from transport");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::{MemoryTransport, OpKind};
    use crate::core::rule::{L3, L4, Rule};
    use crate::core::rule_list::RuleId;
    use crate::core::set::{SetAttributes, SetKeyType, next_set_id};
    use crate::core::transport::Transport;
    use crate::core::types::{AddrSpec, ChainAttributes, L4Proto, PortSpec, Verdict};

    fn populate(transport: &Arc<MemoryTransport>) {
        let nft = Nftables::new(transport.clone());
        let table = nft.create_table_imm("filter", TableFamily::Ipv4).unwrap();
        table
            .sets()
            .create_set(SetAttributes::new("blocked", SetKeyType::Ipv4Addr), &[])
            .unwrap();
        let chain = table.create_chain_imm("input", ChainAttributes::default()).unwrap();
        chain
            .create_rule_imm(
                &Rule::new()
                    .with_l3(L3::source(AddrSpec::single("10.0.0.1".parse().unwrap())))
                    .with_verdict(Verdict::Drop),
            )
            .unwrap();
        chain
            .create_rule_imm(
                &Rule::new()
                    .with_l4(L4::new(L4Proto::Tcp).with_dst(PortSpec::list(vec![22, 80])))
                    .with_verdict(Verdict::Accept),
            )
            .unwrap();
        nft.create_table_imm("other", TableFamily::Ipv6).unwrap();
    }

    #[test]
    fn test_sync_rebuilds_registry() {
        let transport = Arc::new(MemoryTransport::new());
        populate(&transport);

        let fresh = Nftables::new(transport.clone());
        transport.reset_counters();
        let report = fresh.sync(None).unwrap();
        assert_eq!(
            report,
            SyncReport {
                tables: 2,
                chains: 1,
                sets: 1,
                rules: 2,
            }
        );
        // Sync never mutates the transport
        assert!(transport.history().is_empty());

        let table = fresh.get_table("filter", TableFamily::Ipv4).unwrap();
        assert!(table.sets().exist_set("blocked"));
        let chain = table.chain("input").unwrap();
        let rules = chain.rules();
        assert_eq!(rules.iter().map(|r| r.id).collect::<Vec<_>>(), vec![RuleId(10), RuleId(20)]);
        assert!(rules[0].sets.is_empty());
        assert_eq!(rules[1].sets.len(), 1);

        // New rules continue after the highest restored identifier
        let id = chain
            .create_rule(&Rule::new().with_verdict(Verdict::Accept))
            .unwrap();
        assert_eq!(id, RuleId(30));
    }

    #[test]
    fn test_sync_reserves_adopted_set_ids() {
        let transport = Arc::new(MemoryTransport::new());
        let table = TableRecord {
            name: "t".to_string(),
            family: TableFamily::Ipv4,
        };
        // A set left behind by an earlier process, named after an id this
        // process has not handed out yet
        let id = next_set_id() + 1;
        let mut attrs = SetAttributes::new(format!("__set{id}"), SetKeyType::InetService).constant();
        attrs.anonymous = true;
        transport.add_table(&table).unwrap();
        transport
            .add_set(
                &SetRecord {
                    table: table.clone(),
                    id,
                    attrs,
                },
                &[],
            )
            .unwrap();
        transport.flush().unwrap();

        let nft = Nftables::new(transport.clone());
        nft.sync(None).unwrap();
        assert!(next_set_id() > id);

        let chain = nft
            .get_table("t", TableFamily::Ipv4)
            .unwrap()
            .create_chain_imm("c", ChainAttributes::default())
            .unwrap();
        let rule = Rule::new()
            .with_l4(L4::new(L4Proto::Tcp).with_dst(PortSpec::list(vec![80, 443])))
            .with_verdict(Verdict::Accept);
        assert_eq!(chain.create_rule_imm(&rule).unwrap(), RuleId(10));
        assert_eq!(transport.list_sets(&table).unwrap().len(), 2);
    }

    #[test]
    fn test_sync_filters_family() {
        let transport = Arc::new(MemoryTransport::new());
        populate(&transport);

        let fresh = Nftables::new(transport.clone());
        let report = fresh.sync(Some(TableFamily::Ipv6)).unwrap();
        assert_eq!(report.tables, 1);
        assert_eq!(fresh.families(), vec![TableFamily::Ipv6]);
    }

    #[test]
    fn test_sync_keeps_memory_copy() {
        let transport = Arc::new(MemoryTransport::new());
        populate(&transport);

        let nft = Nftables::new(transport.clone());
        let table = nft.table("filter", TableFamily::Ipv4).unwrap();
        let local = table.create_chain("input", ChainAttributes::default()).unwrap();

        let report = nft.sync(None).unwrap();
        assert_eq!(report.tables, 1);
        assert_eq!(report.chains, 0);
        assert_eq!(report.rules, 0);
        assert!(Arc::ptr_eq(&local, &table.chain("input").unwrap()));
        assert_eq!(local.rule_count(), 0);

        // A second pass finds nothing new
        assert!(nft.sync(None).unwrap().is_empty());
    }

    #[test]
    fn test_sync_propagates_transport_errors() {
        let transport = Arc::new(MemoryTransport::new());
        populate(&transport);
        transport.fail_on(OpKind::ListTables);

        let nft = Nftables::new(transport.clone());
        let err = nft.sync(None).unwrap_err();
        assert!(matches!(err, Error::Transport { op: "list", .. }));
        assert!(nft.tables(None).is_empty());
    }
}
