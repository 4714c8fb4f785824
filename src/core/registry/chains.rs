//! Tables and the chains they hold
//!
//! Chain changes are staged on the transport unless the `_imm` variant is
//! used. The registry map only changes once the transport accepted the call.

use super::{Chain, SetRegistry, Shared};
use crate::core::error::{Error, ObjectKind, Result};
use crate::core::transport::{ChainRecord, TableRecord};
use crate::core::types::{ChainAttributes, TableFamily};
use crate::validators::validate_object_name;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A table and the chains and sets it holds
pub struct Table {
    record: TableRecord,
    shared: Arc<Shared>,
    chains: RwLock<BTreeMap<String, Arc<Chain>>>,
    sets: SetRegistry,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("record", &self.record)
            .field("chains", &self.chains())
            .finish_non_exhaustive()
    }
}

impl Table {
    pub(super) fn new(record: TableRecord, shared: Arc<Shared>) -> Self {
        let sets = SetRegistry::new(record.clone(), Arc::clone(&shared));
        Self {
            record,
            shared,
            chains: RwLock::new(BTreeMap::new()),
            sets,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn family(&self) -> TableFamily {
        self.record.family
    }

    pub fn record(&self) -> &TableRecord {
        &self.record
    }

    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Named sets and maps of this table
    pub fn sets(&self) -> &SetRegistry {
        &self.sets
    }

    /// Stages creation of a chain, replacing any chain with the same name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the name or attributes are invalid, or the transport
    /// rejects the change.
    pub fn create_chain(&self, name: &str, attrs: ChainAttributes) -> Result<Arc<Chain>> {
        self.create(name, attrs, false)
    }

    /// Creates a chain and commits at once.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the name or attributes are invalid, or the transport
    /// rejects the change.
    pub fn create_chain_imm(&self, name: &str, attrs: ChainAttributes) -> Result<Arc<Chain>> {
        self.create(name, attrs, true)
    }

    fn create(&self, name: &str, attrs: ChainAttributes, commit: bool) -> Result<Arc<Chain>> {
        validate_object_name(ObjectKind::Chain, name)?;
        attrs.validate()?;
        if let Some(device) = &attrs.device {
            crate::validators::validate_interface(device)?;
        }

        let record = ChainRecord {
            table: self.record.clone(),
            name: name.to_string(),
            attrs,
        };
        let transport = &self.shared.transport;

        let mut chains = self.chains.write();
        let replaced = chains.contains_key(name);
        if replaced {
            transport
                .del_chain(&record)
                .map_err(|e| Error::transport("delete", record.to_string(), e))?;
            debug!(chain = %record, "Replacing existing chain");
        }

        transport
            .add_chain(&record)
            .map_err(|e| Error::transport("create", record.to_string(), e))?;
        if commit {
            self.shared.flush(&record)?;
        }

        // The map keeps the old chain until the transport accepted its replacement
        let chain = Arc::new(Chain::new(record, Arc::clone(&self.shared)));
        chains.insert(name.to_string(), Arc::clone(&chain));
        info!(chain = %chain.record(), base = chain.attributes().is_base(), replaced, "Chain created");
        Ok(chain)
    }

    /// Returns the named chain.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the table has no such chain.
    pub fn chain(&self, name: &str) -> Result<Arc<Chain>> {
        self.chains
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(ObjectKind::Chain, format!("{} {name}", self.record.name)))
    }

    /// Stages deletion of a chain together with its rules.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown chain, or the transport's error.
    pub fn delete_chain(&self, name: &str) -> Result<()> {
        self.delete(name, false)
    }

    /// Deletes a chain and commits at once.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown chain, or the transport's error.
    pub fn delete_chain_imm(&self, name: &str) -> Result<()> {
        self.delete(name, true)
    }

    fn delete(&self, name: &str, commit: bool) -> Result<()> {
        let mut chains = self.chains.write();
        let record = chains
            .get(name)
            .map(|c| c.record().clone())
            .ok_or_else(|| Error::not_found(ObjectKind::Chain, format!("{} {name}", self.record.name)))?;

        self.shared
            .transport
            .del_chain(&record)
            .map_err(|e| Error::transport("delete", record.to_string(), e))?;
        if commit {
            self.shared.flush(&record)?;
        }

        chains.remove(name);
        info!(chain = %record, "Chain deleted");
        Ok(())
    }

    /// Returns `true` if the table holds the chain. Never calls the transport.
    pub fn exist_chain(&self, name: &str) -> bool {
        self.chains.read().contains_key(name)
    }

    /// Chain names in lexical order
    pub fn chains(&self) -> Vec<String> {
        self.chains.read().keys().cloned().collect()
    }

    /// Adds a chain read back from the transport unless one with that name
    /// is already known. Returns the chain and whether it was added.
    pub(super) fn adopt_chain(&self, record: ChainRecord) -> (Arc<Chain>, bool) {
        let mut chains = self.chains.write();
        if let Some(existing) = chains.get(&record.name) {
            return (Arc::clone(existing), false);
        }
        let name = record.name.clone();
        let chain = Arc::new(Chain::new(record, Arc::clone(&self.shared)));
        chains.insert(name, Arc::clone(&chain));
        (chain, true)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::error::{Error, ValidationError};
    use crate::core::memory::{MemoryTransport, OpKind};
    use crate::core::registry::Nftables;
    use crate::core::transport::Transport;
    use crate::core::types::{ChainAttributes, ChainPriority, ChainType, Hook, TableFamily};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryTransport>, Arc<super::Table>) {
        let transport = Arc::new(MemoryTransport::new());
        let nft = Nftables::new(transport.clone());
        let table = nft.create_table_imm("filter", TableFamily::Ipv4).unwrap();
        transport.reset_counters();
        (transport, table)
    }

    #[test]
    fn test_create_chain_twice_replaces() {
        let (transport, table) = setup();
        table.create_chain_imm("input", ChainAttributes::default()).unwrap();
        table.create_chain_imm("input", ChainAttributes::default()).unwrap();

        assert_eq!(table.chains(), vec!["input".to_string()]);
        assert_eq!(
            transport.history(),
            vec![
                OpKind::AddChain,
                OpKind::Flush,
                OpKind::DelChain,
                OpKind::AddChain,
                OpKind::Flush
            ]
        );
    }

    #[test]
    fn test_refused_replace_keeps_existing_chain() {
        let (transport, table) = setup();
        let original = table.create_chain_imm("input", ChainAttributes::default()).unwrap();
        transport.fail_on(OpKind::DelChain);

        let err = table.create_chain_imm("input", ChainAttributes::default()).unwrap_err();
        assert!(matches!(err, Error::Transport { op: "delete", .. }));
        assert!(table.exist_chain("input"));
        assert!(Arc::ptr_eq(&original, &table.chain("input").unwrap()));

        transport.clear_failures();
        let chains = transport.list_chains(table.record()).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].name, "input");
    }

    #[test]
    fn test_inconsistent_base_attributes_rejected() {
        let (transport, table) = setup();
        let attrs = ChainAttributes {
            hook: Some(Hook::Input),
            ..ChainAttributes::default()
        };
        let err = table.create_chain("input", attrs).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::ChainAttributes(_))));
        assert_eq!(transport.total_calls(), 0);
        assert!(!table.exist_chain("input"));
    }

    #[test]
    fn test_chain_lookup_and_delete() {
        let (transport, table) = setup();
        let attrs = ChainAttributes::base(Hook::Input, ChainType::Filter, ChainPriority::FILTER);
        table.create_chain_imm("input", attrs.clone()).unwrap();

        let chain = table.chain("input").unwrap();
        assert_eq!(chain.attributes(), &attrs);
        assert!(table.chain("output").unwrap_err().is_not_found());

        table.delete_chain_imm("input").unwrap();
        assert!(!table.exist_chain("input"));
        assert!(table.delete_chain("input").unwrap_err().is_not_found());
        assert_eq!(transport.calls(OpKind::DelChain), 1);
    }

    #[test]
    fn test_chains_listed_in_order() {
        let (_, table) = setup();
        for name in ["output", "forward", "input"] {
            table.create_chain(name, ChainAttributes::default()).unwrap();
        }
        assert_eq!(table.chains(), vec!["forward", "input", "output"]);
    }
}
