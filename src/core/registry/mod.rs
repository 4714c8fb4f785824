//! Live object model: tables, chains, rules and sets
//!
//! [`Nftables`] owns every table, grouped by family. A [`Table`] owns its
//! chains and its [`SetRegistry`]; a [`Chain`] owns the ordered list of its
//! compiled rules. Each level guards its own map with its own lock, so work on
//! different tables or chains does not contend.
//!
//! Creation and deletion of tables, chains and rules come in two flavours.
//! The plain form only stages the change with the transport and leaves the
//! commit to [`Nftables::flush`]; the `_imm` form stages and commits at once.
//! Set operations always commit.

mod chains;
mod rules;
mod sets;
mod sync;

pub use chains::Table;
pub use rules::Chain;
pub use sets::SetRegistry;
pub use sync::SyncReport;

use crate::config::Config;
use crate::core::error::{Error, ObjectKind, Result};
use crate::core::transport::{TableRecord, Transport};
use crate::core::types::TableFamily;
use crate::validators::validate_object_name;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by every object of one registry
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: Config,
}

impl Shared {
    pub(crate) fn flush(&self, object: &dyn std::fmt::Display) -> Result<()> {
        self.transport.flush().map_err(|e| {
            warn!(%object, error = %e, "Transport flush failed");
            Error::transport("flush", object.to_string(), e)
        })
    }
}

type FamilyMap = BTreeMap<TableFamily, BTreeMap<String, Arc<Table>>>;

/// Root of the object model
pub struct Nftables {
    shared: Arc<Shared>,
    tables: RwLock<FamilyMap>,
}

impl std::fmt::Debug for Nftables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nftables")
            .field("config", &self.shared.config)
            .field("tables", &self.tables(None))
            .finish_non_exhaustive()
    }
}

impl Nftables {
    /// Creates an empty registry with default settings.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config: Config::default(),
            }),
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates an empty registry with the given settings.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the config fails validation.
    pub fn with_config(transport: Arc<dyn Transport>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared { transport, config }),
            tables: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Stages creation of a table, replacing any table with the same family and name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the name is invalid or the transport rejects the change.
    pub fn create_table(&self, name: &str, family: TableFamily) -> Result<Arc<Table>> {
        self.create(name, family, false)
    }

    /// Creates a table and commits at once.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the name is invalid or the transport rejects the change.
    pub fn create_table_imm(&self, name: &str, family: TableFamily) -> Result<Arc<Table>> {
        self.create(name, family, true)
    }

    fn create(&self, name: &str, family: TableFamily, commit: bool) -> Result<Arc<Table>> {
        validate_object_name(ObjectKind::Table, name)?;
        let record = TableRecord::new(name, family);
        let transport = &self.shared.transport;

        let mut tables = self.tables.write();
        let replaced = tables
            .get(&family)
            .is_some_and(|by_name| by_name.contains_key(name));
        if replaced {
            transport
                .del_table(&record)
                .map_err(|e| Error::transport("delete", record.to_string(), e))?;
            if let Some(by_name) = tables.get_mut(&family) {
                by_name.remove(name);
            }
            debug!(table = %record, "Replacing existing table");
        }

        transport
            .add_table(&record)
            .map_err(|e| Error::transport("create", record.to_string(), e))?;
        if commit {
            self.shared.flush(&record)?;
        }

        let table = Arc::new(Table::new(record, Arc::clone(&self.shared)));
        tables
            .entry(family)
            .or_default()
            .insert(name.to_string(), Arc::clone(&table));
        info!(table = %table.record(), replaced, "Table created");
        Ok(table)
    }

    /// Returns the table, creating and committing it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the table has to be created and creation fails.
    pub fn table(&self, name: &str, family: TableFamily) -> Result<Arc<Table>> {
        if let Some(table) = self.get_table(name, family) {
            return Ok(table);
        }

        // Re-check under the write lock; another thread may have created it
        validate_object_name(ObjectKind::Table, name)?;
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(&family).and_then(|t| t.get(name)) {
            return Ok(Arc::clone(table));
        }
        let record = TableRecord::new(name, family);
        self.shared
            .transport
            .add_table(&record)
            .map_err(|e| Error::transport("create", record.to_string(), e))?;
        self.shared.flush(&record)?;

        let table = Arc::new(Table::new(record, Arc::clone(&self.shared)));
        tables
            .entry(family)
            .or_default()
            .insert(name.to_string(), Arc::clone(&table));
        info!(table = %table.record(), "Table created on first use");
        Ok(table)
    }

    /// Looks up a table without creating it.
    pub fn get_table(&self, name: &str, family: TableFamily) -> Option<Arc<Table>> {
        self.tables
            .read()
            .get(&family)
            .and_then(|t| t.get(name))
            .cloned()
    }

    /// Stages deletion of a table and everything in it.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown table, or the transport's error.
    pub fn delete_table(&self, name: &str, family: TableFamily) -> Result<()> {
        self.delete(name, family, false)
    }

    /// Deletes a table and commits at once.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown table, or the transport's error.
    pub fn delete_table_imm(&self, name: &str, family: TableFamily) -> Result<()> {
        self.delete(name, family, true)
    }

    fn delete(&self, name: &str, family: TableFamily, commit: bool) -> Result<()> {
        let mut tables = self.tables.write();
        let record = tables
            .get(&family)
            .and_then(|t| t.get(name))
            .map(|t| t.record().clone())
            .ok_or_else(|| Error::not_found(ObjectKind::Table, format!("{family} {name}")))?;

        self.shared
            .transport
            .del_table(&record)
            .map_err(|e| Error::transport("delete", record.to_string(), e))?;
        if commit {
            self.shared.flush(&record)?;
        }

        if let Some(by_name) = tables.get_mut(&family) {
            by_name.remove(name);
            if by_name.is_empty() {
                tables.remove(&family);
            }
        }
        info!(table = %record, "Table deleted");
        Ok(())
    }

    /// Returns `true` if the registry holds the table. Never calls the transport.
    pub fn exist_table(&self, name: &str, family: TableFamily) -> bool {
        self.get_table(name, family).is_some()
    }

    /// Families that currently hold at least one table
    pub fn families(&self) -> Vec<TableFamily> {
        self.tables.read().keys().copied().collect()
    }

    /// Tables in the registry, optionally restricted to one family
    pub fn tables(&self, family: Option<TableFamily>) -> Vec<TableRecord> {
        self.tables
            .read()
            .iter()
            .filter(|(f, _)| family.is_none_or(|wanted| **f == wanted))
            .flat_map(|(_, by_name)| by_name.values().map(|t| t.record().clone()))
            .collect()
    }

    /// Commits every staged change.
    ///
    /// # Errors
    ///
    /// Returns the transport's error; the staged batch is lost.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush(&"ruleset")
    }

    /// Drops every table from the transport and from the registry.
    ///
    /// # Errors
    ///
    /// Returns the transport's error; the registry is left untouched.
    pub fn flush_ruleset(&self) -> Result<()> {
        let mut tables = self.tables.write();
        self.shared
            .transport
            .flush_ruleset()
            .map_err(|e| Error::transport("flush", "ruleset", e))?;
        tables.clear();
        info!("Ruleset flushed");
        Ok(())
    }

    /// JSON representation of the committed ruleset, as reported by the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub fn dump(&self) -> Result<serde_json::Value> {
        self.shared
            .transport
            .dump()
            .map_err(|e| Error::transport("dump", "ruleset", e))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn tables_mut(&self) -> parking_lot::RwLockWriteGuard<'_, FamilyMap> {
        self.tables.write()
    }
}
