//! Named sets and maps of a table
//!
//! Interval sets are collapsed and encoded before they reach the transport.

use super::Shared;
use crate::core::error::{Error, ObjectKind, Result};
use crate::core::expr::SetHandle;
use crate::core::interval::build_interval_elements;
use crate::core::set::{SetAttributes, SetElement, SetRecord, next_set_id};
use crate::core::transport::TableRecord;
use crate::core::types::Address;
use crate::validators::validate_object_name;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Named sets and maps of one table.
///
/// Unlike tables, chains and rules, every set operation commits before it
/// returns.
pub struct SetRegistry {
    table: TableRecord,
    shared: Arc<Shared>,
    sets: RwLock<BTreeMap<String, SetRecord>>,
}

impl std::fmt::Debug for SetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetRegistry")
            .field("table", &self.table)
            .field("sets", &self.names())
            .finish_non_exhaustive()
    }
}

impl SetRegistry {
    pub(super) fn new(table: TableRecord, shared: Arc<Shared>) -> Self {
        Self {
            table,
            shared,
            sets: RwLock::new(BTreeMap::new()),
        }
    }

    fn lookup(&self, name: &str) -> Result<SetRecord> {
        self.get(name)
            .ok_or_else(|| Error::not_found(ObjectKind::Set, format!("{} {name}", self.table.name)))
    }

    /// Creates a set with its initial elements, replacing any set with the same name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the name is invalid or the transport rejects the set.
    pub fn create_set(&self, attrs: SetAttributes, elements: &[SetElement]) -> Result<SetRecord> {
        validate_object_name(ObjectKind::Set, &attrs.name)?;
        let record = SetRecord {
            table: self.table.clone(),
            id: next_set_id(),
            attrs,
        };
        let transport = &self.shared.transport;

        let mut sets = self.sets.write();
        let replaced = sets.get(record.name()).cloned();
        if let Some(old) = &replaced {
            transport
                .del_set(old)
                .map_err(|e| Error::transport("delete", old.to_string(), e))?;
        }
        transport
            .add_set(&record, elements)
            .map_err(|e| Error::transport("create", record.to_string(), e))?;
        self.shared.flush(&record)?;

        sets.insert(record.name().to_string(), record.clone());
        info!(
            set = %record,
            id = record.id,
            elements = elements.len(),
            replaced = replaced.is_some(),
            "Set created"
        );
        Ok(record)
    }

    /// Creates an interval set holding the given prefixes.
    ///
    /// Overlapping prefixes are collapsed and adjacent ones merged before the
    /// interval elements are built.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the prefixes mix address families, or as
    /// [`create_set`](Self::create_set).
    pub fn create_interval_set(&self, attrs: SetAttributes, prefixes: &[Address]) -> Result<SetRecord> {
        let elements = build_interval_elements(prefixes)?;
        self.create_set(attrs.interval(), &elements)
    }

    /// Deletes a named set.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown set, or the transport's error.
    pub fn del_set(&self, name: &str) -> Result<()> {
        let mut sets = self.sets.write();
        let record = sets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(ObjectKind::Set, format!("{} {name}", self.table.name)))?;

        self.shared
            .transport
            .del_set(&record)
            .map_err(|e| Error::transport("delete", record.to_string(), e))?;
        self.shared.flush(&record)?;

        sets.remove(name);
        info!(set = %record, "Set deleted");
        Ok(())
    }

    /// Named sets the transport reports for this table. Sets generated for
    /// rules are left out.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub fn get_sets(&self) -> Result<Vec<SetRecord>> {
        let listed = self
            .shared
            .transport
            .list_sets(&self.table)
            .map_err(|e| Error::transport("list", self.table.to_string(), e))?;
        Ok(listed.into_iter().filter(|s| !s.attrs.anonymous).collect())
    }

    /// Elements of a set as the transport reports them.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown set, or the transport's error.
    pub fn get_set_elements(&self, name: &str) -> Result<Vec<SetElement>> {
        let record = self.lookup(name)?;
        self.shared
            .transport
            .list_set_elements(&record)
            .map_err(|e| Error::transport("list", record.to_string(), e))
    }

    /// Adds elements to a set.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown set, or the transport's error.
    pub fn add_set_elements(&self, name: &str, elements: &[SetElement]) -> Result<()> {
        let record = self.lookup(name)?;
        self.shared
            .transport
            .add_set_elements(&record, elements)
            .map_err(|e| Error::transport("update", record.to_string(), e))?;
        self.shared.flush(&record)?;
        debug!(set = %record, count = elements.len(), "Set elements added");
        Ok(())
    }

    /// Removes elements from a set.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown set, or the transport's error.
    pub fn delete_set_elements(&self, name: &str, elements: &[SetElement]) -> Result<()> {
        let record = self.lookup(name)?;
        self.shared
            .transport
            .del_set_elements(&record, elements)
            .map_err(|e| Error::transport("update", record.to_string(), e))?;
        self.shared.flush(&record)?;
        debug!(set = %record, count = elements.len(), "Set elements deleted");
        Ok(())
    }

    /// Handle for referencing the set from a rule.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown set.
    pub fn handle(&self, name: &str) -> Result<SetHandle> {
        self.lookup(name).map(|record| record.handle())
    }

    pub fn get(&self, name: &str) -> Option<SetRecord> {
        self.sets.read().get(name).cloned()
    }

    /// Returns `true` if the table holds the set. Never calls the transport.
    pub fn exist_set(&self, name: &str) -> bool {
        self.sets.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.sets.read().keys().cloned().collect()
    }

    /// Records a set read back from the transport unless the name is taken.
    pub(super) fn adopt(&self, record: SetRecord) -> bool {
        let mut sets = self.sets.write();
        if sets.contains_key(record.name()) {
            return false;
        }
        sets.insert(record.name().to_string(), record);
        true
    }
}
