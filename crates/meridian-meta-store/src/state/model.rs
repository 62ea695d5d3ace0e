//! In-memory metadata state
//!
//! `MetadataState` is a pure value: applying the same operations with the
//! same sequence ids and timestamps always yields an equal state. Apply is
//! split into [`MetadataState::check`], which decides whether an operation
//! is valid against the current state, and a mutation step that assumes it
//! is. The leader runs `check` before sequencing; replicas run both.

use super::entities::{
    Database, EntityKind, EntitySnapshot, Partition, Resource, Table, Transaction,
    TransactionStatus,
};
use super::ops::Operation;
use meridian_common::{Epoch, SequenceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The replicated metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataState {
    last_applied: SequenceId,
    leader_epoch: Epoch,

    databases: BTreeMap<u64, Database>,
    tables: BTreeMap<u64, Table>,
    partitions: BTreeMap<u64, Partition>,
    transactions: BTreeMap<u64, Transaction>,
    resources: BTreeMap<u64, Resource>,

    // Secondary indexes
    database_names: BTreeMap<String, u64>,
    table_names: BTreeMap<(u64, String), u64>,
    database_tables: BTreeMap<u64, BTreeSet<u64>>,
    partition_names: BTreeMap<(u64, String), u64>,
    table_partitions: BTreeMap<u64, BTreeSet<u64>>,
    transaction_labels: BTreeMap<(u64, String), u64>,
    resource_names: BTreeMap<String, u64>,
}

/// Entity counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStats {
    pub databases: usize,
    pub tables: usize,
    pub partitions: usize,
    pub transactions: usize,
    pub running_transactions: usize,
    pub resources: usize,
}

impl StateStats {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.databases + self.tables + self.partitions + self.transactions + self.resources
    }
}

impl MetadataState {
    /// Sequence id of the last entry reflected in this state
    #[must_use]
    pub const fn last_applied(&self) -> SequenceId {
        self.last_applied
    }

    /// Epoch of the most recent leader marker applied
    #[must_use]
    pub const fn leader_epoch(&self) -> Epoch {
        self.leader_epoch
    }

    pub(crate) const fn set_last_applied(&mut self, sequence: SequenceId) {
        self.last_applied = sequence;
    }

    pub fn database(&self, id: u64) -> Option<&Database> {
        self.databases.get(&id)
    }

    pub fn table(&self, id: u64) -> Option<&Table> {
        self.tables.get(&id)
    }

    pub fn partition(&self, id: u64) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn transaction(&self, id: u64) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    pub fn resource(&self, id: u64) -> Option<&Resource> {
        self.resources.get(&id)
    }

    pub fn database_by_name(&self, name: &str) -> Option<&Database> {
        self.database_names
            .get(name)
            .and_then(|id| self.databases.get(id))
    }

    pub fn table_by_name(&self, db_id: u64, name: &str) -> Option<&Table> {
        self.table_names
            .get(&(db_id, name.to_string()))
            .and_then(|id| self.tables.get(id))
    }

    pub fn resource_by_name(&self, name: &str) -> Option<&Resource> {
        self.resource_names
            .get(name)
            .and_then(|id| self.resources.get(id))
    }

    /// Tables of a database, in id order
    pub fn tables_of(&self, db_id: u64) -> impl Iterator<Item = &Table> {
        self.database_tables
            .get(&db_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tables.get(id))
    }

    /// Partitions of a table, in id order
    pub fn partitions_of(&self, table_id: u64) -> impl Iterator<Item = &Partition> {
        self.table_partitions
            .get(&table_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.partitions.get(id))
    }

    /// Owned copy of one entity
    #[must_use]
    pub fn snapshot(&self, kind: EntityKind, id: u64) -> Option<EntitySnapshot> {
        match kind {
            EntityKind::Database => self.database(id).cloned().map(EntitySnapshot::Database),
            EntityKind::Table => self.table(id).cloned().map(EntitySnapshot::Table),
            EntityKind::Partition => self.partition(id).cloned().map(EntitySnapshot::Partition),
            EntityKind::Transaction => self
                .transaction(id)
                .cloned()
                .map(EntitySnapshot::Transaction),
            EntityKind::Resource => self.resource(id).cloned().map(EntitySnapshot::Resource),
        }
    }

    #[must_use]
    pub fn stats(&self) -> StateStats {
        StateStats {
            databases: self.databases.len(),
            tables: self.tables.len(),
            partitions: self.partitions.len(),
            transactions: self.transactions.len(),
            running_transactions: self
                .transactions
                .values()
                .filter(|t| t.is_running())
                .count(),
            resources: self.resources.len(),
        }
    }

    fn has_running_transactions(&self, db_id: u64) -> bool {
        self.transactions
            .values()
            .any(|t| t.db_id == db_id && t.is_running())
    }

    /// Decide whether `op` is valid against the current state.
    ///
    /// Returns the rejection reason on failure.
    pub fn check(&self, op: &Operation) -> Result<(), String> {
        match op {
            Operation::Noop => Ok(()),
            Operation::LeaderEpoch(op) => {
                if op.epoch < self.leader_epoch {
                    return Err(format!(
                        "epoch {} is older than current epoch {}",
                        op.epoch, self.leader_epoch
                    ));
                }
                Ok(())
            }
            Operation::CreateDatabase(op) => {
                require_name(&op.name)?;
                if self.database_names.contains_key(&op.name) {
                    return Err(format!("database '{}' already exists", op.name));
                }
                Ok(())
            }
            Operation::DropDatabase(op) => {
                if !self.databases.contains_key(&op.db_id) {
                    return Err(format!("database {} not found", op.db_id));
                }
                if self.has_running_transactions(op.db_id) {
                    return Err(format!("database {} has running transactions", op.db_id));
                }
                Ok(())
            }
            Operation::CreateTable(op) => {
                require_name(&op.name)?;
                if self.table_by_name(op.db_id, &op.name).is_some() {
                    return Err(format!(
                        "table '{}' already exists in database {}",
                        op.name, op.db_id
                    ));
                }
                Ok(())
            }
            Operation::DropTable(op) => {
                if !self.tables.contains_key(&op.table_id) {
                    return Err(format!("table {} not found", op.table_id));
                }
                Ok(())
            }
            Operation::RenameTable(op) => {
                require_name(&op.new_name)?;
                let table = self
                    .table(op.table_id)
                    .ok_or_else(|| format!("table {} not found", op.table_id))?;
                if self.table_by_name(table.db_id, &op.new_name).is_some() {
                    return Err(format!(
                        "table '{}' already exists in database {}",
                        op.new_name, table.db_id
                    ));
                }
                Ok(())
            }
            Operation::AddPartition(op) => {
                require_name(&op.name)?;
                if !self.tables.contains_key(&op.table_id) {
                    return Err(format!("table {} not found", op.table_id));
                }
                if self
                    .partition_names
                    .contains_key(&(op.table_id, op.name.clone()))
                {
                    return Err(format!(
                        "partition '{}' already exists in table {}",
                        op.name, op.table_id
                    ));
                }
                Ok(())
            }
            Operation::DropPartition(op) => {
                if !self.partitions.contains_key(&op.partition_id) {
                    return Err(format!("partition {} not found", op.partition_id));
                }
                Ok(())
            }
            Operation::BeginTransaction(op) => {
                require_name(&op.label)?;
                if self
                    .transaction_labels
                    .contains_key(&(op.db_id, op.label.clone()))
                {
                    return Err(format!(
                        "label '{}' already used in database {}",
                        op.label, op.db_id
                    ));
                }
                for table_id in &op.table_ids {
                    match self.table(*table_id) {
                        Some(table) if table.db_id == op.db_id => {}
                        Some(_) => {
                            return Err(format!(
                                "table {table_id} does not belong to database {}",
                                op.db_id
                            ));
                        }
                        None => return Err(format!("table {table_id} not found")),
                    }
                }
                Ok(())
            }
            Operation::CommitTransaction(op) => self.check_running(op.txn_id),
            Operation::AbortTransaction(op) => self.check_running(op.txn_id),
            Operation::PutResource(op) => {
                require_name(&op.name)?;
                if op.kind.is_empty() {
                    return Err("resource kind must not be empty".to_string());
                }
                Ok(())
            }
            Operation::DropResource(op) => {
                if !self.resource_names.contains_key(&op.name) {
                    return Err(format!("resource '{}' not found", op.name));
                }
                Ok(())
            }
        }
    }

    fn check_running(&self, txn_id: u64) -> Result<(), String> {
        let txn = self
            .transaction(txn_id)
            .ok_or_else(|| format!("transaction {txn_id} not found"))?;
        if !txn.is_running() {
            return Err(format!(
                "transaction {txn_id} is already {:?}",
                txn.status
            ));
        }
        Ok(())
    }

    /// Validate and apply `op` as the entry at `sequence`.
    ///
    /// On error the state is unchanged. The caller owns the ordering check
    /// and the `last_applied` bookkeeping.
    pub(crate) fn apply_operation(
        &mut self,
        sequence: SequenceId,
        created_at: u64,
        op: &Operation,
    ) -> Result<(), String> {
        self.check(op)?;
        self.mutate(sequence, created_at, op);
        Ok(())
    }

    fn mutate(&mut self, sequence: SequenceId, at: u64, op: &Operation) {
        match op {
            Operation::Noop => {}
            Operation::LeaderEpoch(op) => {
                self.leader_epoch = op.epoch;
            }
            Operation::CreateDatabase(op) => {
                self.database_names.insert(op.name.clone(), sequence);
                self.databases.insert(
                    sequence,
                    Database {
                        id: sequence,
                        name: op.name.clone(),
                        properties: op.properties.clone(),
                        created_at: at,
                    },
                );
            }
            Operation::DropDatabase(op) => {
                if let Some(db) = self.databases.remove(&op.db_id) {
                    self.database_names.remove(&db.name);
                }
                for table_id in self.database_tables.remove(&op.db_id).unwrap_or_default() {
                    self.remove_table(table_id);
                }
                let labels: Vec<_> = self
                    .transaction_labels
                    .range((op.db_id, String::new())..)
                    .take_while(|((db, _), _)| *db == op.db_id)
                    .map(|(k, _)| k.clone())
                    .collect();
                for label in labels {
                    self.transaction_labels.remove(&label);
                }
            }
            Operation::CreateTable(op) => {
                self.table_names
                    .insert((op.db_id, op.name.clone()), sequence);
                self.database_tables
                    .entry(op.db_id)
                    .or_default()
                    .insert(sequence);
                self.tables.insert(
                    sequence,
                    Table {
                        id: sequence,
                        db_id: op.db_id,
                        name: op.name.clone(),
                        properties: op.properties.clone(),
                        created_at: at,
                        updated_at: at,
                    },
                );
            }
            Operation::DropTable(op) => {
                if let Some(table) = self.tables.get(&op.table_id)
                    && let Some(ids) = self.database_tables.get_mut(&table.db_id)
                {
                    ids.remove(&op.table_id);
                    if ids.is_empty() {
                        self.database_tables.remove(&table.db_id);
                    }
                }
                self.remove_table(op.table_id);
            }
            Operation::RenameTable(op) => {
                if let Some(table) = self.tables.get_mut(&op.table_id) {
                    self.table_names.remove(&(table.db_id, table.name.clone()));
                    self.table_names
                        .insert((table.db_id, op.new_name.clone()), table.id);
                    table.name.clone_from(&op.new_name);
                    table.updated_at = at;
                }
            }
            Operation::AddPartition(op) => {
                self.partition_names
                    .insert((op.table_id, op.name.clone()), sequence);
                self.table_partitions
                    .entry(op.table_id)
                    .or_default()
                    .insert(sequence);
                self.partitions.insert(
                    sequence,
                    Partition {
                        id: sequence,
                        table_id: op.table_id,
                        name: op.name.clone(),
                        visible_version: 1,
                        created_at: at,
                    },
                );
            }
            Operation::DropPartition(op) => {
                if let Some(partition) = self.partitions.remove(&op.partition_id) {
                    self.partition_names
                        .remove(&(partition.table_id, partition.name));
                    if let Some(ids) = self.table_partitions.get_mut(&partition.table_id) {
                        ids.remove(&op.partition_id);
                        if ids.is_empty() {
                            self.table_partitions.remove(&partition.table_id);
                        }
                    }
                }
            }
            Operation::BeginTransaction(op) => {
                self.transaction_labels
                    .insert((op.db_id, op.label.clone()), sequence);
                self.transactions.insert(
                    sequence,
                    Transaction {
                        id: sequence,
                        db_id: op.db_id,
                        label: op.label.clone(),
                        table_ids: op.table_ids.clone(),
                        status: TransactionStatus::Running,
                        timeout_ms: op.timeout_ms,
                        started_at: at,
                        finished_at: None,
                        reason: None,
                    },
                );
            }
            Operation::CommitTransaction(op) => {
                let Some(txn) = self.transactions.get_mut(&op.txn_id) else {
                    return;
                };
                txn.status = TransactionStatus::Committed;
                txn.finished_at = Some(at);
                for table_id in &txn.table_ids {
                    for partition_id in self.table_partitions.get(table_id).into_iter().flatten()
                    {
                        if let Some(partition) = self.partitions.get_mut(partition_id) {
                            partition.visible_version += 1;
                        }
                    }
                }
            }
            Operation::AbortTransaction(op) => {
                if let Some(txn) = self.transactions.get_mut(&op.txn_id) {
                    txn.status = TransactionStatus::Aborted;
                    txn.finished_at = Some(at);
                    txn.reason = Some(op.reason.clone());
                    self.transaction_labels
                        .remove(&(txn.db_id, txn.label.clone()));
                }
            }
            Operation::PutResource(op) => {
                if let Some(id) = self.resource_names.get(&op.name)
                    && let Some(resource) = self.resources.get_mut(id)
                {
                    resource.kind.clone_from(&op.kind);
                    resource.properties.clone_from(&op.properties);
                    resource.updated_at = at;
                } else {
                    self.resource_names.insert(op.name.clone(), sequence);
                    self.resources.insert(
                        sequence,
                        Resource {
                            id: sequence,
                            name: op.name.clone(),
                            kind: op.kind.clone(),
                            properties: op.properties.clone(),
                            created_at: at,
                            updated_at: at,
                        },
                    );
                }
            }
            Operation::DropResource(op) => {
                if let Some(id) = self.resource_names.remove(&op.name) {
                    self.resources.remove(&id);
                }
            }
        }
    }

    /// Remove a table, its name and its partitions. The database's table
    /// index is left to the caller.
    fn remove_table(&mut self, table_id: u64) {
        let Some(table) = self.tables.remove(&table_id) else {
            return;
        };
        self.table_names.remove(&(table.db_id, table.name));
        for partition_id in self.table_partitions.remove(&table_id).unwrap_or_default() {
            if let Some(partition) = self.partitions.remove(&partition_id) {
                self.partition_names
                    .remove(&(partition.table_id, partition.name));
            }
        }
    }
}

fn require_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name must not be empty".to_string());
    }
    Ok(())
}
