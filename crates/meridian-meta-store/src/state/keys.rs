//! Entity keys and operation footprints
//!
//! A footprint lists the keys whose state an operation's validation reads
//! and the keys whose validation-relevant state it changes. Two operations
//! conflict when the later one reads a key the earlier one writes; the
//! journal writer cuts a batch at such a conflict, and region locks are
//! taken over footprint keys.
//!
//! Child entities read their ancestors' keys, so dropping a database
//! (which writes only its own key) conflicts with anything underneath it.

use super::model::MetadataState;
use super::ops::Operation;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    Epoch,
    Database(u64),
    DatabaseName(String),
    /// The set of running transactions of a database
    RunningTransactions(u64),
    Table(u64),
    TableName(u64, String),
    Partition(u64),
    PartitionName(u64, String),
    Transaction(u64),
    TransactionLabel(u64, String),
    ResourceName(String),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epoch => f.write_str("epoch"),
            Self::Database(id) => write!(f, "database/{id}"),
            Self::DatabaseName(name) => write!(f, "database-name/{name}"),
            Self::RunningTransactions(db) => write!(f, "database/{db}/running"),
            Self::Table(id) => write!(f, "table/{id}"),
            Self::TableName(db, name) => write!(f, "database/{db}/table-name/{name}"),
            Self::Partition(id) => write!(f, "partition/{id}"),
            Self::PartitionName(table, name) => write!(f, "table/{table}/partition-name/{name}"),
            Self::Transaction(id) => write!(f, "transaction/{id}"),
            Self::TransactionLabel(db, label) => write!(f, "database/{db}/label/{label}"),
            Self::ResourceName(name) => write!(f, "resource/{name}"),
        }
    }
}

/// Keys an operation reads and writes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Footprint {
    pub reads: BTreeSet<EntityKey>,
    pub writes: BTreeSet<EntityKey>,
}

impl Footprint {
    fn read(&mut self, key: EntityKey) -> &mut Self {
        self.reads.insert(key);
        self
    }

    fn write(&mut self, key: EntityKey) -> &mut Self {
        self.writes.insert(key);
        self
    }

    fn read_write(&mut self, key: EntityKey) -> &mut Self {
        self.reads.insert(key.clone());
        self.writes.insert(key);
        self
    }

    /// Whether this operation reads anything in `written`
    #[must_use]
    pub fn conflicts_with(&self, written: &BTreeSet<EntityKey>) -> bool {
        self.reads.iter().any(|k| written.contains(k))
    }

    /// Every key touched, sorted (the lock acquisition order)
    #[must_use]
    pub fn keys(&self) -> BTreeSet<EntityKey> {
        self.reads.union(&self.writes).cloned().collect()
    }

    /// Compute the footprint of `op` against the current state
    #[must_use]
    pub fn of(op: &Operation, state: &MetadataState) -> Self {
        let mut fp = Self::default();
        match op {
            Operation::Noop => {}
            Operation::LeaderEpoch(_) => {
                fp.read_write(EntityKey::Epoch);
            }
            Operation::CreateDatabase(op) => {
                fp.read_write(EntityKey::DatabaseName(op.name.clone()));
            }
            Operation::DropDatabase(op) => {
                fp.read_write(EntityKey::Database(op.db_id))
                    .read(EntityKey::RunningTransactions(op.db_id));
                if let Some(db) = state.database(op.db_id) {
                    fp.write(EntityKey::DatabaseName(db.name.clone()));
                }
            }
            Operation::CreateTable(op) => {
                fp.read(EntityKey::Database(op.db_id))
                    .read_write(EntityKey::TableName(op.db_id, op.name.clone()));
            }
            Operation::DropTable(op) => {
                fp.read_write(EntityKey::Table(op.table_id));
                if let Some(table) = state.table(op.table_id) {
                    fp.read(EntityKey::Database(table.db_id))
                        .write(EntityKey::TableName(table.db_id, table.name.clone()));
                }
            }
            Operation::RenameTable(op) => {
                fp.read(EntityKey::Table(op.table_id));
                if let Some(table) = state.table(op.table_id) {
                    fp.read(EntityKey::Database(table.db_id))
                        .read_write(EntityKey::TableName(table.db_id, op.new_name.clone()))
                        .write(EntityKey::TableName(table.db_id, table.name.clone()));
                }
            }
            Operation::AddPartition(op) => {
                fp.read(EntityKey::Table(op.table_id))
                    .read_write(EntityKey::PartitionName(op.table_id, op.name.clone()));
                if let Some(table) = state.table(op.table_id) {
                    fp.read(EntityKey::Database(table.db_id));
                }
            }
            Operation::DropPartition(op) => {
                fp.read_write(EntityKey::Partition(op.partition_id));
                if let Some(partition) = state.partition(op.partition_id) {
                    fp.read(EntityKey::Table(partition.table_id)).write(
                        EntityKey::PartitionName(partition.table_id, partition.name.clone()),
                    );
                    if let Some(table) = state.table(partition.table_id) {
                        fp.read(EntityKey::Database(table.db_id));
                    }
                }
            }
            Operation::BeginTransaction(op) => {
                fp.read(EntityKey::Database(op.db_id))
                    .read_write(EntityKey::TransactionLabel(op.db_id, op.label.clone()))
                    .write(EntityKey::RunningTransactions(op.db_id));
                for table_id in &op.table_ids {
                    fp.read(EntityKey::Table(*table_id));
                }
            }
            Operation::CommitTransaction(op) => {
                fp.read_write(EntityKey::Transaction(op.txn_id));
                if let Some(txn) = state.transaction(op.txn_id) {
                    fp.write(EntityKey::RunningTransactions(txn.db_id));
                }
            }
            Operation::AbortTransaction(op) => {
                fp.read_write(EntityKey::Transaction(op.txn_id));
                if let Some(txn) = state.transaction(op.txn_id) {
                    fp.write(EntityKey::RunningTransactions(txn.db_id))
                        .write(EntityKey::TransactionLabel(txn.db_id, txn.label.clone()));
                }
            }
            Operation::PutResource(op) => {
                fp.read_write(EntityKey::ResourceName(op.name.clone()));
            }
            Operation::DropResource(op) => {
                fp.read_write(EntityKey::ResourceName(op.name.clone()));
            }
        }
        fp
    }
}
