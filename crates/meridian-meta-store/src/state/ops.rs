//! Metadata operations
//!
//! Every journal entry carries one [`Operation`], identified on the wire by
//! its [`OpCode`] and encoded with bincode. Codes are grouped by entity:
//!
//! ```text
//!   0..99    internal (noop, leader epoch marker)
//! 100..199   databases
//! 200..299   tables
//! 300..399   partitions
//! 400..499   transactions
//! 500..599   resources
//! ```
//!
//! Codes are part of the journal format and must never be reused.

use crate::journal::record::MAX_BODY_SIZE;
use meridian_common::{ConsistencyKind, Error, Result, SequenceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wire identifier of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum OpCode {
    Noop = 0,
    LeaderEpoch = 1,
    CreateDatabase = 100,
    DropDatabase = 101,
    CreateTable = 200,
    DropTable = 201,
    RenameTable = 202,
    AddPartition = 300,
    DropPartition = 301,
    BeginTransaction = 400,
    CommitTransaction = 401,
    AbortTransaction = 402,
    PutResource = 500,
    DropResource = 501,
}

impl OpCode {
    /// Every known code, in wire order
    pub const ALL: [Self; 14] = [
        Self::Noop,
        Self::LeaderEpoch,
        Self::CreateDatabase,
        Self::DropDatabase,
        Self::CreateTable,
        Self::DropTable,
        Self::RenameTable,
        Self::AddPartition,
        Self::DropPartition,
        Self::BeginTransaction,
        Self::CommitTransaction,
        Self::AbortTransaction,
        Self::PutResource,
        Self::DropResource,
    ];

    /// Raw wire value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Look up a wire value
    #[must_use]
    pub fn from_u32(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_u32() == code)
    }

    /// Stable lowercase name, used in logs and metrics labels
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::LeaderEpoch => "leader_epoch",
            Self::CreateDatabase => "create_database",
            Self::DropDatabase => "drop_database",
            Self::CreateTable => "create_table",
            Self::DropTable => "drop_table",
            Self::RenameTable => "rename_table",
            Self::AddPartition => "add_partition",
            Self::DropPartition => "drop_partition",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
            Self::AbortTransaction => "abort_transaction",
            Self::PutResource => "put_resource",
            Self::DropResource => "drop_resource",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u32())
    }
}

/// Properties attached to databases, tables and resources
pub type Properties = BTreeMap<String, String>;

/// Marks the start of a leader's term in the journal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderEpochOp {
    pub epoch: u64,
    pub node_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDatabaseOp {
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropDatabaseOp {
    pub db_id: u64,
}

/// Create a table. The owning database does not have to be registered;
/// tables of an unregistered database simply have no cascade parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTableOp {
    pub db_id: u64,
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTableOp {
    pub table_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameTableOp {
    pub table_id: u64,
    pub new_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPartitionOp {
    pub table_id: u64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropPartitionOp {
    pub partition_id: u64,
}

/// Begin a load transaction. Labels are unique per database among
/// transactions that have not been aborted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginTransactionOp {
    pub db_id: u64,
    pub label: String,
    pub table_ids: Vec<u64>,
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitTransactionOp {
    pub txn_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTransactionOp {
    pub txn_id: u64,
    #[serde(default)]
    pub reason: String,
}

/// Create or replace a named resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResourceOp {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropResourceOp {
    pub name: String,
}

/// A metadata mutation
///
/// The JSON form used by the node API is internally tagged:
/// `{"op": "create_table", "db_id": 1, "name": "t1"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Noop,
    LeaderEpoch(LeaderEpochOp),
    CreateDatabase(CreateDatabaseOp),
    DropDatabase(DropDatabaseOp),
    CreateTable(CreateTableOp),
    DropTable(DropTableOp),
    RenameTable(RenameTableOp),
    AddPartition(AddPartitionOp),
    DropPartition(DropPartitionOp),
    BeginTransaction(BeginTransactionOp),
    CommitTransaction(CommitTransactionOp),
    AbortTransaction(AbortTransactionOp),
    PutResource(PutResourceOp),
    DropResource(DropResourceOp),
}

impl Operation {
    pub fn create_database(name: impl Into<String>) -> Self {
        Self::CreateDatabase(CreateDatabaseOp {
            name: name.into(),
            properties: Properties::new(),
        })
    }

    #[must_use]
    pub const fn drop_database(db_id: u64) -> Self {
        Self::DropDatabase(DropDatabaseOp { db_id })
    }

    pub fn create_table(db_id: u64, name: impl Into<String>) -> Self {
        Self::CreateTable(CreateTableOp {
            db_id,
            name: name.into(),
            properties: Properties::new(),
        })
    }

    #[must_use]
    pub const fn drop_table(table_id: u64) -> Self {
        Self::DropTable(DropTableOp { table_id })
    }

    pub fn rename_table(table_id: u64, new_name: impl Into<String>) -> Self {
        Self::RenameTable(RenameTableOp {
            table_id,
            new_name: new_name.into(),
        })
    }

    pub fn add_partition(table_id: u64, name: impl Into<String>) -> Self {
        Self::AddPartition(AddPartitionOp {
            table_id,
            name: name.into(),
        })
    }

    #[must_use]
    pub const fn drop_partition(partition_id: u64) -> Self {
        Self::DropPartition(DropPartitionOp { partition_id })
    }

    pub fn begin_transaction(db_id: u64, label: impl Into<String>, table_ids: Vec<u64>) -> Self {
        Self::BeginTransaction(BeginTransactionOp {
            db_id,
            label: label.into(),
            table_ids,
            timeout_ms: 0,
        })
    }

    #[must_use]
    pub const fn commit_transaction(txn_id: u64) -> Self {
        Self::CommitTransaction(CommitTransactionOp { txn_id })
    }

    pub fn abort_transaction(txn_id: u64, reason: impl Into<String>) -> Self {
        Self::AbortTransaction(AbortTransactionOp {
            txn_id,
            reason: reason.into(),
        })
    }

    pub fn put_resource(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::PutResource(PutResourceOp {
            name: name.into(),
            kind: kind.into(),
            properties: Properties::new(),
        })
    }

    pub fn drop_resource(name: impl Into<String>) -> Self {
        Self::DropResource(DropResourceOp { name: name.into() })
    }

    /// Wire code of this operation
    #[must_use]
    pub const fn op_code(&self) -> OpCode {
        match self {
            Self::Noop => OpCode::Noop,
            Self::LeaderEpoch(_) => OpCode::LeaderEpoch,
            Self::CreateDatabase(_) => OpCode::CreateDatabase,
            Self::DropDatabase(_) => OpCode::DropDatabase,
            Self::CreateTable(_) => OpCode::CreateTable,
            Self::DropTable(_) => OpCode::DropTable,
            Self::RenameTable(_) => OpCode::RenameTable,
            Self::AddPartition(_) => OpCode::AddPartition,
            Self::DropPartition(_) => OpCode::DropPartition,
            Self::BeginTransaction(_) => OpCode::BeginTransaction,
            Self::CommitTransaction(_) => OpCode::CommitTransaction,
            Self::AbortTransaction(_) => OpCode::AbortTransaction,
            Self::PutResource(_) => OpCode::PutResource,
            Self::DropResource(_) => OpCode::DropResource,
        }
    }

    /// Operations only the node itself may sequence
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Noop | Self::LeaderEpoch(_))
    }

    /// Encode the operation body (without the code). Bodies too large for
    /// a journal record are refused.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Self::Noop => Vec::new(),
            Self::LeaderEpoch(op) => bincode::serialize(op)?,
            Self::CreateDatabase(op) => bincode::serialize(op)?,
            Self::DropDatabase(op) => bincode::serialize(op)?,
            Self::CreateTable(op) => bincode::serialize(op)?,
            Self::DropTable(op) => bincode::serialize(op)?,
            Self::RenameTable(op) => bincode::serialize(op)?,
            Self::AddPartition(op) => bincode::serialize(op)?,
            Self::DropPartition(op) => bincode::serialize(op)?,
            Self::BeginTransaction(op) => bincode::serialize(op)?,
            Self::CommitTransaction(op) => bincode::serialize(op)?,
            Self::AbortTransaction(op) => bincode::serialize(op)?,
            Self::PutResource(op) => bincode::serialize(op)?,
            Self::DropResource(op) => bincode::serialize(op)?,
        };
        if body.len() > MAX_BODY_SIZE {
            return Err(Error::invalid_operation(format!(
                "{} body of {} bytes exceeds the {} byte limit",
                self.op_code(),
                body.len(),
                MAX_BODY_SIZE
            )));
        }
        Ok(body)
    }

    /// Decode an operation body for a known code
    pub fn decode(code: OpCode, body: &[u8]) -> bincode::Result<Self> {
        Ok(match code {
            OpCode::Noop => Self::Noop,
            OpCode::LeaderEpoch => Self::LeaderEpoch(bincode::deserialize(body)?),
            OpCode::CreateDatabase => Self::CreateDatabase(bincode::deserialize(body)?),
            OpCode::DropDatabase => Self::DropDatabase(bincode::deserialize(body)?),
            OpCode::CreateTable => Self::CreateTable(bincode::deserialize(body)?),
            OpCode::DropTable => Self::DropTable(bincode::deserialize(body)?),
            OpCode::RenameTable => Self::RenameTable(bincode::deserialize(body)?),
            OpCode::AddPartition => Self::AddPartition(bincode::deserialize(body)?),
            OpCode::DropPartition => Self::DropPartition(bincode::deserialize(body)?),
            OpCode::BeginTransaction => Self::BeginTransaction(bincode::deserialize(body)?),
            OpCode::CommitTransaction => Self::CommitTransaction(bincode::deserialize(body)?),
            OpCode::AbortTransaction => Self::AbortTransaction(bincode::deserialize(body)?),
            OpCode::PutResource => Self::PutResource(bincode::deserialize(body)?),
            OpCode::DropResource => Self::DropResource(bincode::deserialize(body)?),
        })
    }

    /// Decode a journal entry's operation, reporting failures as consistency
    /// violations at `sequence`
    pub fn decode_entry(sequence: SequenceId, code: u32, body: &[u8]) -> Result<Self> {
        let op_code = OpCode::from_u32(code)
            .ok_or(Error::consistency(sequence, ConsistencyKind::UnknownOpCode(code)))?;
        Self::decode(op_code, body).map_err(|e| {
            Error::consistency(
                sequence,
                ConsistencyKind::Malformed(format!("{op_code} payload: {e}")),
            )
        })
    }

    /// Decode a client-supplied operation, reporting failures as invalid input
    pub fn decode_request(code: u32, body: &[u8]) -> Result<Self> {
        let op_code = OpCode::from_u32(code)
            .ok_or_else(|| Error::invalid_operation(format!("unknown operation code {code}")))?;
        Self::decode(op_code, body)
            .map_err(|e| Error::invalid_operation(format!("undecodable {op_code} payload: {e}")))
    }
}
