//! Metadata entities
//!
//! Every entity's id is the sequence id of the journal entry that created
//! it, so ids are identical on every replica without coordination.

use super::ops::Properties;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entity type, as addressed by reads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Database,
    Table,
    Partition,
    Transaction,
    Resource,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Database => "database",
            Self::Table => "table",
            Self::Partition => "partition",
            Self::Transaction => "transaction",
            Self::Resource => "resource",
        };
        f.write_str(name)
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" | "databases" | "db" => Ok(Self::Database),
            "table" | "tables" => Ok(Self::Table),
            "partition" | "partitions" => Ok(Self::Partition),
            "transaction" | "transactions" | "txn" => Ok(Self::Transaction),
            "resource" | "resources" => Ok(Self::Resource),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub id: u64,
    pub name: String,
    pub properties: Properties,
    pub created_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: u64,
    pub db_id: u64,
    pub name: String,
    pub properties: Properties,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: u64,
    pub table_id: u64,
    pub name: String,
    /// Bumped by every committed transaction touching the table
    pub visible_version: u64,
    pub created_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Running,
    Committed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub db_id: u64,
    pub label: String,
    pub table_ids: Vec<u64>,
    pub status: TransactionStatus,
    pub timeout_ms: u64,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub reason: Option<String>,
}

impl Transaction {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == TransactionStatus::Running
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: u64,
    pub name: String,
    pub kind: String,
    pub properties: Properties,
    pub created_at: u64,
    pub updated_at: u64,
}

/// An owned copy of one entity, handed out by reads
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Database(Database),
    Table(Table),
    Partition(Partition),
    Transaction(Transaction),
    Resource(Resource),
}

impl EntitySnapshot {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Database(_) => EntityKind::Database,
            Self::Table(_) => EntityKind::Table,
            Self::Partition(_) => EntityKind::Partition,
            Self::Transaction(_) => EntityKind::Transaction,
            Self::Resource(_) => EntityKind::Resource,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Database(e) => e.id,
            Self::Table(e) => e.id,
            Self::Partition(e) => e.id,
            Self::Transaction(e) => e.id,
            Self::Resource(e) => e.id,
        }
    }
}
