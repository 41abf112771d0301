//! Durable progress ledger for the annotation campaign.
//!
//! One row per `(source_id, row_index)` identity. Rows are only ever
//! upserted, never deleted; a composite unique index on the identity pair is
//! created at startup alongside the table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "progress")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// Path of the source CSV file this row came from.
    pub source_id: String,
    /// Zero-based row index within the source file.
    pub row_index: i64,
    /// "completed" or "failed".
    pub status: String,
    /// Present iff status is "completed"; always one of the closed label set.
    pub religion: Option<String>,
    pub attempt_count: i32,
    /// Present iff status is "failed".
    pub error_msg: Option<String>,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
