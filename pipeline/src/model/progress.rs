use std::collections::HashMap;
use std::str::FromStr;

use chrono::Utc;

use crate::{db_core::prelude::*, error::AppResult, model::labels::Religion};

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

pub struct ProgressCtrl;

/// Aggregate progress counts across all identities, the operator-facing
/// surface for progress reporting and ETA estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl ProgressCtrl {
    /// Create the progress table and its identity index if they do not exist.
    pub async fn init_schema(conn: &DatabaseConnection) -> AppResult<()> {
        let backend = conn.get_database_backend();
        let schema = Schema::new(backend);

        let mut table = schema.create_table_from_entity(ProgressEntry);
        table.if_not_exists();
        conn.execute(backend.build(&table)).await?;

        let index = Index::create()
            .name("idx_progress_identity")
            .table(progress_entry::Entity)
            .col(progress_entry::Column::SourceId)
            .col(progress_entry::Column::RowIndex)
            .unique()
            .if_not_exists()
            .to_owned();
        conn.execute(backend.build(&index)).await?;

        Ok(())
    }

    pub async fn is_completed(
        conn: &DatabaseConnection,
        source_id: &str,
        row_index: i64,
    ) -> AppResult<bool> {
        let entry = ProgressEntry::find()
            .filter(progress_entry::Column::SourceId.eq(source_id))
            .filter(progress_entry::Column::RowIndex.eq(row_index))
            .filter(progress_entry::Column::Status.eq(STATUS_COMPLETED))
            .one(conn)
            .await?;

        Ok(entry.is_some())
    }

    /// Idempotent upsert marking an identity permanently completed.
    pub async fn mark_completed(
        conn: &DatabaseConnection,
        source_id: &str,
        row_index: i64,
        religion: Religion,
    ) -> AppResult<()> {
        Self::upsert(
            conn,
            progress_entry::ActiveModel {
                id: ActiveValue::NotSet,
                source_id: ActiveValue::Set(source_id.to_string()),
                row_index: ActiveValue::Set(row_index),
                status: ActiveValue::Set(STATUS_COMPLETED.to_string()),
                religion: ActiveValue::Set(Some(religion.as_str().to_string())),
                attempt_count: ActiveValue::Set(0),
                error_msg: ActiveValue::Set(None),
                updated_at: ActiveValue::Set(Utc::now()),
            },
        )
        .await
    }

    /// Idempotent upsert recording a soft-failed identity for audit. The
    /// record still receives a fallback label in the output artifact.
    pub async fn mark_failed(
        conn: &DatabaseConnection,
        source_id: &str,
        row_index: i64,
        error_msg: &str,
        attempt_count: u32,
    ) -> AppResult<()> {
        Self::upsert(
            conn,
            progress_entry::ActiveModel {
                id: ActiveValue::NotSet,
                source_id: ActiveValue::Set(source_id.to_string()),
                row_index: ActiveValue::Set(row_index),
                status: ActiveValue::Set(STATUS_FAILED.to_string()),
                religion: ActiveValue::Set(None),
                attempt_count: ActiveValue::Set(attempt_count as i32),
                error_msg: ActiveValue::Set(Some(error_msg.to_string())),
                updated_at: ActiveValue::Set(Utc::now()),
            },
        )
        .await
    }

    /// Labels already committed for a source, keyed by row index. Used on
    /// resume to fill output cells without reclassifying.
    pub async fn completed_labels(
        conn: &DatabaseConnection,
        source_id: &str,
    ) -> AppResult<HashMap<i64, Religion>> {
        let entries = ProgressEntry::find()
            .filter(progress_entry::Column::SourceId.eq(source_id))
            .filter(progress_entry::Column::Status.eq(STATUS_COMPLETED))
            .all(conn)
            .await?;

        let labels = entries
            .into_iter()
            .filter_map(|entry| {
                let religion = Religion::from_str(entry.religion.as_deref()?).ok()?;
                Some((entry.row_index, religion))
            })
            .collect();

        Ok(labels)
    }

    pub async fn get_total_stats(conn: &DatabaseConnection) -> AppResult<StoreStats> {
        let completed = ProgressEntry::find()
            .filter(progress_entry::Column::Status.eq(STATUS_COMPLETED))
            .count(conn)
            .await?;
        let failed = ProgressEntry::find()
            .filter(progress_entry::Column::Status.eq(STATUS_FAILED))
            .count(conn)
            .await?;

        Ok(StoreStats {
            completed,
            failed,
            total: completed + failed,
        })
    }

    async fn upsert(
        conn: &DatabaseConnection,
        model: progress_entry::ActiveModel,
    ) -> AppResult<()> {
        ProgressEntry::insert(model)
            .on_conflict(
                OnConflict::columns([
                    progress_entry::Column::SourceId,
                    progress_entry::Column::RowIndex,
                ])
                .update_columns([
                    progress_entry::Column::Status,
                    progress_entry::Column::Religion,
                    progress_entry::Column::AttemptCount,
                    progress_entry::Column::ErrorMsg,
                    progress_entry::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec(conn)
            .await?;

        Ok(())
    }
}
