//! CSV source/sink layer: reads one voter table, runs it through the batch
//! processor, writes the annotated table, and validates row-count integrity.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use csv::StringRecord;

use crate::batch_processor::BatchProcessor;
use crate::db_core::prelude::DatabaseConnection;
use crate::error::{AppError, AppResult};
use crate::model::labels::Religion;
use crate::model::progress::ProgressCtrl;
use crate::model::voter::{VoterDetails, VoterRecord};
use crate::prompt::azure::CompletionApi;

const NAME_COLUMN: &str = "Name";
const GUARDIAN_COLUMN: &str = "Guardian's Name";
const HOUSE_COLUMN: &str = "House Name";
const RELIGION_COLUMN: &str = "Religion";

pub struct SourceTable {
    headers: StringRecord,
    rows: Vec<StringRecord>,
    records: Vec<VoterRecord>,
}

impl SourceTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

pub fn read_source_table(path: &Path) -> AppResult<SourceTable> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let position = |column: &str| headers.iter().position(|h| h == column);
    let name_col = position(NAME_COLUMN);
    let guardian_col = position(GUARDIAN_COLUMN);
    let house_col = position(HOUSE_COLUMN);

    let mut rows = Vec::new();
    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        let field = |col: Option<usize>| {
            col.and_then(|c| row.get(c)).unwrap_or_default().to_string()
        };

        records.push(VoterRecord {
            row_index: idx as i64,
            details: VoterDetails {
                name: field(name_col),
                guardian: field(guardian_col),
                house: field(house_col),
            },
        });
        rows.push(row);
    }

    Ok(SourceTable {
        headers,
        rows,
        records,
    })
}

/// Annotate one CSV file end to end. Previously completed rows keep their
/// stored label without a new classification call; the output file must
/// come back with exactly the input row count or the file fails hard.
pub async fn process_csv_file<A: CompletionApi>(
    conn: &DatabaseConnection,
    processor: &BatchProcessor<A>,
    input_path: &Path,
    output_path: &Path,
) -> AppResult<()> {
    tracing::info!("Processing file: {}", input_path.display());

    let table = read_source_table(input_path)?;
    let total_rows = table.row_count();
    let source_id = input_path.to_string_lossy().to_string();

    let stored = ProgressCtrl::completed_labels(conn, &source_id).await?;
    let fresh = processor.process_source(&source_id, &table.records).await?;

    write_annotated_table(&table, &fresh, &stored, output_path)?;

    let written = count_data_rows(output_path)?;
    if written != total_rows {
        tracing::error!(
            "Row count mismatch! Input: {}, Output: {}",
            total_rows,
            written
        );
        return Err(AppError::RowCountMismatch {
            path: output_path.display().to_string(),
            expected: total_rows,
            actual: written,
        });
    }

    tracing::info!("Completed file: {} ({} rows)", input_path.display(), total_rows);
    Ok(())
}

fn write_annotated_table(
    table: &SourceTable,
    fresh: &HashMap<i64, Religion>,
    stored: &HashMap<i64, Religion>,
    output_path: &Path,
) -> AppResult<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Could not create output directory {}", parent.display()))?;
    }

    let mut writer = csv::Writer::from_path(output_path)?;

    let religion_col = table.headers.iter().position(|h| h == RELIGION_COLUMN);
    match religion_col {
        Some(_) => writer.write_record(&table.headers)?,
        None => {
            let mut headers: Vec<&str> = table.headers.iter().collect();
            headers.push(RELIGION_COLUMN);
            writer.write_record(&headers)?;
        }
    }

    for (idx, row) in table.rows.iter().enumerate() {
        let label = fresh
            .get(&(idx as i64))
            .or_else(|| stored.get(&(idx as i64)))
            .copied()
            .unwrap_or(Religion::FALLBACK);

        let mut cells: Vec<String> = row.iter().map(str::to_string).collect();
        match religion_col {
            Some(col) => {
                if cells.len() <= col {
                    cells.resize(col + 1, String::new());
                }
                cells[col] = label.as_str().to_string();
            }
            None => cells.push(label.as_str().to_string()),
        }
        writer.write_record(&cells)?;
    }

    writer.flush().context("Could not flush output file")?;
    Ok(())
}

fn count_data_rows(path: &Path) -> AppResult<usize> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut count = 0;
    for row in reader.records() {
        row?;
        count += 1;
    }
    Ok(count)
}
