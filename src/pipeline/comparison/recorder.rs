use super::traits::{ComparisonStore, RecordId};
use crate::db::{self, Database, DatabaseError};
use crate::models::{ComparisonRecord, ReportKind};

/// Append-only SQLite store for comparison records.
///
/// Each call opens its own connection; `record` writes inside a
/// transaction so readers never observe a partial row.
#[derive(Debug, Clone)]
pub struct SqliteComparisonStore {
    db: Database,
}

impl SqliteComparisonStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl ComparisonStore for SqliteComparisonStore {
    fn record(&self, record: &ComparisonRecord) -> Result<RecordId, DatabaseError> {
        let conn = self.db.connect()?;
        let tx = conn.unchecked_transaction()?;
        let seq = db::insert_comparison_record(&tx, record)?;
        tx.commit()?;

        tracing::info!(
            record_id = %record.id,
            seq,
            patient_id = %record.patient_id,
            report_kind = %record.report_kind,
            narrative_type = %record.narrative_type,
            confidence = %record.confidence,
            "Comparison record written"
        );
        Ok(record.id)
    }

    fn fetch(
        &self,
        patient_id: &str,
        report_kind: Option<ReportKind>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ComparisonRecord>, DatabaseError> {
        let conn = self.db.connect()?;
        db::list_comparison_records(&conn, patient_id, report_kind, limit, offset)
    }

    fn count(&self, patient_id: &str, report_kind: Option<ReportKind>) -> Result<u64, DatabaseError> {
        let conn = self.db.connect()?;
        db::count_comparison_records(&conn, patient_id, report_kind)
    }
}
