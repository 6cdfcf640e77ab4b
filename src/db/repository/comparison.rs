use std::str::FromStr;

use rusqlite::{params, Connection};

use crate::db::sqlite::{date_from_sql, timestamp_from_sql, timestamp_to_sql, uuid_from_sql};
use crate::db::DatabaseError;
use crate::models::*;

const RECORD_COLUMNS: &str = "id, patient_id, report_kind, current_report_ref, current_report_date,
     historical_reports_count, historical_reports_refs, comparison_period, narrative,
     narrative_type, key_changes, trend_summary, risk_assessment, recommendations,
     model_identifier, confidence, tokens_used, failure_kind, failure_reason,
     context_truncated, processed_at";

/// Append one record. Returns the row sequence number.
pub fn insert_comparison_record(
    conn: &Connection,
    record: &ComparisonRecord,
) -> Result<i64, DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO comparison_records ({RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            record.id.to_string(),
            record.patient_id,
            record.report_kind.as_str(),
            record.current_report_ref.to_string(),
            record.current_report_date.to_string(),
            record.historical_reports_count,
            serde_json::to_string(&record.historical_reports_refs)?,
            record.comparison_period.as_str(),
            record.narrative,
            record.narrative_type.as_str(),
            serde_json::to_string(&record.key_changes)?,
            record.trend_summary,
            record.risk_assessment,
            record.recommendations,
            record.model_identifier,
            record.confidence.as_str(),
            record.tokens_used,
            record.failure_kind.map(|k| k.as_str()),
            record.failure_reason,
            record.context_truncated,
            timestamp_to_sql(&record.processed_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Records for a patient, most-recent-first. `report_kind = None` spans all kinds.
pub fn list_comparison_records(
    conn: &Connection,
    patient_id: &str,
    report_kind: Option<ReportKind>,
    limit: u32,
    offset: u32,
) -> Result<Vec<ComparisonRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS}
         FROM comparison_records
         WHERE patient_id = ?1 AND (?2 IS NULL OR report_kind = ?2)
         ORDER BY processed_at DESC, seq DESC
         LIMIT ?3 OFFSET ?4"
    ))?;

    let rows = stmt.query_map(
        params![patient_id, report_kind.map(|k| k.as_str()), limit, offset],
        |row| Ok(record_row_from_rusqlite(row)),
    )?;

    let mut records = Vec::new();
    for row in rows {
        records.push(record_from_row(row??)?);
    }
    Ok(records)
}

pub fn count_comparison_records(
    conn: &Connection,
    patient_id: &str,
    report_kind: Option<ReportKind>,
) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM comparison_records
         WHERE patient_id = ?1 AND (?2 IS NULL OR report_kind = ?2)",
        params![patient_id, report_kind.map(|k| k.as_str())],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

// Internal row type for ComparisonRecord mapping
struct ComparisonRow {
    id: String,
    patient_id: String,
    report_kind: String,
    current_report_ref: String,
    current_report_date: String,
    historical_reports_count: u32,
    historical_reports_refs: String,
    comparison_period: String,
    narrative: Option<String>,
    narrative_type: String,
    key_changes: String,
    trend_summary: Option<String>,
    risk_assessment: Option<String>,
    recommendations: Option<String>,
    model_identifier: String,
    confidence: String,
    tokens_used: Option<u32>,
    failure_kind: Option<String>,
    failure_reason: Option<String>,
    context_truncated: bool,
    processed_at: String,
}

fn record_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<ComparisonRow, rusqlite::Error> {
    Ok(ComparisonRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        report_kind: row.get(2)?,
        current_report_ref: row.get(3)?,
        current_report_date: row.get(4)?,
        historical_reports_count: row.get(5)?,
        historical_reports_refs: row.get(6)?,
        comparison_period: row.get(7)?,
        narrative: row.get(8)?,
        narrative_type: row.get(9)?,
        key_changes: row.get(10)?,
        trend_summary: row.get(11)?,
        risk_assessment: row.get(12)?,
        recommendations: row.get(13)?,
        model_identifier: row.get(14)?,
        confidence: row.get(15)?,
        tokens_used: row.get(16)?,
        failure_kind: row.get(17)?,
        failure_reason: row.get(18)?,
        context_truncated: row.get(19)?,
        processed_at: row.get(20)?,
    })
}

fn record_from_row(row: ComparisonRow) -> Result<ComparisonRecord, DatabaseError> {
    Ok(ComparisonRecord {
        id: uuid_from_sql(&row.id)?,
        patient_id: row.patient_id,
        report_kind: ReportKind::from_str(&row.report_kind)?,
        current_report_ref: uuid_from_sql(&row.current_report_ref)?,
        current_report_date: date_from_sql(&row.current_report_date)?,
        historical_reports_count: row.historical_reports_count,
        historical_reports_refs: serde_json::from_str(&row.historical_reports_refs)?,
        comparison_period: ComparisonPeriod::from_str(&row.comparison_period)?,
        narrative: row.narrative,
        narrative_type: NarrativeType::from_str(&row.narrative_type)?,
        key_changes: serde_json::from_str(&row.key_changes)?,
        trend_summary: row.trend_summary,
        risk_assessment: row.risk_assessment,
        recommendations: row.recommendations,
        model_identifier: row.model_identifier,
        confidence: Confidence::from_str(&row.confidence)?,
        tokens_used: row.tokens_used,
        failure_kind: row
            .failure_kind
            .as_deref()
            .map(FailureKind::from_str)
            .transpose()?,
        failure_reason: row.failure_reason,
        context_truncated: row.context_truncated,
        processed_at: timestamp_from_sql(&row.processed_at)?,
    })
}
