use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::sqlite::{date_from_sql, timestamp_from_sql, timestamp_to_sql, uuid_from_sql};
use crate::db::DatabaseError;
use crate::models::*;

/// Eligibility filter for prior reports of one patient and kind.
#[derive(Debug, Clone)]
pub struct HistoryFilter<'a> {
    pub patient_id: &'a str,
    pub report_kind: ReportKind,
    /// Reports must be strictly earlier than this date, or on it with an
    /// earlier `created_at` when `before_created_at` is set.
    pub before_date: NaiveDate,
    pub before_created_at: Option<DateTime<Utc>>,
    /// Inclusive lower date bound; `None` means unbounded.
    pub since: Option<NaiveDate>,
    pub exclude: Option<Uuid>,
}

pub fn insert_report(conn: &Connection, report: &Report) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO reports (id, patient_id, report_kind, report_date, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            report.id.to_string(),
            report.patient_id,
            report.report_kind().as_str(),
            report.report_date.to_string(),
            serde_json::to_string(&report.payload)?,
            timestamp_to_sql(&report.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_report(conn: &Connection, id: &Uuid) -> Result<Option<Report>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, report_kind, report_date, payload, created_at
         FROM reports WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![id.to_string()], |row| Ok(report_row_from_rusqlite(row)))?;
    match rows.next() {
        Some(row) => Ok(Some(report_from_row(row??)?)),
        None => Ok(None),
    }
}

/// Prior reports matching `filter`, most-recent-first
/// (`report_date` then `created_at`, both descending).
pub fn get_history(
    conn: &Connection,
    filter: &HistoryFilter<'_>,
) -> Result<Vec<Report>, DatabaseError> {
    let before_date = filter.before_date.to_string();
    let before_created = filter.before_created_at.as_ref().map(timestamp_to_sql);
    let since = filter.since.map(|d| d.to_string());
    let exclude = filter.exclude.map(|id| id.to_string());

    let mut stmt = conn.prepare(
        "SELECT id, patient_id, report_kind, report_date, payload, created_at
         FROM reports
         WHERE patient_id = ?1 AND report_kind = ?2
           AND (?3 IS NULL OR id != ?3)
           AND (report_date < ?4 OR (report_date = ?4 AND ?5 IS NOT NULL AND created_at < ?5))
           AND (?6 IS NULL OR report_date >= ?6)
         ORDER BY report_date DESC, created_at DESC",
    )?;

    let rows = stmt.query_map(
        params![
            filter.patient_id,
            filter.report_kind.as_str(),
            exclude,
            before_date,
            before_created,
            since,
        ],
        |row| Ok(report_row_from_rusqlite(row)),
    )?;

    let mut reports = Vec::new();
    for row in rows {
        reports.push(report_from_row(row??)?);
    }
    Ok(reports)
}

/// Number of stored reports for a patient (all kinds).
pub fn count_reports_for_patient(conn: &Connection, patient_id: &str) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM reports WHERE patient_id = ?1",
        params![patient_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

// Internal row type for Report mapping
struct ReportRow {
    id: String,
    patient_id: String,
    report_kind: String,
    report_date: String,
    payload: String,
    created_at: String,
}

fn report_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<ReportRow, rusqlite::Error> {
    Ok(ReportRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        report_kind: row.get(2)?,
        report_date: row.get(3)?,
        payload: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn report_from_row(row: ReportRow) -> Result<Report, DatabaseError> {
    let kind = ReportKind::from_str(&row.report_kind)?;
    let payload: ReportPayload = serde_json::from_str(&row.payload)?;
    if payload.kind() != kind {
        return Err(DatabaseError::ConstraintViolation(format!(
            "report {} stored as {kind} but payload is {}",
            row.id,
            payload.kind()
        )));
    }
    Ok(Report {
        id: uuid_from_sql(&row.id)?,
        patient_id: row.patient_id,
        report_date: date_from_sql(&row.report_date)?,
        payload,
        created_at: timestamp_from_sql(&row.created_at)?,
    })
}
