use std::cmp::Reverse;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::traits::ReportRepository;
use super::ComparisonError;
use crate::db::{self, Database, DatabaseError, HistoryFilter};
use crate::models::{ComparisonPeriod, PatientContext, Report, ReportKind};

/// Which prior reports are eligible for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub patient_id: String,
    pub report_kind: ReportKind,
    pub before_date: NaiveDate,
    /// Same-date reports are eligible only if created before this instant.
    pub before_created_at: Option<DateTime<Utc>>,
    pub exclude: Option<Uuid>,
    pub period: ComparisonPeriod,
}

impl HistoryQuery {
    pub fn new(
        patient_id: impl Into<String>,
        report_kind: ReportKind,
        before_date: NaiveDate,
        period: ComparisonPeriod,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            report_kind,
            before_date,
            before_created_at: None,
            exclude: None,
            period,
        }
    }

    /// History window anchored at `current`.
    pub fn for_report(current: &Report, period: ComparisonPeriod) -> Self {
        Self {
            patient_id: current.patient_id.clone(),
            report_kind: current.report_kind(),
            before_date: current.report_date,
            before_created_at: Some(current.created_at),
            exclude: Some(current.id),
            period,
        }
    }

    /// Inclusive earliest eligible date.
    pub fn lower_bound(&self) -> Option<NaiveDate> {
        self.period.lower_bound(self.before_date)
    }

    pub fn admits(&self, report: &Report) -> bool {
        if report.patient_id != self.patient_id
            || report.report_kind() != self.report_kind
            || Some(report.id) == self.exclude
        {
            return false;
        }
        let prior = report.report_date < self.before_date
            || (report.report_date == self.before_date
                && self
                    .before_created_at
                    .is_some_and(|created| report.created_at < created));
        let in_window = self.lower_bound().map_or(true, |bound| report.report_date >= bound);
        prior && in_window
    }

    pub fn as_filter(&self) -> HistoryFilter<'_> {
        HistoryFilter {
            patient_id: &self.patient_id,
            report_kind: self.report_kind,
            before_date: self.before_date,
            before_created_at: self.before_created_at,
            since: self.lower_bound(),
            exclude: self.exclude,
        }
    }
}

/// All eligible prior reports, most-recent-first.
///
/// An empty result means "confirmed no history". A repository failure is
/// surfaced as `StorageUnavailable` and never replaced by an empty list.
pub fn select_history(
    repository: &dyn ReportRepository,
    query: &HistoryQuery,
) -> Result<Vec<Report>, ComparisonError> {
    let mut reports = repository
        .get_history(query)
        .map_err(ComparisonError::StorageUnavailable)?;

    reports.retain(|r| query.admits(r));
    reports.sort_by_key(|r| Reverse((r.report_date, r.created_at)));

    tracing::debug!(
        patient_id = %query.patient_id,
        report_kind = %query.report_kind,
        period = %query.period,
        eligible = reports.len(),
        "History selected"
    );
    Ok(reports)
}

/// SQLite-backed report repository. Opens a connection per call.
#[derive(Debug, Clone)]
pub struct SqliteReportRepository {
    db: Database,
}

impl SqliteReportRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert_report(&self, report: &Report) -> Result<(), DatabaseError> {
        let conn = self.db.connect()?;
        db::insert_report(&conn, report)
    }

    pub fn get_report(&self, id: &Uuid) -> Result<Option<Report>, DatabaseError> {
        let conn = self.db.connect()?;
        db::get_report(&conn, id)
    }

    pub fn upsert_patient_context(&self, ctx: &PatientContext) -> Result<(), DatabaseError> {
        let conn = self.db.connect()?;
        db::upsert_patient_context(&conn, ctx)
    }
}

impl ReportRepository for SqliteReportRepository {
    fn get_history(&self, query: &HistoryQuery) -> Result<Vec<Report>, DatabaseError> {
        let conn = self.db.connect()?;
        db::get_history(&conn, &query.as_filter())
    }

    fn get_patient_context(&self, patient_id: &str) -> Result<Option<PatientContext>, DatabaseError> {
        let conn = self.db.connect()?;
        db::get_patient_context(&conn, patient_id)
    }
}
