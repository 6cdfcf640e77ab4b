//! Module boundaries of the comparison pipeline.
//!
//! - ReportRepository: read access to prior reports and patient narrative
//! - ReasoningEngine: one call to the external natural-language engine
//! - ComparisonStore: append-only persistence of comparison records

use std::time::Duration;

use uuid::Uuid;

use super::context::AnalysisContext;
use super::history::HistoryQuery;
use super::ReasoningFailure;
use crate::db::DatabaseError;
use crate::models::{ComparisonRecord, PatientContext, Report, ReportKind};

pub type RecordId = Uuid;

/// Text returned by the engine, uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub text: String,
    /// Model name reported by the engine, when it reports one.
    pub model: Option<String>,
    pub tokens_used: Option<u32>,
}

pub trait ReportRepository: Send + Sync {
    /// Candidate prior reports for `query`, most-recent-first.
    fn get_history(&self, query: &HistoryQuery) -> Result<Vec<Report>, DatabaseError>;

    fn get_patient_context(&self, patient_id: &str) -> Result<Option<PatientContext>, DatabaseError>;
}

pub trait ReasoningEngine: Send + Sync {
    /// Single request/response exchange, bounded by `timeout`.
    fn complete(
        &self,
        context: &AnalysisContext,
        timeout: Duration,
    ) -> Result<RawResponse, ReasoningFailure>;
}

pub trait ComparisonStore: Send + Sync {
    /// Persist a record atomically. Never overwrites.
    fn record(&self, record: &ComparisonRecord) -> Result<RecordId, DatabaseError>;

    /// Records for a patient, most-recent-first. `None` spans all kinds.
    fn fetch(
        &self,
        patient_id: &str,
        report_kind: Option<ReportKind>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ComparisonRecord>, DatabaseError>;

    fn count(&self, patient_id: &str, report_kind: Option<ReportKind>) -> Result<u64, DatabaseError>;
}
