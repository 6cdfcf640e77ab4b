use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ComparisonPeriod, Confidence, FailureKind, NarrativeType, ReportKind};

/// Characters of narrative kept as key findings in a patient summary.
pub const KEY_FINDINGS_CHARS: usize = 100;

/// Bullet lists extracted from the engine's response. Never null, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChanges {
    pub significant_changes: Vec<String>,
    pub trends: Vec<String>,
    pub abnormal_values: Vec<String>,
    pub recommendations: Vec<String>,
}

impl KeyChanges {
    pub fn is_empty(&self) -> bool {
        self.significant_changes.is_empty()
            && self.trends.is_empty()
            && self.abnormal_values.is_empty()
            && self.recommendations.is_empty()
    }
}

/// The persisted output of one comparison run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub id: Uuid,
    pub patient_id: String,
    pub report_kind: ReportKind,
    pub current_report_ref: Uuid,
    pub current_report_date: NaiveDate,
    pub historical_reports_count: u32,
    /// Most-recent-first.
    pub historical_reports_refs: Vec<Uuid>,
    pub comparison_period: ComparisonPeriod,
    pub narrative: Option<String>,
    pub narrative_type: NarrativeType,
    pub key_changes: KeyChanges,
    pub trend_summary: Option<String>,
    pub risk_assessment: Option<String>,
    pub recommendations: Option<String>,
    pub model_identifier: String,
    pub confidence: Confidence,
    pub tokens_used: Option<u32>,
    pub failure_kind: Option<FailureKind>,
    pub failure_reason: Option<String>,
    pub context_truncated: bool,
    pub processed_at: DateTime<Utc>,
}

impl ComparisonRecord {
    pub fn is_degraded(&self) -> bool {
        self.failure_kind.is_some()
    }

    pub fn summary(&self) -> ComparisonSummary {
        ComparisonSummary {
            record_id: self.id,
            report_kind: self.report_kind,
            current_report_date: self.current_report_date,
            historical_reports_count: self.historical_reports_count,
            narrative_type: self.narrative_type,
            confidence: self.confidence,
            key_findings: self
                .narrative
                .as_deref()
                .map(|n| n.chars().take(KEY_FINDINGS_CHARS).collect()),
            processed_at: self.processed_at,
        }
    }
}

/// Compact view of one record, used in cross-kind patient summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub record_id: Uuid,
    pub report_kind: ReportKind,
    pub current_report_date: NaiveDate,
    pub historical_reports_count: u32,
    pub narrative_type: NarrativeType,
    pub confidence: Confidence,
    pub key_findings: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientHistorySummary {
    pub patient_id: String,
    pub total_records: u64,
    pub records: Vec<ComparisonSummary>,
}
