use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::enums::{AbnormalFlag, Interpretation, ReportKind};

/// A malformed input report, rejected before any pipeline stage runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Report has no patient identifier")]
    MissingPatientId,

    #[error("{kind} report is missing required content: {field}")]
    MissingField { kind: ReportKind, field: String },
}

/// One submitted medical data point. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub patient_id: String,
    pub report_date: NaiveDate,
    pub payload: ReportPayload,
    pub created_at: DateTime<Utc>,
}

impl Report {
    pub fn new(patient_id: impl Into<String>, report_date: NaiveDate, payload: ReportPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id: patient_id.into(),
            report_date,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn report_kind(&self) -> ReportKind {
        self.payload.kind()
    }

    /// Required-content check per report kind.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.patient_id.trim().is_empty() {
            return Err(ValidationError::MissingPatientId);
        }
        let kind = self.report_kind();
        let missing = |field: &str| ValidationError::MissingField {
            kind,
            field: field.to_string(),
        };

        match &self.payload {
            ReportPayload::RoutineLab(lab) => {
                if !lab.items.iter().any(|i| !i.name.trim().is_empty()) {
                    return Err(missing("items"));
                }
            }
            ReportPayload::Microbiology(micro) => {
                if micro.cultures.is_empty()
                    && micro.susceptibilities.is_empty()
                    && micro.quantitative.is_none()
                {
                    return Err(missing("cultures, susceptibilities or quantitative result"));
                }
            }
            ReportPayload::Examination(exam) => {
                if is_blank(&exam.observation) && is_blank(&exam.impression) {
                    return Err(missing("observation or impression"));
                }
            }
            ReportPayload::Pathology(path) => {
                if is_blank(&path.observation) && is_blank(&path.impression) {
                    return Err(missing("observation or impression"));
                }
            }
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

/// Kind-specific report content, tagged by `report_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "report_kind", rename_all = "snake_case")]
pub enum ReportPayload {
    RoutineLab(RoutineLabPayload),
    Microbiology(MicrobiologyPayload),
    Examination(ExaminationPayload),
    Pathology(PathologyPayload),
}

impl ReportPayload {
    pub fn kind(&self) -> ReportKind {
        match self {
            Self::RoutineLab(_) => ReportKind::RoutineLab,
            Self::Microbiology(_) => ReportKind::Microbiology,
            Self::Examination(_) => ReportKind::Examination,
            Self::Pathology(_) => ReportKind::Pathology,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutineLabPayload {
    pub items: Vec<LabItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabItem {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub reference_range: Option<String>,
    #[serde(default)]
    pub abnormal_flag: Option<AbnormalFlag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantitativeResult {
    pub value: String,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicrobiologyPayload {
    #[serde(default)]
    pub cultures: Vec<CultureResult>,
    #[serde(default)]
    pub susceptibilities: Vec<Susceptibility>,
    #[serde(default)]
    pub quantitative: Option<QuantitativeResult>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub diagnosis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CultureResult {
    #[serde(default)]
    pub specimen: Option<String>,
    pub organism: String,
    #[serde(default)]
    pub colony_count: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Susceptibility {
    pub organism: String,
    pub antibiotic: String,
    pub interpretation: Interpretation,
    #[serde(default)]
    pub mic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExaminationPayload {
    #[serde(default)]
    pub result_code: Option<String>,
    #[serde(default)]
    pub result_name: Option<String>,
    #[serde(default)]
    pub quantitative: Option<QuantitativeResult>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub impression: Option<String>,
}

/// Examination fields plus the clinical narrative recorded with a pathology report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathologyPayload {
    #[serde(default)]
    pub result_code: Option<String>,
    #[serde(default)]
    pub result_name: Option<String>,
    #[serde(default)]
    pub quantitative: Option<QuantitativeResult>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub impression: Option<String>,
    #[serde(default)]
    pub chief_complaint: Option<String>,
    #[serde(default)]
    pub symptom_description: Option<String>,
    #[serde(default)]
    pub symptom_start: Option<NaiveDate>,
    #[serde(default)]
    pub symptom_end: Option<NaiveDate>,
    #[serde(default)]
    pub diagnosis_description: Option<String>,
}

/// Free-text clinical narrative for a patient. Opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub patient_id: String,
    pub allergy_history: Option<String>,
    pub discharge_summary: Option<String>,
    pub lab_narrative: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PatientContext {
    /// Labelled narrative blocks that carry text, in display order.
    pub fn narrative(&self) -> Vec<(&'static str, &str)> {
        [
            ("Allergy history", &self.allergy_history),
            ("Discharge summary", &self.discharge_summary),
            ("Latest lab narrative", &self.lab_narrative),
        ]
        .into_iter()
        .filter_map(|(label, text)| {
            text.as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| (label, t))
        })
        .collect()
    }
}
