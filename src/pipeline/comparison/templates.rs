//! Per-kind instruction templates for the reasoning engine.
//!
//! Template choice is a fixed mapping from report kind. Each template has a
//! comparative and a first-time variant; both end with the headings the
//! result parser recognises.

use std::fmt;

use crate::models::ReportKind;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateId {
    /// Numeric indicator drift against reference ranges.
    LabIndicatorDrift,
    /// Pathogen counts and resistance patterns.
    MicrobiologyResistance,
    /// Descriptive change in imaging and functional findings.
    ExaminationObservation,
    /// Morphology, grading and disease progression.
    PathologyProgression,
}

impl TemplateId {
    pub fn for_kind(kind: ReportKind) -> Self {
        match kind {
            ReportKind::RoutineLab => Self::LabIndicatorDrift,
            ReportKind::Microbiology => Self::MicrobiologyResistance,
            ReportKind::Examination => Self::ExaminationObservation,
            ReportKind::Pathology => Self::PathologyProgression,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LabIndicatorDrift => "lab_indicator_drift",
            Self::MicrobiologyResistance => "microbiology_resistance",
            Self::ExaminationObservation => "examination_observation",
            Self::PathologyProgression => "pathology_progression",
        }
    }

    fn role(&self) -> &'static str {
        match self {
            Self::LabIndicatorDrift => {
                "You are a clinical laboratory medicine specialist reviewing routine test results."
            }
            Self::MicrobiologyResistance => {
                "You are a clinical microbiologist reviewing culture and susceptibility results."
            }
            Self::ExaminationObservation => {
                "You are a diagnostic imaging and functional examination specialist."
            }
            Self::PathologyProgression => {
                "You are a pathologist reviewing biopsy and cytology findings together with the clinical history."
            }
        }
    }

    fn comparative_focus(&self) -> &'static str {
        match self {
            Self::LabIndicatorDrift => {
                "Compare the current report with the prior report. For each indicator, state the \
                 direction and size of the change, whether it crossed a reference limit, and which \
                 changes are clinically meaningful rather than normal variation."
            }
            Self::MicrobiologyResistance => {
                "Compare the current report with the prior report. Focus on whether the same \
                 pathogen persists, changes in colony counts, newly appearing organisms, and any \
                 shift in antibiotic susceptibility toward resistance."
            }
            Self::ExaminationObservation => {
                "Compare the current report with the prior report. Describe which findings are \
                 new, resolved, enlarged, reduced or unchanged, and whether any measured quantity \
                 moved meaningfully."
            }
            Self::PathologyProgression => {
                "Compare the current report with the prior report. Describe changes in morphology, \
                 grade or stage, and whether the picture suggests progression, stability or \
                 regression in light of the symptoms."
            }
        }
    }

    fn standalone_focus(&self) -> &'static str {
        match self {
            Self::LabIndicatorDrift => {
                "No prior report is available; this is a first-time analysis. Interpret each \
                 indicator against its reference range."
            }
            Self::MicrobiologyResistance => {
                "No prior report is available; this is a first-time analysis. Interpret the \
                 organisms found, their counts and the susceptibility profile."
            }
            Self::ExaminationObservation => {
                "No prior report is available; this is a first-time analysis. Interpret the \
                 findings and any measured quantities."
            }
            Self::PathologyProgression => {
                "No prior report is available; this is a first-time analysis. Interpret the \
                 morphology and diagnosis in light of the symptoms."
            }
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════

pub const HEADING_SIGNIFICANT_CHANGES: &str = "Significant Changes";
pub const HEADING_TRENDS: &str = "Trends";
pub const HEADING_ABNORMAL_VALUES: &str = "Abnormal Values";
pub const HEADING_RISK_ASSESSMENT: &str = "Risk Assessment";
pub const HEADING_RECOMMENDATIONS: &str = "Recommendations";

const STANDALONE_RULE: &str =
    "Do not describe trends or changes over time and do not assume any earlier values.";

const CLOSING_RULE: &str = "Be concise and factual. Do not invent values that are not in the report.";

/// System prompt for `template`. `standalone` selects the first-time variant.
pub fn system_prompt(template: TemplateId, standalone: bool) -> String {
    let (focus, headings): (&str, &[&str]) = if standalone {
        (
            template.standalone_focus(),
            &[HEADING_ABNORMAL_VALUES, HEADING_RISK_ASSESSMENT, HEADING_RECOMMENDATIONS],
        )
    } else {
        (
            template.comparative_focus(),
            &[
                HEADING_SIGNIFICANT_CHANGES,
                HEADING_TRENDS,
                HEADING_ABNORMAL_VALUES,
                HEADING_RISK_ASSESSMENT,
                HEADING_RECOMMENDATIONS,
            ],
        )
    };

    let mut prompt = format!("{}\n\n{focus}\n", template.role());
    if standalone {
        prompt.push_str(STANDALONE_RULE);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nStructure the answer with exactly these Markdown headings, each followed by \"- \" bullet points:\n",
    );
    for heading in headings {
        prompt.push_str("## ");
        prompt.push_str(heading);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(CLOSING_RULE);
    prompt
}
