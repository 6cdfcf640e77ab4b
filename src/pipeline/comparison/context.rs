use std::cmp::Reverse;

use chrono::NaiveDate;
use uuid::Uuid;

use super::templates::{system_prompt, TemplateId};
use super::ComparisonError;
use crate::models::*;

pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Shorter remnants are dropped instead of truncated.
const MIN_TRUNCATED_CHARS: usize = 20;

/// Bounded input for one engine call.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisContext {
    pub patient_id: String,
    pub report_kind: ReportKind,
    pub template: TemplateId,
    /// No eligible history: the run is a first-time analysis.
    pub standalone: bool,
    pub system_prompt: String,
    pub user_prompt: String,
    pub current_report_ref: Uuid,
    pub current_report_date: NaiveDate,
    /// The single prior report fed to the engine.
    pub prior_report: Option<(Uuid, NaiveDate)>,
    /// Every eligible prior report, most-recent-first, for provenance.
    pub historical_refs: Vec<Uuid>,
    pub truncated: bool,
}

/// Truncation order: lowest tier first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    PriorFreeText,
    PatientContext,
    CurrentFreeText,
}

#[derive(Debug, Clone)]
enum Segment {
    /// Structured content, never shortened.
    Fixed(String),
    FreeText {
        label: &'static str,
        text: String,
        tier: Tier,
    },
}

impl Segment {
    fn fixed(line: impl Into<String>) -> Self {
        let mut line = line.into();
        line.push('\n');
        Self::Fixed(line)
    }

    fn free(label: &'static str, text: &Option<String>, tier: Tier) -> Option<Self> {
        text.as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Self::FreeText {
                label,
                text: t.to_string(),
                tier,
            })
    }

    fn render(&self) -> String {
        match self {
            Self::Fixed(line) => line.clone(),
            Self::FreeText { label, text, .. } => format!("{label}: {text}\n"),
        }
    }

    fn len(&self) -> usize {
        self.render().chars().count()
    }
}

/// Merges the current report, the most recent prior report and patient
/// narrative into a prompt no longer than `char_budget` characters.
#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    char_budget: usize,
}

impl ContextAssembler {
    pub fn new(char_budget: usize) -> Self {
        Self { char_budget }
    }

    pub fn char_budget(&self) -> usize {
        self.char_budget
    }

    /// `history` must be most-recent-first. Only its head is rendered.
    pub fn assemble(
        &self,
        current: &Report,
        history: &[Report],
        patient: Option<&PatientContext>,
    ) -> Result<AnalysisContext, ComparisonError> {
        let kind = current.report_kind();
        let template = TemplateId::for_kind(kind);
        let prior = history.first();
        let standalone = prior.is_none();

        let mut segments = Vec::new();
        segments.push(Segment::fixed("<CURRENT REPORT>"));
        segments.extend(report_segments(current, Tier::CurrentFreeText));
        segments.push(Segment::fixed("</CURRENT REPORT>"));

        if let Some(prior) = prior {
            segments.push(Segment::fixed("<PRIOR REPORT>"));
            segments.push(Segment::fixed(format!(
                "Days before current report: {}",
                (current.report_date - prior.report_date).num_days()
            )));
            segments.push(Segment::fixed(format!(
                "Eligible prior reports in window: {} (most recent shown)",
                history.len()
            )));
            segments.extend(report_segments(prior, Tier::PriorFreeText));
            segments.push(Segment::fixed("</PRIOR REPORT>"));
        }

        if let Some(ctx) = patient {
            let narrative = ctx.narrative();
            if !narrative.is_empty() {
                segments.push(Segment::fixed("<PATIENT CONTEXT>"));
                for (label, text) in narrative {
                    segments.push(Segment::FreeText {
                        label,
                        text: text.to_string(),
                        tier: Tier::PatientContext,
                    });
                }
                segments.push(Segment::fixed("</PATIENT CONTEXT>"));
            }
        }

        let truncated = fit_to_budget(&mut segments, self.char_budget)?;
        if truncated {
            tracing::debug!(
                patient_id = %current.patient_id,
                budget = self.char_budget,
                "Context truncated to fit budget"
            );
        }

        let user_prompt: String = segments.iter().map(Segment::render).collect();

        Ok(AnalysisContext {
            patient_id: current.patient_id.clone(),
            report_kind: kind,
            template,
            standalone,
            system_prompt: system_prompt(template, standalone),
            user_prompt,
            current_report_ref: current.id,
            current_report_date: current.report_date,
            prior_report: prior.map(|p| (p.id, p.report_date)),
            historical_refs: history.iter().map(|r| r.id).collect(),
            truncated,
        })
    }
}

/// Shrink free text until the rendered total fits. Returns whether anything changed.
fn fit_to_budget(segments: &mut Vec<Segment>, budget: usize) -> Result<bool, ComparisonError> {
    let fixed: usize = segments
        .iter()
        .filter(|s| matches!(s, Segment::Fixed(_)))
        .map(Segment::len)
        .sum();
    if fixed > budget {
        return Err(ComparisonError::ContextOverflow {
            required: fixed,
            budget,
        });
    }

    let total: usize = segments.iter().map(Segment::len).sum();
    if total <= budget {
        return Ok(false);
    }
    let mut excess = total - budget;

    let mut order: Vec<(Tier, Reverse<usize>)> = segments
        .iter()
        .enumerate()
        .filter_map(|(i, s)| match s {
            Segment::FreeText { tier, .. } => Some((*tier, Reverse(i))),
            Segment::Fixed(_) => None,
        })
        .collect();
    order.sort();

    let mut dropped = Vec::new();
    for (_, Reverse(index)) in order {
        if excess == 0 {
            break;
        }
        let full = segments[index].len();
        if let Segment::FreeText { text, .. } = &mut segments[index] {
            let text_chars = text.chars().count();
            let keep = text_chars.saturating_sub(excess + TRUNCATION_MARKER.chars().count());
            if keep >= MIN_TRUNCATED_CHARS {
                let mut shortened: String = text.chars().take(keep).collect();
                shortened.push_str(TRUNCATION_MARKER);
                *text = shortened;
                excess = 0;
            } else {
                dropped.push(index);
                excess = excess.saturating_sub(full);
            }
        }
    }

    dropped.sort_unstable_by(|a, b| b.cmp(a));
    for index in dropped {
        segments.remove(index);
    }
    Ok(true)
}

fn report_segments(report: &Report, tier: Tier) -> Vec<Segment> {
    let mut out = vec![
        Segment::fixed(format!("Report date: {}", report.report_date)),
        Segment::fixed(format!("Report kind: {}", report.report_kind())),
    ];

    match &report.payload {
        ReportPayload::RoutineLab(lab) => {
            out.extend(lab.items.iter().map(|item| Segment::fixed(lab_line(item))));
        }
        ReportPayload::Microbiology(micro) => {
            for culture in &micro.cultures {
                let mut line = format!("- Culture: {}", culture.organism);
                if let Some(specimen) = &culture.specimen {
                    line.push_str(&format!(", specimen {specimen}"));
                }
                if let Some(count) = &culture.colony_count {
                    line.push_str(&format!(", colony count {count}"));
                }
                out.push(Segment::fixed(line));
            }
            for s in &micro.susceptibilities {
                let mut line = format!(
                    "- Susceptibility: {} / {}: {}",
                    s.organism, s.antibiotic, s.interpretation
                );
                if let Some(mic) = &s.mic {
                    line.push_str(&format!(" (MIC {mic})"));
                }
                out.push(Segment::fixed(line));
            }
            if let Some(q) = &micro.quantitative {
                out.push(Segment::fixed(quantitative_line(q)));
            }
            out.extend(Segment::free("Department", &micro.department, tier));
            out.extend(Segment::free("Diagnosis", &micro.diagnosis, tier));
        }
        ReportPayload::Examination(exam) => {
            if let Some(line) = exam_name_line(&exam.result_name, &exam.result_code) {
                out.push(Segment::fixed(line));
            }
            if let Some(q) = &exam.quantitative {
                out.push(Segment::fixed(quantitative_line(q)));
            }
            out.extend(Segment::free("Observation", &exam.observation, tier));
            out.extend(Segment::free("Impression", &exam.impression, tier));
        }
        ReportPayload::Pathology(path) => {
            if let Some(line) = exam_name_line(&path.result_name, &path.result_code) {
                out.push(Segment::fixed(line));
            }
            if let Some(q) = &path.quantitative {
                out.push(Segment::fixed(quantitative_line(q)));
            }
            if path.symptom_start.is_some() || path.symptom_end.is_some() {
                let show = |d: Option<NaiveDate>| d.map_or_else(|| "unknown".to_string(), |d| d.to_string());
                out.push(Segment::fixed(format!(
                    "Symptom period: {} to {}",
                    show(path.symptom_start),
                    show(path.symptom_end)
                )));
            }
            out.extend(Segment::free("Chief complaint", &path.chief_complaint, tier));
            out.extend(Segment::free("Symptom description", &path.symptom_description, tier));
            out.extend(Segment::free("Observation", &path.observation, tier));
            out.extend(Segment::free("Impression", &path.impression, tier));
            out.extend(Segment::free("Diagnosis", &path.diagnosis_description, tier));
        }
    }
    out
}

fn lab_line(item: &LabItem) -> String {
    let mut line = format!("- {}: {}", item.name, item.value);
    if let Some(unit) = &item.unit {
        line.push(' ');
        line.push_str(unit);
    }
    if let Some(range) = &item.reference_range {
        line.push_str(&format!(" (ref {range})"));
    }
    if let Some(flag) = item.abnormal_flag.filter(|f| *f != AbnormalFlag::Normal) {
        line.push_str(&format!(" [{flag}]"));
    }
    line
}

fn quantitative_line(q: &QuantitativeResult) -> String {
    match &q.unit {
        Some(unit) => format!("- Quantitative result: {} {unit}", q.value),
        None => format!("- Quantitative result: {}", q.value),
    }
}

fn exam_name_line(name: &Option<String>, code: &Option<String>) -> Option<String> {
    match (name, code) {
        (Some(name), Some(code)) => Some(format!("Examination: {name} ({code})")),
        (Some(name), None) => Some(format!("Examination: {name}")),
        (None, Some(code)) => Some(format!("Examination code: {code}")),
        (None, None) => None,
    }
}
