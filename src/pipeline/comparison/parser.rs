//! Free-text engine output → structured comparison fields.
//!
//! Pure and total: any input text produces a best-effort result.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use super::context::AnalysisContext;
use super::traits::RawResponse;
use crate::models::*;

/// Fixed trend summary for runs with no eligible history.
pub const FIRST_TIME_TREND_SUMMARY: &str =
    "First-time analysis: no prior report of this kind in the comparison period, so no trend is assessed.";

/// Matches "- item", "* item", "• item", "+ item", "1. item", "1) item".
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•+]|\d+[.)])\s+(.+)$").unwrap());

/// Leading heading numbering such as "1." or "2)".
static HEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s*").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Section {
    SignificantChanges,
    Trends,
    AbnormalValues,
    Recommendations,
    RiskAssessment,
}

fn section_for(name: &str) -> Option<Section> {
    match name {
        "significant changes" | "key changes" | "significant change" => {
            Some(Section::SignificantChanges)
        }
        "trends" | "trend" | "trend analysis" => Some(Section::Trends),
        "abnormal values" | "abnormal findings" | "abnormal results" => {
            Some(Section::AbnormalValues)
        }
        "recommendations" | "recommendation" | "advice" => Some(Section::Recommendations),
        "risk assessment" | "risk" | "risks" => Some(Section::RiskAssessment),
        _ => None,
    }
}

/// Strip markdown heading marks, emphasis, numbering and a trailing colon.
fn normalize_heading(raw: &str) -> String {
    let s = raw.trim().trim_start_matches('#').trim();
    let s = HEADING_NUMBER.replace(s, "");
    let s = s.trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace());
    let s = s.trim_end_matches(':').trim();
    let s = s.trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace());
    s.to_lowercase()
}

/// A heading line, possibly with inline content ("Trends: glucose rising").
fn parse_heading(line: &str, is_bullet: bool) -> Option<(Section, Option<String>)> {
    if let Some(section) = section_for(&normalize_heading(line)) {
        return Some((section, None));
    }
    if is_bullet {
        return None;
    }
    let (head, rest) = line.split_once(':')?;
    let section = section_for(&normalize_heading(head))?;
    let rest = clean_item(rest);
    Some((section, (!rest.is_empty()).then_some(rest)))
}

fn clean_item(text: &str) -> String {
    text.replace("**", "")
        .trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())
        .to_string()
}

fn is_prose(line: &str) -> bool {
    line.split_whitespace().count() >= 3
}

/// Structure recovered from one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAnalysis {
    pub key_changes: KeyChanges,
    pub trend_summary: Option<String>,
    pub risk_assessment: Option<String>,
    pub recommendations: Option<String>,
    /// Recognised sections, risk assessment included, with any content (0..=5).
    pub sections_found: usize,
    /// Key-change lists with at least one bullet item (0..=4).
    pub lists_filled: usize,
    pub has_prose: bool,
    pub confidence: Confidence,
}

/// Confidence tier from extracted structure. Never decreases as structure grows.
///
/// All four key-change lists filled is high; any recognised section with
/// content, bulleted or not, is at least medium.
pub fn confidence_for(lists_filled: usize, sections_found: usize, has_prose: bool) -> Confidence {
    if lists_filled >= 4 {
        Confidence::High
    } else if sections_found > 0 || lists_filled > 0 {
        Confidence::Medium
    } else if has_prose {
        Confidence::Low
    } else {
        Confidence::Unknown
    }
}

pub fn parse_analysis(text: &str) -> ParsedAnalysis {
    let mut current: Option<Section> = None;
    let mut key_changes = KeyChanges::default();
    let mut risk_lines: Vec<String> = Vec::new();
    let mut trend_prose: Vec<String> = Vec::new();
    let mut recommendation_prose: Vec<String> = Vec::new();
    let mut has_prose = false;
    let mut with_content: HashSet<Section> = HashSet::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let bullet = BULLET.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str());

        if let Some((section, inline)) = parse_heading(trimmed, bullet.is_some()) {
            current = Some(section);
            if let Some(item) = inline {
                has_prose |= is_prose(&item);
                with_content.insert(section);
                push_item(section, item, &mut key_changes, &mut risk_lines);
            }
            continue;
        }

        has_prose |= is_prose(trimmed);
        if let Some(section) = current {
            with_content.insert(section);
        }

        match (current, bullet) {
            (Some(section), Some(item)) => {
                let item = clean_item(item);
                if !item.is_empty() {
                    push_item(section, item, &mut key_changes, &mut risk_lines);
                }
            }
            (Some(Section::RiskAssessment), None) => risk_lines.push(clean_item(trimmed)),
            (Some(Section::Trends), None) => trend_prose.push(clean_item(trimmed)),
            (Some(Section::Recommendations), None) => {
                recommendation_prose.push(clean_item(trimmed))
            }
            _ => {}
        }
    }

    let lists_filled = [
        &key_changes.significant_changes,
        &key_changes.trends,
        &key_changes.abnormal_values,
        &key_changes.recommendations,
    ]
    .iter()
    .filter(|items| !items.is_empty())
    .count();

    ParsedAnalysis {
        trend_summary: join_lines(&key_changes.trends).or_else(|| join_lines(&trend_prose)),
        recommendations: join_lines(&key_changes.recommendations)
            .or_else(|| join_lines(&recommendation_prose)),
        risk_assessment: join_lines(&risk_lines),
        confidence: confidence_for(lists_filled, with_content.len(), has_prose),
        key_changes,
        sections_found: with_content.len(),
        lists_filled,
        has_prose,
    }
}

fn join_lines(lines: &[String]) -> Option<String> {
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn push_item(
    section: Section,
    item: String,
    key_changes: &mut KeyChanges,
    risk_lines: &mut Vec<String>,
) {
    match section {
        Section::SignificantChanges => key_changes.significant_changes.push(item),
        Section::Trends => key_changes.trends.push(item),
        Section::AbnormalValues => key_changes.abnormal_values.push(item),
        Section::Recommendations => key_changes.recommendations.push(item),
        Section::RiskAssessment => risk_lines.push(item),
    }
}

/// Record carrying only provenance: refs, counts, period. No analysis yet.
pub fn provenance_record(
    context: &AnalysisContext,
    period: ComparisonPeriod,
    model_identifier: &str,
) -> ComparisonRecord {
    ComparisonRecord {
        id: Uuid::new_v4(),
        patient_id: context.patient_id.clone(),
        report_kind: context.report_kind,
        current_report_ref: context.current_report_ref,
        current_report_date: context.current_report_date,
        historical_reports_count: context.historical_refs.len() as u32,
        historical_reports_refs: context.historical_refs.clone(),
        comparison_period: period,
        narrative: None,
        narrative_type: if context.standalone {
            NarrativeType::FirstTimeAnalysis
        } else {
            NarrativeType::Comparative
        },
        key_changes: KeyChanges::default(),
        trend_summary: None,
        risk_assessment: None,
        recommendations: None,
        model_identifier: model_identifier.to_string(),
        confidence: Confidence::Unknown,
        tokens_used: None,
        failure_kind: None,
        failure_reason: None,
        context_truncated: context.truncated,
        processed_at: Utc::now(),
    }
}

/// Build the record for a successful engine response. Never fails.
///
/// For standalone contexts the history count comes from the context and
/// every key-change list stays empty, whatever the text claims.
pub fn parse(
    raw: &RawResponse,
    context: &AnalysisContext,
    period: ComparisonPeriod,
    model_identifier: &str,
) -> ComparisonRecord {
    let parsed = parse_analysis(&raw.text);
    let model = raw.model.as_deref().unwrap_or(model_identifier);
    let mut record = provenance_record(context, period, model);

    record.narrative = Some(raw.text.trim().to_string());
    record.tokens_used = raw.tokens_used;
    record.confidence = parsed.confidence;
    record.risk_assessment = parsed.risk_assessment;
    record.recommendations = parsed.recommendations;

    if context.standalone {
        record.historical_reports_count = 0;
        record.historical_reports_refs.clear();
        record.trend_summary = Some(FIRST_TIME_TREND_SUMMARY.to_string());
    } else {
        record.key_changes = parsed.key_changes;
        record.trend_summary = parsed.trend_summary;
    }

    tracing::debug!(
        patient_id = %context.patient_id,
        sections_found = parsed.sections_found,
        lists_filled = parsed.lists_filled,
        confidence = %record.confidence,
        standalone = context.standalone,
        "Parsed engine response"
    );
    record
}
