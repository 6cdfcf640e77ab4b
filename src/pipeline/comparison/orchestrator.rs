use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use super::cache::AnalysisCache;
use super::client::HttpReasoningClient;
use super::context::{AnalysisContext, ContextAssembler};
use super::history::{select_history, HistoryQuery, SqliteReportRepository};
use super::invoker::{ReasoningInvoker, RetryPolicy};
use super::parser::{parse, provenance_record};
use super::recorder::SqliteComparisonStore;
use super::traits::{ComparisonStore, ReasoningEngine, ReportRepository};
use super::{ComparisonError, InvocationError};
use crate::config::AppConfig;
use crate::db::Database;
use crate::models::*;

/// Model identifier recorded when analysis was not requested.
pub const SKIPPED_MODEL_IDENTIFIER: &str = "none";

/// Shared cancellation flag set by the caller of a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub model_identifier: String,
    pub request_timeout: Duration,
    pub context_char_budget: usize,
    pub default_period: ComparisonPeriod,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model_identifier: config.model_identifier.clone(),
            request_timeout: config.request_timeout,
            context_char_budget: config.context_char_budget,
            default_period: config.default_comparison_period,
        }
    }
}

/// Runs the comparison stages for one report at a time.
///
/// Shareable across threads: runs for different reports proceed
/// independently, sharing only storage and the engine client.
pub struct ComparisonPipeline {
    repository: Arc<dyn ReportRepository>,
    store: Arc<dyn ComparisonStore>,
    invoker: ReasoningInvoker,
    assembler: ContextAssembler,
    cache: Option<Mutex<AnalysisCache>>,
    settings: PipelineSettings,
}

impl ComparisonPipeline {
    pub fn new(
        repository: Arc<dyn ReportRepository>,
        store: Arc<dyn ComparisonStore>,
        engine: Arc<dyn ReasoningEngine>,
        policy: RetryPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repository,
            store,
            invoker: ReasoningInvoker::new(engine, policy),
            assembler: ContextAssembler::new(settings.context_char_budget),
            cache: None,
            settings,
        }
    }

    pub fn with_cache(mut self, cache: AnalysisCache) -> Self {
        self.cache = Some(Mutex::new(cache));
        self
    }

    /// SQLite storage plus the HTTP engine client, all from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, ComparisonError> {
        config.validate()?;
        let db = Database::open(&config.database_path)?;
        let engine = HttpReasoningClient::from_config(config)?;

        tracing::info!(
            endpoint = %config.reasoning_endpoint,
            model = %config.model_identifier,
            credential = config.credential.label(),
            "Comparison pipeline configured"
        );

        let pipeline = Self::new(
            Arc::new(SqliteReportRepository::new(db.clone())),
            Arc::new(SqliteComparisonStore::new(db)),
            Arc::new(engine),
            RetryPolicy::from_config(config),
            PipelineSettings::from_config(config),
        );
        Ok(match AnalysisCache::from_config(config) {
            Some(cache) => pipeline.with_cache(cache),
            None => pipeline,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Compare `current` against its eligible history and persist the result.
    ///
    /// Returns a record whenever the run reached persistence, degraded or not.
    /// Structured content too large for the context budget yields a degraded
    /// record with `failure_kind = context_overflow`. Storage failures, invalid
    /// input and cancellation before the write are returned as errors, and then
    /// nothing was persisted.
    pub fn run_comparison(
        &self,
        current: &Report,
        period: Option<ComparisonPeriod>,
        include_analysis: bool,
        cancel: &CancellationToken,
    ) -> Result<ComparisonRecord, ComparisonError> {
        current.validate()?;
        let period = period.unwrap_or(self.settings.default_period);

        let span = tracing::info_span!(
            "run_comparison",
            patient_id = %current.patient_id,
            report_id = %current.id,
            report_kind = %current.report_kind(),
            period = %period,
        );
        let _enter = span.enter();

        if cancel.is_cancelled() {
            tracing::warn!("Comparison cancelled before start");
            return Err(ComparisonError::Cancelled);
        }

        let query = HistoryQuery::for_report(current, period);
        let history = select_history(self.repository.as_ref(), &query)?;

        let record = if include_analysis {
            let patient = self
                .repository
                .get_patient_context(&current.patient_id)
                .map_err(ComparisonError::StorageUnavailable)?;
            match self.assembler.assemble(current, &history, patient.as_ref()) {
                Ok(context) => self.analyse(&context, period),
                Err(error @ ComparisonError::ContextOverflow { .. }) => {
                    overflow_record(current, &history, period, &self.settings.model_identifier, &error)
                }
                Err(error) => return Err(error),
            }
        } else {
            base_record(current, &history, period, SKIPPED_MODEL_IDENTIFIER, NarrativeType::Skipped)
        };

        if cancel.is_cancelled() {
            tracing::warn!(record_id = %record.id, "Comparison cancelled, result discarded");
            return Err(ComparisonError::Cancelled);
        }

        self.store.record(&record)?;
        tracing::info!(
            record_id = %record.id,
            historical_reports = record.historical_reports_count,
            confidence = %record.confidence,
            "Comparison complete"
        );
        Ok(record)
    }

    /// Invoke the engine (or the cache) and turn the outcome into a record.
    /// Engine failures become a degraded record, never an error.
    fn analyse(&self, context: &AnalysisContext, period: ComparisonPeriod) -> ComparisonRecord {
        let model = self.settings.model_identifier.as_str();
        let cache_key = self.cache.as_ref().map(|_| AnalysisCache::key(model, context));

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = lock(cache).get(key) {
                tracing::debug!("Analysis cache hit");
                let mut record = parse(&hit, context, period, model);
                record.tokens_used = None;
                return record;
            }
        }

        match self.invoker.invoke(context, self.settings.request_timeout) {
            Ok(invocation) => {
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    lock(cache).insert(key, invocation.response.clone());
                }
                parse(&invocation.response, context, period, model)
            }
            Err(error) => degraded_record(context, period, model, &error),
        }
    }

    pub fn get_history_summary(
        &self,
        patient_id: &str,
        report_kind: ReportKind,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ComparisonRecord>, ComparisonError> {
        Ok(self.store.fetch(patient_id, Some(report_kind), limit, offset)?)
    }

    pub fn count_history(
        &self,
        patient_id: &str,
        report_kind: Option<ReportKind>,
    ) -> Result<u64, ComparisonError> {
        Ok(self.store.count(patient_id, report_kind)?)
    }

    /// Cross-kind overview, most-recent-first.
    pub fn get_patient_summary(
        &self,
        patient_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<PatientHistorySummary, ComparisonError> {
        let total_records = self.store.count(patient_id, None)?;
        let records = self
            .store
            .fetch(patient_id, None, limit, offset)?
            .iter()
            .map(ComparisonRecord::summary)
            .collect();
        Ok(PatientHistorySummary {
            patient_id: patient_id.to_string(),
            total_records,
            records,
        })
    }
}

fn lock(cache: &Mutex<AnalysisCache>) -> MutexGuard<'_, AnalysisCache> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn degraded_record(
    context: &AnalysisContext,
    period: ComparisonPeriod,
    model: &str,
    error: &InvocationError,
) -> ComparisonRecord {
    tracing::warn!(
        failure_kind = %error.failure_kind(),
        attempts = error.attempts(),
        error = %error,
        "Reasoning failed, recording degraded comparison"
    );
    let mut record = provenance_record(context, period, model);
    record.narrative_type = NarrativeType::Unavailable;
    record.confidence = Confidence::Unknown;
    record.failure_kind = Some(error.failure_kind());
    record.failure_reason = Some(error.to_string());
    record
}

/// Context could not be built, so the engine was never called.
fn overflow_record(
    current: &Report,
    history: &[Report],
    period: ComparisonPeriod,
    model: &str,
    error: &ComparisonError,
) -> ComparisonRecord {
    tracing::warn!(error = %error, "Context over budget, recording degraded comparison");
    let mut record = base_record(current, history, period, model, NarrativeType::Unavailable);
    record.failure_kind = Some(FailureKind::ContextOverflow);
    record.failure_reason = Some(error.to_string());
    record
}

/// Record without analysis, built straight from the reports.
fn base_record(
    current: &Report,
    history: &[Report],
    period: ComparisonPeriod,
    model: &str,
    narrative_type: NarrativeType,
) -> ComparisonRecord {
    let refs: Vec<Uuid> = history.iter().map(|r| r.id).collect();
    ComparisonRecord {
        id: Uuid::new_v4(),
        patient_id: current.patient_id.clone(),
        report_kind: current.report_kind(),
        current_report_ref: current.id,
        current_report_date: current.report_date,
        historical_reports_count: refs.len() as u32,
        historical_reports_refs: refs,
        comparison_period: period,
        narrative: None,
        narrative_type,
        key_changes: KeyChanges::default(),
        trend_summary: None,
        risk_assessment: None,
        recommendations: None,
        model_identifier: model.to_string(),
        confidence: Confidence::Unknown,
        tokens_used: None,
        failure_kind: None,
        failure_reason: None,
        context_truncated: false,
        processed_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::comparison::traits::RawResponse;
    use crate::pipeline::comparison::ReasoningFailure;
    use chrono::{NaiveDate, Utc};
    use std::sync::atomic::AtomicUsize;

    const FULL_RESPONSE: &str = "\
## Significant Changes
- Hemoglobin fell from 12.8 to 10.9 g/dL
## Trends
- Progressive decline in hemoglobin
## Abnormal Values
- Hemoglobin 10.9 g/dL (low)
## Risk Assessment
- Moderate: symptomatic anemia possible
## Recommendations
- Iron studies and reticulocyte count
";

    /// Replies with a fixed result, counting calls and keeping the last prompt.
    struct ScriptedEngine {
        reply: Result<RawResponse, ReasoningFailure>,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<String>>,
        cancel_on_call: Option<CancellationToken>,
    }

    impl ScriptedEngine {
        fn ok(text: &str) -> Arc<Self> {
            Self::build(Ok(RawResponse {
                text: text.into(),
                model: None,
                tokens_used: Some(250),
            }))
        }

        fn failing(failure: ReasoningFailure) -> Arc<Self> {
            Self::build(Err(failure))
        }

        fn build(reply: Result<RawResponse, ReasoningFailure>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
                cancel_on_call: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ReasoningEngine for ScriptedEngine {
        fn complete(
            &self,
            context: &AnalysisContext,
            _timeout: Duration,
        ) -> Result<RawResponse, ReasoningFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = Some(context.user_prompt.clone());
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }
            self.reply.clone()
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db_path: std::path::PathBuf,
        reports: SqliteReportRepository,
        pipeline: ComparisonPipeline,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            model_identifier: "llama3.1".into(),
            request_timeout: Duration::from_secs(5),
            context_char_budget: 12_000,
            default_period: ComparisonPeriod::SixMonths,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            total_budget: None,
            ..RetryPolicy::default()
        }
    }

    fn harness(engine: Arc<ScriptedEngine>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("medtrend.db");
        let db = Database::open(&db_path).unwrap();
        let reports = SqliteReportRepository::new(db.clone());
        let pipeline = ComparisonPipeline::new(
            Arc::new(reports.clone()),
            Arc::new(SqliteComparisonStore::new(db)),
            engine,
            fast_policy(),
            settings(),
        );
        Harness {
            _dir: dir,
            db_path,
            reports,
            pipeline,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lab(patient: &str, report_date: NaiveDate, hemoglobin: &str) -> Report {
        Report::new(
            patient,
            report_date,
            ReportPayload::RoutineLab(RoutineLabPayload {
                items: vec![LabItem {
                    name: "Hemoglobin".into(),
                    value: hemoglobin.into(),
                    unit: Some("g/dL".into()),
                    reference_range: Some("12.0-16.0".into()),
                    abnormal_flag: None,
                }],
            }),
        )
    }

    fn lab_panel(patient: &str, report_date: NaiveDate, analytes: usize) -> Report {
        let items = (0..analytes)
            .map(|i| LabItem {
                name: format!("Analyte {i}"),
                value: "1.0".into(),
                unit: Some("mg/dL".into()),
                reference_range: Some("0.5-1.5".into()),
                abnormal_flag: None,
            })
            .collect();
        Report::new(
            patient,
            report_date,
            ReportPayload::RoutineLab(RoutineLabPayload { items }),
        )
    }

    fn run(h: &Harness, report: &Report, period: ComparisonPeriod) -> ComparisonRecord {
        h.pipeline
            .run_comparison(report, Some(period), true, &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn scenario_a_no_history_is_first_time_analysis() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        let current = lab("P001", date(2024, 6, 30), "10.9");
        h.reports.insert_report(&current).unwrap();

        let record = run(&h, &current, ComparisonPeriod::SixMonths);
        assert_eq!(record.historical_reports_count, 0);
        assert_eq!(record.narrative_type, NarrativeType::FirstTimeAnalysis);
        assert!(record.key_changes.is_empty());
        assert!(record.narrative.is_some());
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn scenario_b_prior_outside_window_is_excluded() {
        let h = harness(ScriptedEngine::ok(FULL_RESPONSE));
        let prior = lab("P001", date(2024, 5, 21), "12.8");
        let current = lab("P001", date(2024, 6, 30), "10.9");
        h.reports.insert_report(&prior).unwrap();
        h.reports.insert_report(&current).unwrap();

        let record = run(&h, &current, ComparisonPeriod::OneMonth);
        assert_eq!(record.historical_reports_count, 0);
        assert_eq!(record.narrative_type, NarrativeType::FirstTimeAnalysis);
        assert!(record.key_changes.is_empty());
    }

    #[test]
    fn scenario_c_prior_inside_window_is_compared() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        let prior = lab("P001", date(2024, 5, 21), "12.8");
        let current = lab("P001", date(2024, 6, 30), "10.9");
        h.reports.insert_report(&prior).unwrap();
        h.reports.insert_report(&current).unwrap();

        let record = run(&h, &current, ComparisonPeriod::ThreeMonths);
        assert_eq!(record.historical_reports_count, 1);
        assert_eq!(record.historical_reports_refs, vec![prior.id]);
        assert_eq!(record.narrative_type, NarrativeType::Comparative);
        let prompt = engine.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("<PRIOR REPORT>"));
        assert!(prompt.contains("- Hemoglobin: 12.8 g/dL"));
    }

    #[test]
    fn scenario_d_timeouts_produce_degraded_record() {
        let engine = ScriptedEngine::failing(ReasoningFailure::Timeout("no response".into()));
        let h = harness(engine.clone());
        let current = lab("P001", date(2024, 6, 30), "10.9");
        h.reports.insert_report(&current).unwrap();

        let record = run(&h, &current, ComparisonPeriod::SixMonths);
        assert!(record.is_degraded());
        assert!(record.narrative.is_none());
        assert_eq!(record.confidence, Confidence::Unknown);
        assert_eq!(record.narrative_type, NarrativeType::Unavailable);
        assert_eq!(record.failure_kind, Some(FailureKind::ReasoningUnavailable));
        assert!(record.failure_reason.as_deref().unwrap().contains("timed out"));
        assert_eq!(engine.calls(), 3);

        let stored = h
            .pipeline
            .get_history_summary("P001", ReportKind::RoutineLab, 10, 0)
            .unwrap();
        assert_eq!(stored, vec![record]);
    }

    #[test]
    fn scenario_e_full_response_gives_high_confidence() {
        let h = harness(ScriptedEngine::ok(FULL_RESPONSE));
        let prior = lab("P001", date(2024, 5, 1), "12.8");
        let current = lab("P001", date(2024, 6, 1), "10.9");
        h.reports.insert_report(&prior).unwrap();
        h.reports.insert_report(&current).unwrap();

        let record = run(&h, &current, ComparisonPeriod::SixMonths);
        assert_eq!(record.confidence, Confidence::High);
        assert!(!record.key_changes.significant_changes.is_empty());
        assert!(!record.key_changes.trends.is_empty());
        assert!(!record.key_changes.abnormal_values.is_empty());
        assert!(!record.key_changes.recommendations.is_empty());
        assert_eq!(record.tokens_used, Some(250));
    }

    #[test]
    fn rerun_appends_a_second_record() {
        let h = harness(ScriptedEngine::ok(FULL_RESPONSE));
        let prior = lab("P001", date(2024, 5, 1), "12.8");
        let current = lab("P001", date(2024, 6, 1), "10.9");
        h.reports.insert_report(&prior).unwrap();
        h.reports.insert_report(&current).unwrap();

        let first = run(&h, &current, ComparisonPeriod::SixMonths);
        std::thread::sleep(Duration::from_millis(5));
        let second = run(&h, &current, ComparisonPeriod::SixMonths);

        assert_ne!(first.id, second.id);
        assert_ne!(first.processed_at, second.processed_at);
        let stored = h
            .pipeline
            .get_history_summary("P001", ReportKind::RoutineLab, 10, 0)
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, second.id);
        assert_eq!(stored[1], first);
    }

    #[test]
    fn rejected_engine_is_not_retried() {
        let engine = ScriptedEngine::failing(ReasoningFailure::Unauthorized { status: 401 });
        let h = harness(engine.clone());
        let current = lab("P001", date(2024, 6, 30), "10.9");

        let record = run(&h, &current, ComparisonPeriod::SixMonths);
        assert_eq!(engine.calls(), 1);
        assert_eq!(record.failure_kind, Some(FailureKind::ReasoningRejected));
        assert!(record.narrative.is_none());
        assert_eq!(h.pipeline.count_history("P001", None).unwrap(), 1);
    }

    #[test]
    fn skipped_analysis_records_provenance_only() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        let prior = lab("P001", date(2024, 5, 1), "12.8");
        let current = lab("P001", date(2024, 6, 1), "10.9");
        h.reports.insert_report(&prior).unwrap();
        h.reports.insert_report(&current).unwrap();

        let record = h
            .pipeline
            .run_comparison(&current, None, false, &CancellationToken::new())
            .unwrap();
        assert_eq!(engine.calls(), 0);
        assert!(record.narrative.is_none());
        assert_eq!(record.narrative_type, NarrativeType::Skipped);
        assert_eq!(record.model_identifier, SKIPPED_MODEL_IDENTIFIER);
        assert_eq!(record.historical_reports_refs, vec![prior.id]);
        assert_eq!(record.comparison_period, ComparisonPeriod::SixMonths);
    }

    #[test]
    fn oversized_panels_record_context_overflow() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        let prior = lab_panel("P001", date(2024, 5, 1), 200);
        let current = lab_panel("P001", date(2024, 6, 1), 200);
        h.reports.insert_report(&prior).unwrap();
        h.reports.insert_report(&current).unwrap();

        let record = run(&h, &current, ComparisonPeriod::SixMonths);
        assert_eq!(engine.calls(), 0);
        assert_eq!(record.narrative_type, NarrativeType::Unavailable);
        assert_eq!(record.failure_kind, Some(FailureKind::ContextOverflow));
        assert!(record.failure_reason.as_deref().unwrap().contains("12000"));
        assert!(record.narrative.is_none());
        assert_eq!(record.confidence, Confidence::Unknown);
        assert_eq!(record.model_identifier, "llama3.1");
        assert_eq!(record.historical_reports_refs, vec![prior.id]);
        assert_eq!(record.historical_reports_count, 1);

        let stored = h
            .pipeline
            .get_history_summary("P001", ReportKind::RoutineLab, 10, 0)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].failure_kind, Some(FailureKind::ContextOverflow));
    }

    #[test]
    fn cancelled_before_start_persists_nothing() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        let current = lab("P001", date(2024, 6, 1), "10.9");
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .pipeline
            .run_comparison(&current, None, true, &token)
            .unwrap_err();
        assert!(matches!(err, ComparisonError::Cancelled));
        assert_eq!(engine.calls(), 0);
        assert_eq!(h.pipeline.count_history("P001", None).unwrap(), 0);
    }

    #[test]
    fn cancelled_during_invocation_discards_result() {
        let token = CancellationToken::new();
        let engine = Arc::new(ScriptedEngine {
            reply: Ok(RawResponse {
                text: FULL_RESPONSE.into(),
                model: None,
                tokens_used: None,
            }),
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
            cancel_on_call: Some(token.clone()),
        });
        let h = harness(engine.clone());
        let current = lab("P001", date(2024, 6, 1), "10.9");

        let err = h
            .pipeline
            .run_comparison(&current, None, true, &token)
            .unwrap_err();
        assert!(matches!(err, ComparisonError::Cancelled));
        assert_eq!(engine.calls(), 1);
        assert_eq!(h.pipeline.count_history("P001", None).unwrap(), 0);
    }

    #[test]
    fn storage_outage_is_fatal() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        std::fs::remove_file(&h.db_path).unwrap();
        let current = lab("P001", date(2024, 6, 1), "10.9");

        let err = h
            .pipeline
            .run_comparison(&current, None, true, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ComparisonError::StorageUnavailable(_)));
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn invalid_report_is_rejected_before_pipeline() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        let current = lab("", date(2024, 6, 1), "10.9");

        let err = h
            .pipeline
            .run_comparison(&current, None, true, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ComparisonError::Validation(_)));
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn patient_context_reaches_the_engine() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        h.reports
            .upsert_patient_context(&PatientContext {
                patient_id: "P001".into(),
                allergy_history: Some("Sulfonamides".into()),
                discharge_summary: None,
                lab_narrative: None,
                updated_at: Utc::now(),
            })
            .unwrap();
        let current = lab("P001", date(2024, 6, 1), "10.9");

        run(&h, &current, ComparisonPeriod::SixMonths);
        let prompt = engine.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Allergy history: Sulfonamides"));
    }

    #[test]
    fn cache_hit_skips_engine_but_still_records() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let mut h = harness(engine.clone());
        h.pipeline = ComparisonPipeline::new(
            Arc::new(h.reports.clone()),
            Arc::new(SqliteComparisonStore::new(Database::open(&h.db_path).unwrap())),
            engine.clone(),
            fast_policy(),
            settings(),
        )
        .with_cache(AnalysisCache::new(10, Duration::from_secs(60)));
        let current = lab("P001", date(2024, 6, 1), "10.9");

        let first = run(&h, &current, ComparisonPeriod::SixMonths);
        let second = run(&h, &current, ComparisonPeriod::SixMonths);
        assert_eq!(engine.calls(), 1);
        assert_eq!(first.narrative, second.narrative);
        assert_ne!(first.id, second.id);
        assert_eq!(first.tokens_used, Some(250));
        assert_eq!(second.tokens_used, None);
        assert_eq!(h.pipeline.count_history("P001", None).unwrap(), 2);
    }

    #[test]
    fn degraded_responses_are_not_cached() {
        let engine = ScriptedEngine::failing(ReasoningFailure::RateLimited);
        let mut h = harness(engine.clone());
        h.pipeline = ComparisonPipeline::new(
            Arc::new(h.reports.clone()),
            Arc::new(SqliteComparisonStore::new(Database::open(&h.db_path).unwrap())),
            engine.clone(),
            fast_policy(),
            settings(),
        )
        .with_cache(AnalysisCache::new(10, Duration::from_secs(60)));
        let current = lab("P001", date(2024, 6, 1), "10.9");

        run(&h, &current, ComparisonPeriod::SixMonths);
        run(&h, &current, ComparisonPeriod::SixMonths);
        assert_eq!(engine.calls(), 2);
    }

    #[test]
    fn concurrent_runs_for_different_patients() {
        let engine = ScriptedEngine::ok(FULL_RESPONSE);
        let h = harness(engine.clone());
        let reports: Vec<Report> = (0..6)
            .map(|i| lab(&format!("P{i:03}"), date(2024, 6, 1), "11.0"))
            .collect();
        for r in &reports {
            h.reports.insert_report(r).unwrap();
        }

        std::thread::scope(|s| {
            for report in &reports {
                let pipeline = &h.pipeline;
                s.spawn(move || {
                    pipeline
                        .run_comparison(report, None, true, &CancellationToken::new())
                        .unwrap();
                });
            }
        });

        assert_eq!(engine.calls(), 6);
        for report in &reports {
            assert_eq!(h.pipeline.count_history(&report.patient_id, None).unwrap(), 1);
        }
    }

    #[test]
    fn patient_summary_spans_kinds() {
        let h = harness(ScriptedEngine::ok(FULL_RESPONSE));
        let lab_report = lab("P001", date(2024, 6, 1), "10.9");
        let exam_report = Report::new(
            "P001",
            date(2024, 6, 2),
            ReportPayload::Examination(ExaminationPayload {
                impression: Some("Mild cardiomegaly".into()),
                ..Default::default()
            }),
        );
        run(&h, &lab_report, ComparisonPeriod::All);
        std::thread::sleep(Duration::from_millis(5));
        run(&h, &exam_report, ComparisonPeriod::All);

        let summary = h.pipeline.get_patient_summary("P001", 10, 0).unwrap();
        assert_eq!(summary.total_records, 2);
        assert_eq!(summary.records[0].report_kind, ReportKind::Examination);
        assert_eq!(summary.records[1].report_kind, ReportKind::RoutineLab);
        let findings = summary.records[0].key_findings.as_deref().unwrap();
        assert!(findings.chars().count() <= KEY_FINDINGS_CHARS);
        assert!(findings.starts_with("## Significant Changes"));
    }

    #[test]
    fn history_summary_pages() {
        let h = harness(ScriptedEngine::ok(FULL_RESPONSE));
        let current = lab("P001", date(2024, 6, 1), "10.9");
        for _ in 0..3 {
            run(&h, &current, ComparisonPeriod::SixMonths);
        }
        let page = h
            .pipeline
            .get_history_summary("P001", ReportKind::RoutineLab, 2, 2)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(
            h.pipeline.count_history("P001", Some(ReportKind::RoutineLab)).unwrap(),
            3
        );
    }

    #[test]
    fn pipeline_from_config_opens_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            database_path: dir.path().join("data").join("medtrend.db"),
            ..AppConfig::default()
        };
        let pipeline = ComparisonPipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.settings().model_identifier, config.model_identifier);
        assert!(config.database_path.exists());
        assert_eq!(pipeline.count_history("P001", None).unwrap(), 0);
    }
}
