use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::category::panic_message;
use super::{CategoryProcessor, Engines, FusionPolicy, StageContext};
use crate::error::AnalysisError;
use crate::llm::{LlmBackend, LlmValidator, ValidatorConfig};
use crate::matchers::{Embedder, ExemplarIndex, RuleMatcher, SemanticConfig, SemanticMatcher};
use crate::models::{
    AnalysisReport, CallInput, CallMetadata, CategoryResult, DetectionCatalog, ProcessMetrics,
    ReportSummary, Transcript,
};
use crate::stats::PipelineStats;

/// Configuration for the whole pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Points analyzed concurrently inside one category
    pub max_parallel_points: usize,
    /// Deadline for one call from parse to validated report
    pub pipeline_timeout: Duration,
    pub fusion: FusionPolicy,
    pub validator: ValidatorConfig,
    pub semantic: SemanticConfig,
    /// Calls analyzed concurrently in batch mode
    pub max_concurrent_calls: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_points: 4,
            pipeline_timeout: Duration::from_secs(300),
            fusion: FusionPolicy::default(),
            validator: ValidatorConfig::default(),
            semantic: SemanticConfig::default(),
            max_concurrent_calls: 3,
        }
    }
}

/// Where a call is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Init,
    Preprocessed,
    /// Running the category at this catalog position
    Category(usize),
    Aggregated,
}

/// Runs calls through preprocessing, every category in order, and aggregation
pub struct Workflow {
    catalog: Arc<DetectionCatalog>,
    engines: Arc<Engines>,
    processor: CategoryProcessor,
    config: PipelineConfig,
}

impl Workflow {
    pub fn new(catalog: Arc<DetectionCatalog>, engines: Arc<Engines>, config: PipelineConfig) -> Self {
        let processor = CategoryProcessor::new(
            Arc::clone(&engines),
            config.fusion.clone(),
            config.max_parallel_points,
        );
        Self {
            catalog,
            engines,
            processor,
            config,
        }
    }

    /// Assemble the engines for a catalog
    ///
    /// A missing backend disables that engine; the rule matcher always runs.
    pub async fn build(
        catalog: Arc<DetectionCatalog>,
        llm: Option<Arc<dyn LlmBackend>>,
        embedder: Option<Arc<dyn Embedder>>,
        config: PipelineConfig,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let rules = RuleMatcher::from_catalog(&catalog);

        let semantic = match embedder {
            Some(embedder) => {
                let index =
                    ExemplarIndex::build(&catalog, embedder.as_ref(), config.semantic.batch_size)
                        .await;
                SemanticMatcher::new(
                    embedder,
                    Arc::new(index),
                    config.semantic.clone(),
                    Arc::clone(&stats),
                )
            }
            None => SemanticMatcher::disabled(Arc::clone(&stats)),
        };

        let validator = match llm {
            Some(backend) => {
                LlmValidator::new(backend, config.validator.clone(), Arc::clone(&stats))
            }
            None => LlmValidator::disabled(config.validator.clone(), Arc::clone(&stats)),
        };

        info!(
            "Pipeline ready: {} categories, {} points (semantic: {}, llm: {})",
            catalog.categories.len(),
            catalog.point_count(),
            semantic.is_enabled(),
            validator.is_enabled()
        );

        let engines = Arc::new(Engines::new(rules, semantic, validator, stats));
        Self::new(catalog, engines, config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &DetectionCatalog {
        &self.catalog
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.engines.stats
    }

    /// Analyze one call within the pipeline timeout
    pub async fn execute(&self, call: CallInput) -> Result<AnalysisReport, AnalysisError> {
        let call_id = call.call_id.clone();
        let timeout = self.config.pipeline_timeout;

        let result = match tokio::time::timeout(timeout, self.run(call)).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::PipelineTimeout(timeout)),
        };

        match &result {
            Ok(report) => info!(
                "Call {} analyzed: {}/{} points hit",
                call_id, report.summary.hit_count, report.summary.point_count
            ),
            Err(e) => warn!("Call {} failed: {}", call_id, e),
        }
        self.engines.stats.record_call(result.is_ok());
        result
    }

    async fn run(&self, call: CallInput) -> Result<AnalysisReport, AnalysisError> {
        let mut state = WorkflowState::Init;
        let mut timings = BTreeMap::new();
        let CallInput {
            call_id,
            customer_id,
            sales_id,
            call_time,
            utterances,
        } = call;

        let started = Instant::now();
        let transcript = Transcript::new(utterances)?;
        let metrics = ProcessMetrics::from_transcript(&transcript);
        self.engines.semantic.prefetch(&transcript).await;
        timings.insert("preprocess".to_string(), elapsed_ms(started));
        advance(&call_id, &mut state, WorkflowState::Preprocessed);

        let mut categories: Vec<CategoryResult> = Vec::with_capacity(self.catalog.categories.len());
        for (position, category) in self.catalog.categories.iter().enumerate() {
            advance(&call_id, &mut state, WorkflowState::Category(position));
            let started = Instant::now();

            let context = StageContext {
                prior: &categories,
                metrics: &metrics,
            };
            let outcome = AssertUnwindSafe(self.processor.process(category, &transcript, &context))
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!("Call {}: category {} failed: {}", call_id, category.name, e);
                    self.engines.stats.record_category_failure();
                    CategoryResult::failed(category, e.to_string())
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!("Call {}: category {} panicked: {}", call_id, category.name, message);
                    self.engines.stats.record_category_failure();
                    CategoryResult::failed(category, format!("panicked: {}", message))
                }
            };

            timings.insert(format!("category:{}", category.name), elapsed_ms(started));
            categories.push(result);
        }

        advance(&call_id, &mut state, WorkflowState::Aggregated);
        let summary = ReportSummary::from_categories(&categories);
        let report = AnalysisReport {
            call_id,
            metadata: CallMetadata {
                customer_id,
                sales_id,
                call_time,
                analyzed_at: Utc::now(),
            },
            process_metrics: metrics,
            categories,
            summary,
            stage_timings_ms: timings,
        };

        report.validate(&transcript)?;
        Ok(report)
    }
}

fn advance(call_id: &str, state: &mut WorkflowState, next: WorkflowState) {
    debug!("Call {}: {:?} -> {:?}", call_id, state, next);
    *state = next;
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockBackend, Verdict};
    use crate::matchers::MockEmbedder;
    use crate::models::{EvidenceSource, Speaker, Utterance};

    fn utterances() -> Vec<Utterance> {
        vec![
            Utterance::new(0, Speaker::Agent, "您好，我是益盟的投资顾问").with_timestamp(0, 4_000),
            Utterance::new(1, Speaker::Customer, "嗯，你说").with_timestamp(4_000, 6_000),
            Utterance::new(2, Speaker::Agent, "耽误您两分钟时间").with_timestamp(6_000, 9_000),
            Utterance::new(3, Speaker::Agent, "我们是腾讯投资的上市公司")
                .with_timestamp(9_000, 13_000),
            Utterance::new(4, Speaker::Customer, "哦这样啊").with_timestamp(13_000, 15_000),
        ]
    }

    fn catalog() -> Arc<DetectionCatalog> {
        Arc::new(DetectionCatalog::builtin().unwrap())
    }

    async fn rule_only() -> Workflow {
        Workflow::build(catalog(), None, None, PipelineConfig::default()).await
    }

    #[tokio::test]
    async fn test_execute_produces_valid_report() {
        let workflow = rule_only().await;

        let report = workflow
            .execute(CallInput::new("call-1", utterances()))
            .await
            .unwrap();

        assert_eq!(report.call_id, "call-1");
        let names: Vec<&str> = report.categories.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(
            names,
            vec!["icebreak", "deduction", "pain_point", "customer_probing"]
        );

        let background = report.result("icebreak", "company_background").unwrap();
        assert!(background.hit);
        assert_eq!(background.final_confidence, 0.5);
        assert_eq!(background.evidence_source, EvidenceSource::Rule);
        assert_eq!(background.evidence[0].utterance_index, 3);
        assert_eq!(background.evidence[0].quote, "我们是腾讯投资的上市公司");

        assert_eq!(report.summary.point_count, workflow.catalog().point_count());
        assert!(report.stage_timings_ms.contains_key("preprocess"));
        assert!(report.stage_timings_ms.contains_key("category:deduction"));
        assert_eq!(report.process_metrics.utterance_count, 5);
        assert_eq!(workflow.stats().snapshot().calls_succeeded, 1);
    }

    #[tokio::test]
    async fn test_keyword_match_confirmed_by_model_hits() {
        let mut catalog = DetectionCatalog::builtin().unwrap();
        catalog.categories.retain(|c| c.name == "icebreak");
        catalog.categories[0].points.retain(|p| p.id == "free_teach");
        let backend = Arc::new(MockBackend::replying(Verdict::yes("这次讲解是免费的", 0.9)));
        let workflow = Workflow::build(
            Arc::new(catalog),
            Some(backend.clone() as Arc<dyn LlmBackend>),
            None,
            PipelineConfig::default(),
        )
        .await;
        let call = CallInput::new(
            "keyword-only",
            vec![
                Utterance::new(0, Speaker::Agent, "这次讲解是免费的"),
                Utterance::new(1, Speaker::Customer, "好的"),
            ],
        );

        let report = workflow.execute(call).await.unwrap();

        let free_teach = report.result("icebreak", "free_teach").unwrap();
        assert_eq!(free_teach.signals.rule.confidence(), 0.8);
        assert_eq!(backend.calls(), 1);
        assert!(free_teach.signals.llm.is_present());
        assert!((free_teach.final_confidence - 0.67).abs() < 1e-9);
        assert!(free_teach.hit);
        assert_eq!(free_teach.evidence_source, EvidenceSource::Rule);
    }

    #[tokio::test]
    async fn test_empty_call_is_parse_error() {
        let workflow = rule_only().await;

        let err = workflow
            .execute(CallInput::new("empty", vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::Parse(_)));
        assert_eq!(workflow.stats().snapshot().calls_failed, 1);
    }

    #[tokio::test]
    async fn test_unavailable_embedder_degrades_quietly() {
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::unavailable());
        let workflow =
            Workflow::build(catalog(), None, Some(embedder), PipelineConfig::default()).await;

        let report = workflow
            .execute(CallInput::new("call-2", utterances()))
            .await
            .unwrap();

        let background = report.result("icebreak", "company_background").unwrap();
        assert!(background.hit);
        assert!(!background.signals.vector.is_present());
        assert!(background.degradations.iter().any(|d| d.source == "vector"));
    }

    #[tokio::test]
    async fn test_placeholder_llm_answer_never_hits() {
        let backend: Arc<dyn LlmBackend> =
            Arc::new(MockBackend::replying(Verdict::yes("无", 0.95)));
        let workflow =
            Workflow::build(catalog(), Some(backend), None, PipelineConfig::default()).await;

        let report = workflow
            .execute(CallInput::new("call-3", utterances()))
            .await
            .unwrap();

        let free_teach = report.result("icebreak", "free_teach").unwrap();
        assert!(!free_teach.hit);
        assert!(!free_teach.signals.llm.is_present());
        assert_eq!(free_teach.evidence_source, EvidenceSource::None);
        assert!(workflow.stats().snapshot().llm_integrity_violations > 0);
    }

    #[tokio::test]
    async fn test_invalid_category_recorded_as_failed() {
        let mut catalog = DetectionCatalog::builtin().unwrap();
        let duplicate = catalog.categories[0].points[0].clone();
        catalog.categories[0].points.push(duplicate);
        let workflow =
            Workflow::build(Arc::new(catalog), None, None, PipelineConfig::default()).await;

        let report = workflow
            .execute(CallInput::new("call-4", utterances()))
            .await
            .unwrap();

        let icebreak = report.category("icebreak").unwrap();
        assert!(icebreak.failure.is_some());
        assert!(icebreak.results.values().all(|r| !r.hit));
        assert!(report.summary.categories[0].failed);
        assert!(report.category("deduction").unwrap().failure.is_none());
        assert_eq!(workflow.stats().snapshot().categories_failed, 1);
    }

    #[tokio::test]
    async fn test_pipeline_timeout() {
        let backend: Arc<dyn LlmBackend> = Arc::new(
            MockBackend::replying(Verdict::no()).with_delay(Duration::from_millis(200)),
        );
        let config = PipelineConfig {
            pipeline_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let workflow = Workflow::build(catalog(), Some(backend), None, config).await;

        let err = workflow
            .execute(CallInput::new("slow", utterances()))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::PipelineTimeout(_)));
    }
}
