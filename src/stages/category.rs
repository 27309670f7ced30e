use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt, stream};
use tracing::{debug, info, warn};

use super::{FusionPolicy, fuse};
use crate::error::AnalysisError;
use crate::llm::LlmValidator;
use crate::matchers::{RuleMatcher, SemanticMatcher};
use crate::models::{
    CategoryConfig, CategoryResult, Degradation, DetectionPointConfig, DetectionResult, Engine,
    ProcessMetrics, Transcript,
};
use crate::stats::PipelineStats;

/// The three evidence engines plus shared counters
///
/// Built once per process and shared by every call.
pub struct Engines {
    pub rules: RuleMatcher,
    pub semantic: SemanticMatcher,
    pub validator: LlmValidator,
    pub stats: Arc<PipelineStats>,
}

impl Engines {
    pub fn new(
        rules: RuleMatcher,
        semantic: SemanticMatcher,
        validator: LlmValidator,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            rules,
            semantic,
            validator,
            stats,
        }
    }
}

/// Read-only view a category stage gets of the work before it
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub prior: &'a [CategoryResult],
    pub metrics: &'a ProcessMetrics,
}

impl StageContext<'_> {
    /// Plain-text digest of earlier findings for LLM prompts
    pub fn findings_summary(&self) -> String {
        let mut summary = format!(
            "Call: {} utterances, {:.1} min, {} speaker changes\n",
            self.metrics.utterance_count, self.metrics.duration_min, self.metrics.interaction_rounds
        );

        for category in self.prior {
            if category.failure.is_some() {
                summary.push_str(&format!("- {}: not analyzed\n", category.category));
                continue;
            }
            let hits: Vec<&str> = category.hits().map(|r| r.point_id.as_str()).collect();
            let misses: Vec<&str> = category
                .results
                .values()
                .filter(|r| !r.hit)
                .map(|r| r.point_id.as_str())
                .collect();
            summary.push_str(&format!(
                "- {}: present [{}]; absent [{}]\n",
                category.category,
                hits.join(", "),
                misses.join(", ")
            ));
        }

        summary.trim_end().to_string()
    }
}

/// Runs every detection point of one category with bounded parallelism
pub struct CategoryProcessor {
    engines: Arc<Engines>,
    fusion: FusionPolicy,
    max_parallel_points: usize,
}

impl CategoryProcessor {
    pub fn new(engines: Arc<Engines>, fusion: FusionPolicy, max_parallel_points: usize) -> Self {
        Self {
            engines,
            fusion,
            max_parallel_points: max_parallel_points.max(1),
        }
    }

    /// Analyze a category; point failures are absorbed as default results
    pub async fn process(
        &self,
        category: &CategoryConfig,
        transcript: &Transcript,
        context: &StageContext<'_>,
    ) -> Result<CategoryResult, AnalysisError> {
        category.validate()?;

        let findings = if category.include_prior_findings && !context.prior.is_empty() {
            Some(context.findings_summary())
        } else {
            None
        };
        let findings = findings.as_deref();

        info!(
            "Processing category {} ({} points)",
            category.name,
            category.points.len()
        );

        let outcomes: Vec<_> = stream::iter(category.points.iter())
            .map(|point| {
                AssertUnwindSafe(self.process_point(point, transcript, findings))
                    .catch_unwind()
                    .map(move |outcome| (point, outcome))
            })
            .buffer_unordered(self.max_parallel_points)
            .collect()
            .await;

        let mut result = CategoryResult::new(&category.name);
        for (point, outcome) in outcomes {
            let detection = match outcome {
                Ok(Ok(detection)) => detection,
                Ok(Err(e)) => {
                    warn!("Detection point {} failed: {}", point.key(), e);
                    DetectionResult::degraded(point, e.to_string())
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!("Detection point {} panicked: {}", point.key(), message);
                    DetectionResult::degraded(point, format!("panicked: {}", message))
                }
            };

            self.engines
                .stats
                .record_point(detection.final_confidence, !detection.degradations.is_empty());
            result.results.insert(point.id.clone(), detection);
        }

        info!(
            "Category {} complete: {}/{} hits",
            category.name,
            result.hit_count(),
            result.results.len()
        );
        Ok(result)
    }

    async fn process_point(
        &self,
        point: &DetectionPointConfig,
        transcript: &Transcript,
        findings: Option<&str>,
    ) -> Result<DetectionResult, AnalysisError> {
        point.validate()?;

        let rule = self
            .engines
            .rules
            .match_point(point, transcript)
            .inspect_err(|_| self.engines.stats.record_rule_error())?;

        let semantic = self.engines.semantic.match_point(point, transcript).await;
        let validation = self
            .engines
            .validator
            .validate(point, transcript, &rule, &semantic.signal, findings)
            .await;

        let mut result = fuse(point, rule, semantic.signal, validation.signal, &self.fusion);
        if let Some(reason) = semantic.failure_reason {
            result.degradations.push(Degradation::engine(Engine::Vector, reason));
        }
        if let Some(reason) = validation.failure_reason {
            result.degradations.push(Degradation::engine(Engine::Llm, reason));
        }

        debug!(
            "{}: hit={} conf={:.3} source={:?}",
            point.key(),
            result.hit,
            result.final_confidence,
            result.evidence_source
        );
        Ok(result)
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
