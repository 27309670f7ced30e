use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    CategoryConfig, Degradation, DetectionPointConfig, Engine, EvidenceSource, EvidenceSpan,
    ProcessMetrics, SignalBreakdown, Transcript,
};
use crate::error::AnalysisError;

/// Final verdict for one detection point in one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub point_id: String,
    pub category: String,
    pub hit: bool,
    /// Fused score (0-1)
    pub final_confidence: f64,
    /// Spans from the engine named by `evidence_source`
    pub evidence: Vec<EvidenceSpan>,
    pub evidence_source: EvidenceSource,
    /// Every engine's raw output
    pub signals: SignalBreakdown,
    /// Engines that failed or were rejected while producing this result
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<Degradation>,
}

impl DetectionResult {
    /// The "nothing found" result
    pub fn default_for(point: &DetectionPointConfig) -> Self {
        Self {
            point_id: point.id.clone(),
            category: point.category.clone(),
            hit: false,
            final_confidence: 0.0,
            evidence: Vec::new(),
            evidence_source: EvidenceSource::None,
            signals: SignalBreakdown::absent(),
            degradations: Vec::new(),
        }
    }

    /// Default result carrying a point-level failure note
    pub fn degraded(point: &DetectionPointConfig, reason: impl Into<String>) -> Self {
        let mut result = Self::default_for(point);
        result.degradations.push(Degradation::point(reason));
        result
    }

    /// Check the evidence-before-confidence rules against the transcript
    pub fn validate(&self, transcript: &Transcript) -> Result<(), String> {
        let key = format!("{}/{}", self.category, self.point_id);

        if !self.final_confidence.is_finite() || !(0.0..=1.0).contains(&self.final_confidence) {
            return Err(format!(
                "{}: final_confidence {} outside [0, 1]",
                key, self.final_confidence
            ));
        }

        let any_present = [Engine::Rule, Engine::Vector, Engine::Llm]
            .iter()
            .any(|e| self.signals.get(*e).is_present());

        if !any_present && (self.hit || self.final_confidence > 0.0) {
            return Err(format!("{}: scored without any engine present", key));
        }

        if self.final_confidence > 0.0
            && (self.evidence_source == EvidenceSource::None || self.evidence.is_empty())
        {
            return Err(format!("{}: positive confidence without evidence", key));
        }

        if self.evidence_source == EvidenceSource::None && !self.evidence.is_empty() {
            return Err(format!("{}: evidence attached with no source", key));
        }

        for span in &self.evidence {
            let utterance = transcript.get(span.utterance_index).ok_or_else(|| {
                format!(
                    "{}: evidence references missing utterance {}",
                    key, span.utterance_index
                )
            })?;
            if span.quote.trim().is_empty() || !utterance.text.contains(&span.quote) {
                return Err(format!(
                    "{}: quote {:?} is not verbatim in utterance {}",
                    key, span.quote, span.utterance_index
                ));
            }
        }

        Ok(())
    }
}

/// All results of one category stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub category: String,
    /// Keyed by point id
    pub results: BTreeMap<String, DetectionResult>,
    /// Set when the stage failed as a whole
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl CategoryResult {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            results: BTreeMap::new(),
            failure: None,
        }
    }

    /// Default results for every point plus the failure reason
    pub fn failed(category: &CategoryConfig, reason: impl Into<String>) -> Self {
        let results = category
            .points
            .iter()
            .map(|p| (p.id.clone(), DetectionResult::default_for(p)))
            .collect();
        Self {
            category: category.name.clone(),
            results,
            failure: Some(reason.into()),
        }
    }

    pub fn hit_count(&self) -> usize {
        self.results.values().filter(|r| r.hit).count()
    }

    /// Results that hit, in point id order
    pub fn hits(&self) -> impl Iterator<Item = &DetectionResult> {
        self.results.values().filter(|r| r.hit)
    }
}

/// Descriptive information carried through from the input file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sales_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_time: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

/// Per-category line of the summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: String,
    pub hits: usize,
    pub points: usize,
    /// hits / points, 0 for an empty category
    pub completion_rate: f64,
    pub failed: bool,
}

/// Headline numbers of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub point_count: usize,
    pub hit_count: usize,
    /// Mean final confidence over all points
    pub overall_confidence: f64,
    pub categories: Vec<CategorySummary>,
}

impl ReportSummary {
    pub fn from_categories(categories: &[CategoryResult]) -> Self {
        let mut point_count = 0;
        let mut hit_count = 0;
        let mut confidence_sum = 0.0;
        let mut lines = Vec::with_capacity(categories.len());

        for category in categories {
            let points = category.results.len();
            let hits = category.hit_count();
            point_count += points;
            hit_count += hits;
            confidence_sum += category
                .results
                .values()
                .map(|r| r.final_confidence)
                .sum::<f64>();

            lines.push(CategorySummary {
                category: category.category.clone(),
                hits,
                points,
                completion_rate: if points > 0 {
                    hits as f64 / points as f64
                } else {
                    0.0
                },
                failed: category.failure.is_some(),
            });
        }

        Self {
            point_count,
            hit_count,
            overall_confidence: if point_count > 0 {
                confidence_sum / point_count as f64
            } else {
                0.0
            },
            categories: lines,
        }
    }
}

/// Terminal artifact of analyzing one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub call_id: String,
    pub metadata: CallMetadata,
    pub process_metrics: ProcessMetrics,
    /// In catalog order
    pub categories: Vec<CategoryResult>,
    pub summary: ReportSummary,
    /// Wall time per stage
    pub stage_timings_ms: BTreeMap<String, u64>,
}

impl AnalysisReport {
    pub fn category(&self, name: &str) -> Option<&CategoryResult> {
        self.categories.iter().find(|c| c.category == name)
    }

    pub fn result(&self, category: &str, point_id: &str) -> Option<&DetectionResult> {
        self.category(category)?.results.get(point_id)
    }

    /// Verify structural invariants and that every quote is verbatim
    pub fn validate(&self, transcript: &Transcript) -> Result<(), AnalysisError> {
        for category in &self.categories {
            for (point_id, result) in &category.results {
                if point_id != &result.point_id || result.category != category.category {
                    return Err(AnalysisError::ReportValidation(format!(
                        "result {}/{} filed under {}/{}",
                        result.category, result.point_id, category.category, point_id
                    )));
                }
                result
                    .validate(transcript)
                    .map_err(AnalysisError::ReportValidation)?;
            }
        }

        let expected = ReportSummary::from_categories(&self.categories);
        if expected.point_count != self.summary.point_count
            || expected.hit_count != self.summary.hit_count
        {
            return Err(AnalysisError::ReportValidation(format!(
                "summary counts {}/{} disagree with results {}/{}",
                self.summary.hit_count,
                self.summary.point_count,
                expected.hit_count,
                expected.point_count
            )));
        }

        Ok(())
    }
}

/// Why a call produced no report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ParseError,
    ReportValidationError,
    PipelineTimeout,
    /// Not started or abandoned after an earlier failure in fail-fast mode
    Skipped,
    /// Configuration problems surfacing at call time
    ConfigError,
}

/// Replacement for a report when a call fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub call_id: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl FailureRecord {
    pub fn from_error(call_id: impl Into<String>, error: &AnalysisError) -> Self {
        let kind = match error {
            AnalysisError::Parse(_) => FailureKind::ParseError,
            AnalysisError::ReportValidation(_) => FailureKind::ReportValidationError,
            AnalysisError::PipelineTimeout(_) => FailureKind::PipelineTimeout,
            AnalysisError::Config(_)
            | AnalysisError::MalformedPoint { .. }
            | AnalysisError::CategoryFailure { .. } => FailureKind::ConfigError,
        };
        Self {
            call_id: call_id.into(),
            kind,
            reason: error.to_string(),
        }
    }

    pub fn skipped(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            kind: FailureKind::Skipped,
            reason: "not run after an earlier failure (fail-fast)".to_string(),
        }
    }
}

/// Result slot of one call in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Report(Box<AnalysisReport>),
    Failure(FailureRecord),
}

impl BatchOutcome {
    pub fn call_id(&self) -> &str {
        match self {
            BatchOutcome::Report(report) => &report.call_id,
            BatchOutcome::Failure(failure) => &failure.call_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Report(_))
    }
}

/// Roll-up written next to the per-call reports of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<FailureRecord>,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[BatchOutcome]) -> Self {
        let failures: Vec<FailureRecord> = outcomes
            .iter()
            .filter_map(|o| match o {
                BatchOutcome::Failure(f) => Some(f.clone()),
                BatchOutcome::Report(_) => None,
            })
            .collect();
        let skipped = failures
            .iter()
            .filter(|f| f.kind == FailureKind::Skipped)
            .count();

        Self {
            total: outcomes.len(),
            succeeded: outcomes.len() - failures.len(),
            failed: failures.len() - skipped,
            skipped,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineSignal, Speaker, Utterance};

    fn transcript() -> Transcript {
        Transcript::new(vec![
            Utterance::new(0, Speaker::Agent, "您好"),
            Utterance::new(1, Speaker::Agent, "我们是腾讯投资的上市公司"),
        ])
        .unwrap()
    }

    fn rule_hit() -> DetectionResult {
        let span = EvidenceSpan {
            utterance_index: 1,
            quote: "我们是腾讯投资的上市公司".to_string(),
            timestamp: None,
            confidence: 1.0,
        };
        let point = DetectionPointConfig::new("company_background", "icebreak");
        let mut result = DetectionResult::default_for(&point);
        result.hit = true;
        result.final_confidence = 0.5;
        result.evidence = vec![span.clone()];
        result.evidence_source = EvidenceSource::Rule;
        result.signals.rule = EngineSignal::present(1.0, vec![span]);
        result
    }

    fn report_with(result: DetectionResult) -> AnalysisReport {
        let mut category = CategoryResult::new("icebreak");
        category.results.insert(result.point_id.clone(), result);
        let categories = vec![category];
        AnalysisReport {
            call_id: "call-1".to_string(),
            metadata: CallMetadata {
                customer_id: None,
                sales_id: None,
                call_time: None,
                analyzed_at: Utc::now(),
            },
            process_metrics: ProcessMetrics::default(),
            summary: ReportSummary::from_categories(&categories),
            categories,
            stage_timings_ms: BTreeMap::new(),
        }
    }

    #[test]
    fn test_valid_report_passes() {
        report_with(rule_hit()).validate(&transcript()).unwrap();
    }

    #[test]
    fn test_confidence_without_evidence_rejected() {
        let mut result = rule_hit();
        result.evidence.clear();
        let err = report_with(result).validate(&transcript()).unwrap_err();
        assert!(matches!(err, AnalysisError::ReportValidation(_)));
    }

    #[test]
    fn test_non_verbatim_quote_rejected() {
        let mut result = rule_hit();
        result.evidence[0].quote = "我们是阿里投资的".to_string();
        assert!(report_with(result).validate(&transcript()).is_err());
    }

    #[test]
    fn test_all_absent_cannot_hit() {
        let point = DetectionPointConfig::new("company_background", "icebreak");
        let mut result = DetectionResult::default_for(&point);
        result.hit = true;
        assert!(result.validate(&transcript()).is_err());
    }

    #[test]
    fn test_summary_and_failed_category() {
        let config = CategoryConfig {
            name: "deduction".to_string(),
            include_prior_findings: false,
            points: vec![
                DetectionPointConfig::new("bs_explained", "deduction"),
                DetectionPointConfig::new("bubugao_explained", "deduction"),
            ],
        };
        let failed = CategoryResult::failed(&config, "stage panicked");

        let mut ok = CategoryResult::new("icebreak");
        ok.results.insert("company_background".to_string(), rule_hit());

        let summary = ReportSummary::from_categories(&[ok, failed]);
        assert_eq!(summary.point_count, 3);
        assert_eq!(summary.hit_count, 1);
        assert!((summary.overall_confidence - 0.5 / 3.0).abs() < 1e-9);
        assert_eq!(summary.categories[0].completion_rate, 1.0);
        assert!(summary.categories[1].failed);
        assert_eq!(summary.categories[1].hits, 0);
    }

    #[test]
    fn test_failure_record_kinds() {
        let parse = FailureRecord::from_error("a", &AnalysisError::Parse("empty".to_string()));
        assert_eq!(parse.kind, FailureKind::ParseError);

        let outcomes = vec![
            BatchOutcome::Failure(parse),
            BatchOutcome::Failure(FailureRecord::skipped("b")),
            BatchOutcome::Report(Box::new(report_with(rule_hit()))),
        ];
        let summary = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(outcomes[2].call_id(), "call-1");
    }
}
