use serde::{Deserialize, Serialize};

use crate::models::{
    DetectionPointConfig, DetectionResult, Engine, EngineSignal, EvidenceSource, EvidenceSpan,
    SignalBreakdown,
};

/// Which evidence spans a result keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSelection {
    /// Strongest spans first, earlier utterance on ties
    #[default]
    HighestConfidence,
    /// Spans in transcript order
    FirstOccurrence,
}

/// Configuration for fusion
#[derive(Debug, Clone)]
pub struct FusionPolicy {
    pub evidence_selection: EvidenceSelection,
    pub max_evidence_spans: usize,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            evidence_selection: EvidenceSelection::HighestConfidence,
            max_evidence_spans: 3,
        }
    }
}

/// Engines in evidence-source priority order
const SOURCE_PRIORITY: [Engine; 3] = [Engine::Rule, Engine::Llm, Engine::Vector];

/// Combine the three engine signals of one point into a verdict
pub fn fuse(
    point: &DetectionPointConfig,
    rule: EngineSignal,
    vector: EngineSignal,
    llm: EngineSignal,
    policy: &FusionPolicy,
) -> DetectionResult {
    let signals = SignalBreakdown { rule, vector, llm };

    let source = SOURCE_PRIORITY
        .iter()
        .copied()
        .find(|engine| signals.get(*engine).is_present());

    let Some(source) = source else {
        let mut result = DetectionResult::default_for(point);
        result.signals = signals;
        return result;
    };

    let weighted = point.weights.rule * signals.rule.confidence()
        + point.weights.vector * signals.vector.confidence()
        + point.weights.llm * signals.llm.confidence();
    let final_confidence = if weighted.is_finite() {
        weighted.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let evidence = select_evidence(signals.get(source).evidence(), policy);
    let hit = final_confidence >= point.hit_threshold;

    DetectionResult {
        point_id: point.id.clone(),
        category: point.category.clone(),
        hit,
        final_confidence,
        evidence,
        evidence_source: EvidenceSource::from(source),
        signals,
        degradations: Vec::new(),
    }
}

fn select_evidence(spans: &[EvidenceSpan], policy: &FusionPolicy) -> Vec<EvidenceSpan> {
    let mut spans = spans.to_vec();
    match policy.evidence_selection {
        EvidenceSelection::HighestConfidence => spans.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.utterance_index.cmp(&b.utterance_index))
        }),
        EvidenceSelection::FirstOccurrence => spans.sort_by_key(|s| s.utterance_index),
    }
    spans.truncate(policy.max_evidence_spans.max(1));
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(index: usize, quote: &str, confidence: f64) -> EvidenceSpan {
        EvidenceSpan {
            utterance_index: index,
            quote: quote.to_string(),
            timestamp: None,
            confidence,
        }
    }

    fn point() -> DetectionPointConfig {
        DetectionPointConfig::new("company_background", "icebreak")
    }

    #[test]
    fn test_rule_only_exact_hit_on_threshold() {
        let rule = EngineSignal::present(1.0, vec![span(3, "我们是腾讯投资的上市公司", 1.0)]);

        let result = fuse(
            &point(),
            rule,
            EngineSignal::Absent,
            EngineSignal::Absent,
            &FusionPolicy::default(),
        );

        // 0.5 * 1.0 lands exactly on the 0.5 threshold
        assert!(result.hit);
        assert_eq!(result.final_confidence, 0.5);
        assert_eq!(result.evidence_source, EvidenceSource::Rule);
        assert_eq!(result.evidence, vec![span(3, "我们是腾讯投资的上市公司", 1.0)]);
    }

    #[test]
    fn test_all_absent_is_default() {
        let result = fuse(
            &point(),
            EngineSignal::Absent,
            EngineSignal::Absent,
            EngineSignal::Absent,
            &FusionPolicy::default(),
        );

        assert!(!result.hit);
        assert_eq!(result.final_confidence, 0.0);
        assert_eq!(result.evidence_source, EvidenceSource::None);
        assert!(result.evidence.is_empty());
    }

    #[test]
    fn test_rule_wins_source_over_llm() {
        let rule = EngineSignal::present(0.6, vec![span(1, "知名的公司", 0.6)]);
        let llm = EngineSignal::present(0.9, vec![span(4, "腾讯投资", 0.9)]);

        let result = fuse(&point(), rule, EngineSignal::Absent, llm, &FusionPolicy::default());

        assert_eq!(result.evidence_source, EvidenceSource::Rule);
        assert_eq!(result.evidence[0].utterance_index, 1);
        assert!((result.final_confidence - 0.57).abs() < 1e-9);
        assert!(result.hit);
        assert!(result.signals.llm.is_present());
    }

    #[test]
    fn test_llm_wins_source_over_vector() {
        let vector = EngineSignal::present(0.7, vec![span(2, "上市公司", 0.7)]);
        let llm = EngineSignal::present(1.0, vec![span(2, "上市", 1.0)]);

        let result = fuse(&point(), EngineSignal::Absent, vector, llm, &FusionPolicy::default());

        assert_eq!(result.evidence_source, EvidenceSource::Llm);
        assert!((result.final_confidence - 0.44).abs() < 1e-9);
        assert!(!result.hit);
    }

    #[test]
    fn test_below_threshold_keeps_evidence() {
        let vector = EngineSignal::present(0.65, vec![span(0, "大公司", 0.65)]);

        let result = fuse(
            &point(),
            EngineSignal::Absent,
            vector,
            EngineSignal::Absent,
            &FusionPolicy::default(),
        );

        assert!(!result.hit);
        assert!(result.final_confidence > 0.0);
        assert_eq!(result.evidence_source, EvidenceSource::Vector);
        assert_eq!(result.evidence.len(), 1);
    }

    #[test]
    fn test_final_confidence_clipped() {
        let mut point = point();
        point.weights.rule = 2.0;
        let rule = EngineSignal::present(1.0, vec![span(0, "腾讯投资", 1.0)]);

        let result = fuse(
            &point,
            rule,
            EngineSignal::Absent,
            EngineSignal::Absent,
            &FusionPolicy::default(),
        );
        assert_eq!(result.final_confidence, 1.0);
    }

    #[test]
    fn test_evidence_ordering_and_truncation() {
        let spans = vec![
            span(5, "e", 0.6),
            span(1, "a", 0.8),
            span(3, "c", 1.0),
            span(0, "z", 0.8),
        ];

        let best = select_evidence(&spans, &FusionPolicy::default());
        let order: Vec<usize> = best.iter().map(|s| s.utterance_index).collect();
        assert_eq!(order, vec![3, 0, 1]);

        let first = select_evidence(
            &spans,
            &FusionPolicy {
                evidence_selection: EvidenceSelection::FirstOccurrence,
                max_evidence_spans: 2,
            },
        );
        let order: Vec<usize> = first.iter().map(|s| s.utterance_index).collect();
        assert_eq!(order, vec![0, 1]);
    }
}
