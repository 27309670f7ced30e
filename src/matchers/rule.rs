use std::collections::HashMap;
use std::ops::Range;

use regex_lite::{Regex, RegexBuilder};
use tracing::{debug, warn};

use super::text::{find_all_ascii_case_insensitive, find_all_exact};
use crate::error::AnalysisError;
use crate::models::{
    DetectionCatalog, DetectionPointConfig, EngineSignal, EvidenceSpan, Transcript,
};

/// Match strength of each rule tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleTier {
    Regex,
    Keyword,
    Exact,
}

impl RuleTier {
    pub fn confidence(&self) -> f64 {
        match self {
            RuleTier::Exact => 1.0,
            RuleTier::Keyword => 0.8,
            RuleTier::Regex => 0.6,
        }
    }
}

#[derive(Debug, Clone)]
struct RuleMatch {
    range: Range<usize>,
    tier: RuleTier,
}

/// Patterns of one point, regexes already compiled
#[derive(Debug, Clone)]
pub struct CompiledRules {
    exact: Vec<String>,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
}

impl CompiledRules {
    pub fn compile(point: &DetectionPointConfig) -> Result<Self, AnalysisError> {
        let regexes = point
            .regex_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        AnalysisError::malformed_point(
                            point.key(),
                            format!("invalid regex {:?}: {}", pattern, e),
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            exact: point.exact_phrases.iter().filter(|p| !p.is_empty()).cloned().collect(),
            keywords: point
                .keyword_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
            regexes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.keywords.is_empty() && self.regexes.is_empty()
    }

    fn matches(&self, text: &str) -> Vec<RuleMatch> {
        let mut found = Vec::new();

        for phrase in &self.exact {
            found.extend(find_all_exact(text, phrase).into_iter().map(|range| RuleMatch {
                range,
                tier: RuleTier::Exact,
            }));
        }
        for keyword in &self.keywords {
            found.extend(
                find_all_ascii_case_insensitive(text, keyword)
                    .into_iter()
                    .map(|range| RuleMatch {
                        range,
                        tier: RuleTier::Keyword,
                    }),
            );
        }
        for regex in &self.regexes {
            found.extend(
                regex
                    .find_iter(text)
                    .filter(|m| !m.range().is_empty())
                    .map(|m| RuleMatch {
                        range: m.range(),
                        tier: RuleTier::Regex,
                    }),
            );
        }

        dedup_overlapping(found)
    }
}

/// Drop matches that overlap a stronger (or earlier equal) match
fn dedup_overlapping(mut found: Vec<RuleMatch>) -> Vec<RuleMatch> {
    found.sort_by(|a, b| {
        b.tier
            .cmp(&a.tier)
            .then(a.range.start.cmp(&b.range.start))
            .then(b.range.end.cmp(&a.range.end))
    });

    let mut kept: Vec<RuleMatch> = Vec::with_capacity(found.len());
    for candidate in found {
        let overlaps = kept.iter().any(|k| {
            candidate.range.start < k.range.end && k.range.start < candidate.range.end
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

/// Keyword, phrase and regex scorer
///
/// Compiled once from the catalog and shared read-only across calls.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    /// Keyed by point key; failures keep the reason
    compiled: HashMap<String, Result<CompiledRules, String>>,
}

impl RuleMatcher {
    pub fn from_catalog(catalog: &DetectionCatalog) -> Self {
        let mut compiled = HashMap::new();
        for point in catalog.points() {
            let rules = CompiledRules::compile(point).map_err(|e| {
                warn!("Rule compilation failed: {}", e);
                match e {
                    AnalysisError::MalformedPoint { reason, .. } => reason,
                    other => other.to_string(),
                }
            });
            compiled.insert(point.key(), rules);
        }
        Self { compiled }
    }

    /// Score one point against the transcript
    pub fn match_point(
        &self,
        point: &DetectionPointConfig,
        transcript: &Transcript,
    ) -> Result<EngineSignal, AnalysisError> {
        match self.compiled.get(&point.key()) {
            Some(Ok(rules)) => Ok(Self::scan(rules, point, transcript)),
            Some(Err(reason)) => Err(AnalysisError::malformed_point(point.key(), reason.clone())),
            None => {
                let rules = CompiledRules::compile(point)?;
                Ok(Self::scan(&rules, point, transcript))
            }
        }
    }

    fn scan(
        rules: &CompiledRules,
        point: &DetectionPointConfig,
        transcript: &Transcript,
    ) -> EngineSignal {
        if rules.is_empty() {
            return EngineSignal::Absent;
        }

        let mut spans = Vec::new();
        for utterance in transcript.by_speaker(point.speaker_filter) {
            let quote = utterance.text.trim();
            if quote.is_empty() {
                continue;
            }

            let matches = rules.matches(&utterance.text);
            let Some(best) = matches.iter().map(|m| m.tier).max() else {
                continue;
            };

            debug!(
                "Rule match {} in utterance {}: {} span(s), best {:?}",
                point.key(),
                utterance.index,
                matches.len(),
                best
            );

            spans.push(EvidenceSpan {
                utterance_index: utterance.index,
                quote: quote.to_string(),
                timestamp: utterance.timestamp,
                confidence: best.confidence(),
            });
        }

        let confidence = spans.iter().map(|s| s.confidence).fold(0.0, f64::max);
        EngineSignal::present(confidence, spans)
    }
}
