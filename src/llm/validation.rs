use crate::matchers::text::{NormalizedText, is_placeholder};
use crate::models::{DetectionPointConfig, EvidenceSpan, Transcript};

/// Lowest confidence kept for an accepted "yes"
const MIN_ACCEPTED_CONFIDENCE: f64 = 0.01;

/// Why a model answer was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// Empty or filler evidence such as "无" or "N/A"
    Placeholder(String),
    /// Evidence not found inside any single eligible utterance
    NotVerbatim(String),
}

impl std::fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityViolation::Placeholder(text) => {
                write!(f, "placeholder evidence {:?}", text)
            }
            IntegrityViolation::NotVerbatim(text) => {
                write!(f, "evidence {:?} is not a verbatim excerpt of one utterance", text)
            }
        }
    }
}

/// Map model evidence back onto the transcript
///
/// Matching ignores case, whitespace and punctuation, but the returned quote
/// is the exact original substring of the utterance that contained it.
pub fn verify_evidence(
    evidence: &str,
    point: &DetectionPointConfig,
    transcript: &Transcript,
    confidence: f64,
) -> Result<EvidenceSpan, IntegrityViolation> {
    if is_placeholder(evidence) {
        return Err(IntegrityViolation::Placeholder(evidence.to_string()));
    }

    let needle = NormalizedText::new(evidence.trim());
    if needle.is_empty() {
        return Err(IntegrityViolation::Placeholder(evidence.to_string()));
    }

    for utterance in transcript.by_speaker(point.speaker_filter) {
        let haystack = NormalizedText::new(&utterance.text);
        if let Some(range) = haystack.locate(&needle) {
            let quote = utterance.text[range].trim();
            if quote.is_empty() {
                continue;
            }
            return Ok(EvidenceSpan {
                utterance_index: utterance.index,
                quote: quote.to_string(),
                timestamp: utterance.timestamp,
                confidence,
            });
        }
    }

    Err(IntegrityViolation::NotVerbatim(evidence.to_string()))
}

/// Accept 0-1 or percentage confidences, defaulting to 1.0 when missing
pub fn normalize_confidence(reported: Option<f64>) -> f64 {
    let Some(value) = reported.filter(|v| v.is_finite()) else {
        return 1.0;
    };
    let value = if value > 1.0 && value <= 100.0 {
        value / 100.0
    } else {
        value
    };
    value.clamp(MIN_ACCEPTED_CONFIDENCE, 1.0)
}
