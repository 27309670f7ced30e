use serde::{Deserialize, Serialize};

use super::Timestamp;

/// The three independent evidence producers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Rule,
    Vector,
    Llm,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Rule => "rule",
            Engine::Vector => "vector",
            Engine::Llm => "llm",
        }
    }
}

/// Which engine supplied the evidence of a detection result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Rule,
    Vector,
    Llm,
    None,
}

impl From<Engine> for EvidenceSource {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Rule => EvidenceSource::Rule,
            Engine::Vector => EvidenceSource::Vector,
            Engine::Llm => EvidenceSource::Llm,
        }
    }
}

/// A literal excerpt of one utterance backing a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub utterance_index: usize,
    /// Verbatim substring of the referenced utterance
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Score of this span within its engine (0-1)
    pub confidence: f64,
}

/// One engine's output for one detection point
///
/// `Present` always carries at least one span; use [`EngineSignal::present`]
/// to build it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineSignal {
    Present {
        confidence: f64,
        evidence: Vec<EvidenceSpan>,
    },
    Absent,
}

impl EngineSignal {
    /// Build a signal, falling back to `Absent` without evidence or score
    pub fn present(confidence: f64, evidence: Vec<EvidenceSpan>) -> Self {
        if evidence.is_empty() || !confidence.is_finite() || confidence <= 0.0 {
            return EngineSignal::Absent;
        }
        EngineSignal::Present {
            confidence: confidence.min(1.0),
            evidence,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, EngineSignal::Present { .. })
    }

    /// Reported confidence, 0 when absent
    pub fn confidence(&self) -> f64 {
        match self {
            EngineSignal::Present { confidence, .. } => *confidence,
            EngineSignal::Absent => 0.0,
        }
    }

    pub fn evidence(&self) -> &[EvidenceSpan] {
        match self {
            EngineSignal::Present { evidence, .. } => evidence,
            EngineSignal::Absent => &[],
        }
    }
}

/// All three engine outputs for one point, kept for tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub rule: EngineSignal,
    pub vector: EngineSignal,
    pub llm: EngineSignal,
}

impl SignalBreakdown {
    pub fn absent() -> Self {
        Self {
            rule: EngineSignal::Absent,
            vector: EngineSignal::Absent,
            llm: EngineSignal::Absent,
        }
    }

    pub fn get(&self, engine: Engine) -> &EngineSignal {
        match engine {
            Engine::Rule => &self.rule,
            Engine::Vector => &self.vector,
            Engine::Llm => &self.llm,
        }
    }
}

/// Why an engine (or the whole point) contributed nothing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    /// Engine name, or "point" for point-level failures
    pub source: String,
    pub reason: String,
}

impl Degradation {
    pub fn engine(engine: Engine, reason: impl Into<String>) -> Self {
        Self {
            source: engine.as_str().to_string(),
            reason: reason.into(),
        }
    }

    pub fn point(reason: impl Into<String>) -> Self {
        Self {
            source: "point".to_string(),
            reason: reason.into(),
        }
    }
}
