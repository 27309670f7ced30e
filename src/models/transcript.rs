use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Who spoke an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// The sales agent
    Agent,
    /// The customer on the call
    Customer,
    /// Speaker could not be attributed during ingestion
    Unknown,
}

/// Start/end offsets of an utterance in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Timestamp {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self {
            start_ms,
            end_ms: end_ms.max(start_ms),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// A single turn of dialogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// Position in the transcript, contiguous from 0
    pub index: usize,
    pub speaker: Speaker,
    /// The spoken text - never rewritten by the pipeline
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl Utterance {
    pub fn new(index: usize, speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            index,
            speaker,
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.timestamp = Some(Timestamp::new(start_ms, end_ms));
        self
    }

    /// Character count excluding whitespace
    pub fn char_count(&self) -> usize {
        self.text.chars().filter(|c| !c.is_whitespace()).count()
    }
}

/// Validated, immutable dialogue for one call
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    utterances: Vec<Utterance>,
}

impl Transcript {
    /// Validate raw utterances into a transcript
    ///
    /// Indices must run 0, 1, 2, ... in order and at least one utterance
    /// must carry non-blank text.
    pub fn new(utterances: Vec<Utterance>) -> Result<Self, AnalysisError> {
        if utterances.is_empty() {
            return Err(AnalysisError::Parse("transcript has no utterances".to_string()));
        }

        for (expected, utterance) in utterances.iter().enumerate() {
            if utterance.index != expected {
                return Err(AnalysisError::Parse(format!(
                    "utterance index {} found at position {} (indices must increase from 0)",
                    utterance.index, expected
                )));
            }
        }

        if utterances.iter().all(|u| u.text.trim().is_empty()) {
            return Err(AnalysisError::Parse(
                "transcript contains only blank utterances".to_string(),
            ));
        }

        Ok(Self { utterances })
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn get(&self, index: usize) -> Option<&Utterance> {
        self.utterances.get(index)
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    /// Utterances accepted by a speaker filter, in order
    pub fn by_speaker(&self, filter: SpeakerFilter) -> impl Iterator<Item = &Utterance> {
        self.utterances
            .iter()
            .filter(move |u| filter.accepts(u.speaker))
    }
}

/// Which speaker's utterances a detection point looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerFilter {
    #[default]
    Agent,
    Customer,
    Any,
}

impl SpeakerFilter {
    pub fn accepts(&self, speaker: Speaker) -> bool {
        match self {
            SpeakerFilter::Agent => speaker == Speaker::Agent,
            SpeakerFilter::Customer => speaker == Speaker::Customer,
            SpeakerFilter::Any => true,
        }
    }
}

/// One call as handed to the workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallInput {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sales_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_time: Option<String>,
    pub utterances: Vec<Utterance>,
}

impl CallInput {
    pub fn new(call_id: impl Into<String>, utterances: Vec<Utterance>) -> Self {
        Self {
            call_id: call_id.into(),
            utterances,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_requires_contiguous_indices() {
        let utterances = vec![
            Utterance::new(0, Speaker::Agent, "您好"),
            Utterance::new(2, Speaker::Customer, "喂"),
        ];

        let err = Transcript::new(utterances).unwrap_err();
        assert!(matches!(err, AnalysisError::Parse(_)));
    }

    #[test]
    fn test_transcript_rejects_empty() {
        assert!(matches!(
            Transcript::new(vec![]),
            Err(AnalysisError::Parse(_))
        ));
        assert!(matches!(
            Transcript::new(vec![Utterance::new(0, Speaker::Agent, "   ")]),
            Err(AnalysisError::Parse(_))
        ));
    }

    #[test]
    fn test_by_speaker_filters() {
        let transcript = Transcript::new(vec![
            Utterance::new(0, Speaker::Agent, "我是益盟的老师"),
            Utterance::new(1, Speaker::Customer, "嗯"),
            Utterance::new(2, Speaker::Agent, "耽误您两分钟"),
        ])
        .unwrap();

        let agent: Vec<usize> = transcript
            .by_speaker(SpeakerFilter::Agent)
            .map(|u| u.index)
            .collect();
        assert_eq!(agent, vec![0, 2]);
        assert_eq!(transcript.by_speaker(SpeakerFilter::Any).count(), 3);
    }

    #[test]
    fn test_timestamp_never_negative() {
        let ts = Timestamp::new(5_000, 1_000);
        assert_eq!(ts.duration_ms(), 0);
    }
}
