use serde::{Deserialize, Serialize};

use super::{Speaker, Transcript};

/// Minutes assumed per utterance when the transcript carries no timestamps
const MINUTES_PER_UTTERANCE: f64 = 0.5;

/// Call-level statistics computed before any category runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub utterance_count: usize,
    pub agent_utterances: usize,
    pub customer_utterances: usize,
    /// Non-whitespace characters spoken by the agent
    pub agent_chars: usize,
    pub customer_chars: usize,
    pub total_chars: usize,
    /// Call length in minutes, measured or estimated
    pub duration_min: f64,
    /// True when `duration_min` comes from utterance timestamps
    pub duration_measured: bool,
    /// Speaker changes between attributed speakers
    pub interaction_rounds: usize,
    pub interaction_rounds_per_min: f64,
}

impl ProcessMetrics {
    pub fn from_transcript(transcript: &Transcript) -> Self {
        let mut metrics = ProcessMetrics {
            utterance_count: transcript.len(),
            ..Default::default()
        };

        for utterance in transcript.utterances() {
            let chars = utterance.char_count();
            metrics.total_chars += chars;
            match utterance.speaker {
                Speaker::Agent => {
                    metrics.agent_utterances += 1;
                    metrics.agent_chars += chars;
                }
                Speaker::Customer => {
                    metrics.customer_utterances += 1;
                    metrics.customer_chars += chars;
                }
                Speaker::Unknown => {}
            }
        }

        let mut last_known: Option<Speaker> = None;
        for utterance in transcript.utterances() {
            if utterance.speaker == Speaker::Unknown {
                continue;
            }
            if let Some(previous) = last_known {
                if previous != utterance.speaker {
                    metrics.interaction_rounds += 1;
                }
            }
            last_known = Some(utterance.speaker);
        }

        match measured_duration_ms(transcript) {
            Some(ms) if ms > 0 => {
                metrics.duration_min = ms as f64 / 60_000.0;
                metrics.duration_measured = true;
            }
            _ => {
                metrics.duration_min = transcript.len() as f64 * MINUTES_PER_UTTERANCE;
            }
        }

        if metrics.duration_min > 0.0 {
            metrics.interaction_rounds_per_min =
                metrics.interaction_rounds as f64 / metrics.duration_min;
        }

        metrics
    }
}

/// Last end minus first start over timestamped utterances
fn measured_duration_ms(transcript: &Transcript) -> Option<u64> {
    let mut stamps = transcript.utterances().iter().filter_map(|u| u.timestamp);
    let first = stamps.next()?;
    let last_end = stamps.map(|t| t.end_ms).fold(first.end_ms, u64::max);
    Some(last_end.saturating_sub(first.start_ms))
}
