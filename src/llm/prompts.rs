use crate::matchers::text::truncate_chars;
use crate::models::{DetectionPointConfig, EvidenceSpan, Speaker, SpeakerFilter, Transcript, Utterance};

/// System prompt for the LLM (non-negotiable constraints)
pub const SYSTEM_PROMPT: &str = r#"You are auditing a sales call transcript. For the detection point you are given, decide whether the behavior actually happened in the dialogue.

RULES:
1. Answer only through the submit_verdict tool.
2. "evidence" MUST be copied character for character from ONE utterance of the dialogue. Do not translate, summarize, merge utterances or fix typos.
3. Keep evidence short (at most 100 characters) and pick the most direct excerpt.
4. If you cannot quote the dialogue, set "verdict" to false. Never use placeholders such as "无", "N/A", "none" or "未知" as evidence.
5. Candidate utterances come from keyword and similarity search. They may be false positives; judge them against the definition.
6. "confidence" is a number between 0 and 1."#;

/// Build the user prompt for one detection point
pub fn build_validation_prompt(
    point: &DetectionPointConfig,
    transcript: &Transcript,
    candidates: &[EvidenceSpan],
    prior_findings: Option<&str>,
    max_context_chars: usize,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# Detection point: {}\n", point.key()));
    if point.description.is_empty() {
        prompt.push_str(&format!("Definition: {}\n\n", point.id));
    } else {
        prompt.push_str(&format!("Definition: {}\n\n", point.description));
    }

    if !candidates.is_empty() {
        prompt.push_str("## Candidate utterances\n");
        let mut seen = Vec::new();
        for span in candidates {
            if seen.contains(&span.utterance_index) {
                continue;
            }
            seen.push(span.utterance_index);
            if let Some(utterance) = transcript.get(span.utterance_index) {
                prompt.push_str(&format_utterance(utterance));
                prompt.push('\n');
            }
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "## Dialogue ({})\n",
        describe_filter(point.speaker_filter)
    ));
    let mut used = 0usize;
    let mut truncated = false;
    for utterance in transcript.by_speaker(point.speaker_filter) {
        if utterance.text.trim().is_empty() {
            continue;
        }
        let line = format_utterance(utterance);
        let len = line.chars().count() + 1;
        if used + len > max_context_chars {
            let remaining = max_context_chars.saturating_sub(used);
            if remaining > 0 {
                prompt.push_str(truncate_chars(&line, remaining));
                prompt.push('\n');
            }
            truncated = true;
            break;
        }
        prompt.push_str(&line);
        prompt.push('\n');
        used += len;
    }
    if truncated {
        prompt.push_str("... (dialogue truncated)\n");
    }
    prompt.push('\n');

    if let Some(findings) = prior_findings {
        prompt.push_str("## Earlier findings for this call\n");
        prompt.push_str(findings);
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Instructions\n");
    prompt.push_str("Decide whether the definition is met and submit your verdict using the submit_verdict tool.\n");
    prompt.push_str("Quote the evidence exactly as it appears after the utterance label.\n");

    prompt
}

fn describe_filter(filter: SpeakerFilter) -> &'static str {
    match filter {
        SpeakerFilter::Agent => "agent utterances",
        SpeakerFilter::Customer => "customer utterances",
        SpeakerFilter::Any => "all utterances",
    }
}

fn speaker_label(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::Agent => "agent",
        Speaker::Customer => "customer",
        Speaker::Unknown => "unknown",
    }
}

fn format_utterance(utterance: &Utterance) -> String {
    format!(
        "[{}] {}: {}",
        utterance.index,
        speaker_label(utterance.speaker),
        utterance.text.trim()
    )
}
