use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::models::{CallInput, Speaker, Timestamp, Utterance};

/// Call file as stored on disk
#[derive(Debug, Deserialize)]
struct CallFile {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    sales_id: Option<String>,
    #[serde(default)]
    call_time: Option<String>,
    utterances: Vec<RawUtterance>,
}

#[derive(Debug, Deserialize)]
struct RawUtterance {
    /// Defaults to the position in the file
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    speaker: Option<String>,
    text: String,
    #[serde(default)]
    timestamp: Option<Timestamp>,
}

/// Read a call from a `.json` call file or a timestamped text transcript
///
/// The call id falls back to the file stem, then to a random id.
pub fn read_call_file(path: &Path) -> Result<CallInput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {:?}", path))?;
    let fallback_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        parse_call_json(&content, &fallback_id)
            .with_context(|| format!("Failed to parse call file: {:?}", path))
    } else {
        Ok(parse_timestamped_text(&content, &fallback_id))
    }
}

/// Parse a JSON call file
pub fn parse_call_json(json: &str, fallback_id: &str) -> Result<CallInput> {
    let file: CallFile = serde_json::from_str(json).context("Failed to parse call JSON")?;

    let mut utterances = Vec::with_capacity(file.utterances.len());
    for (position, raw) in file.utterances.into_iter().enumerate() {
        let speaker = match raw.speaker.as_deref() {
            Some(label) => parse_speaker(label)
                .with_context(|| format!("Utterance {}: unknown speaker {:?}", position, label))?,
            None => Speaker::Unknown,
        };
        utterances.push(Utterance {
            index: raw.index.unwrap_or(position),
            speaker,
            text: raw.text,
            timestamp: raw.timestamp,
        });
    }

    Ok(CallInput {
        call_id: file
            .call_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| fallback_id.to_string()),
        customer_id: file.customer_id,
        sales_id: file.sales_id,
        call_time: file.call_time,
        utterances,
    })
}

/// Claim a call id that no earlier call of the batch uses
///
/// Repeats get `-2`, `-3`, ... appended so their output files never collide.
pub fn unique_call_id(seen: &mut HashSet<String>, call_id: &str) -> String {
    if seen.insert(call_id.to_string()) {
        return call_id.to_string();
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{}-{}", call_id, n);
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Map the speaker labels seen in call exports
fn parse_speaker(label: &str) -> Result<Speaker> {
    match label.trim().to_lowercase().as_str() {
        "agent" | "sales" | "a" | "销售" => Ok(Speaker::Agent),
        "customer" | "client" | "b" | "客户" => Ok(Speaker::Customer),
        "unknown" | "" => Ok(Speaker::Unknown),
        other => bail!("unrecognized speaker label {:?}", other),
    }
}

/// Parse `[H:MM:SS]A: text` lines (A = agent, B = customer)
///
/// `<br/>` tags count as line breaks. Lines without a tag become `unknown`
/// utterances. Each tagged utterance ends where the next one starts.
pub fn parse_timestamped_text(text: &str, call_id: &str) -> CallInput {
    let text = text
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("<br>", "\n");

    let mut parsed: Vec<(Speaker, Option<u64>, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_tagged_line(line) {
            Some((start_ms, speaker, content)) => {
                parsed.push((speaker, Some(start_ms), content.to_string()))
            }
            None => parsed.push((Speaker::Unknown, None, line.to_string())),
        }
    }

    let mut utterances = Vec::with_capacity(parsed.len());
    for (index, (speaker, start, content)) in parsed.iter().enumerate() {
        let mut utterance = Utterance::new(index, *speaker, content.clone());
        if let Some(start_ms) = start {
            let end_ms = parsed[index + 1..]
                .iter()
                .find_map(|(_, next, _)| *next)
                .unwrap_or(*start_ms);
            utterance.timestamp = Some(Timestamp::new(*start_ms, end_ms));
        }
        utterances.push(utterance);
    }

    CallInput::new(call_id, utterances)
}

/// Split `[H:M:S]X: text` into its parts
fn parse_tagged_line(line: &str) -> Option<(u64, Speaker, &str)> {
    let rest = line.strip_prefix('[')?;
    let (clock, rest) = rest.split_once(']')?;
    let start_ms = parse_clock(clock)?;

    let mut chars = rest.trim_start().chars();
    let speaker = match chars.next()? {
        'A' | 'a' => Speaker::Agent,
        'B' | 'b' => Speaker::Customer,
        _ => return None,
    };
    let rest = chars.as_str().trim_start();
    let content = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('：'))?;

    Some((start_ms, speaker, content.trim()))
}

fn parse_clock(clock: &str) -> Option<u64> {
    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return None,
    };
    h.checked_mul(3600)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)?
        .checked_mul(1000)
}
