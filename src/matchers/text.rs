//! Text helpers shared by the matchers and the evidence checks.

use std::ops::Range;

/// Strings a model returns when it has no real quote to give
const PLACEHOLDERS: &[&str] = &[
    "无",
    "n/a",
    "na",
    "none",
    "null",
    "unknown",
    "未知",
    "不适用",
    "无证据",
    "无法提供",
    "空",
    "不可用",
    "not applicable",
    "no evidence",
    "cannot provide",
    "没有",
];

/// Lowercased alphanumeric projection of a string that remembers where each
/// character came from in the original.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    chars: Vec<char>,
    /// Byte range in the original string for each entry of `chars`
    origins: Vec<Range<usize>>,
}

impl NormalizedText {
    pub fn new(text: &str) -> Self {
        let mut chars = Vec::with_capacity(text.len());
        let mut origins = Vec::with_capacity(text.len());

        for (start, c) in text.char_indices() {
            if !c.is_alphanumeric() {
                continue;
            }
            let end = start + c.len_utf8();
            for lower in c.to_lowercase() {
                chars.push(lower);
                origins.push(start..end);
            }
        }

        Self { chars, origins }
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn as_string(&self) -> String {
        self.chars.iter().collect()
    }

    /// Byte range in the original text covering the first occurrence of `needle`
    pub fn locate(&self, needle: &NormalizedText) -> Option<Range<usize>> {
        let n = needle.chars.len();
        if n == 0 || n > self.chars.len() {
            return None;
        }

        let at = self
            .chars
            .windows(n)
            .position(|window| window == needle.chars.as_slice())?;

        Some(self.origins[at].start..self.origins[at + n - 1].end)
    }
}

/// Normalized form used for comparisons
pub fn normalize(text: &str) -> String {
    NormalizedText::new(text).as_string()
}

/// True for empty evidence and the usual "no evidence" fillers
pub fn is_placeholder(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }

    let lowered = trimmed.to_lowercase();
    if PLACEHOLDERS.contains(&lowered.as_str())
        || lowered.starts_with("不适用")
        || lowered.contains("无证据")
        || lowered.contains("无法提供")
    {
        return true;
    }

    let normalized = normalize(trimmed);
    normalized.is_empty() || PLACEHOLDERS.iter().any(|p| normalize(p) == normalized)
}

/// Every ASCII-case-insensitive occurrence of `needle`, as byte ranges
pub fn find_all_ascii_case_insensitive(haystack: &str, needle: &str) -> Vec<Range<usize>> {
    if needle.is_empty() {
        return Vec::new();
    }

    // ASCII lowercasing keeps byte offsets intact
    let haystack = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();

    haystack
        .match_indices(&needle)
        .map(|(start, m)| start..start + m.len())
        .collect()
}

/// Every case-sensitive occurrence of `needle`, as byte ranges
pub fn find_all_exact(haystack: &str, needle: &str) -> Vec<Range<usize>> {
    if needle.is_empty() {
        return Vec::new();
    }
    haystack
        .match_indices(needle)
        .map(|(start, m)| start..start + m.len())
        .collect()
}

/// Cut `text` down to at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}
