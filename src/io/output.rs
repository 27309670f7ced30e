use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::{AnalysisReport, BatchOutcome, BatchSummary};

/// Write any serializable value as pretty JSON
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create file: {:?}", path))?;
    serde_json::to_writer_pretty(file, value).context("Failed to write JSON")?;
    Ok(())
}

/// Write every batch outcome into `dir`
///
/// Reports land in `<call_id>.json`, failures in `<call_id>.failure.json`,
/// and the roll-up in `batch_summary.json`.
pub fn write_batch_outputs(outcomes: &[BatchOutcome], dir: &Path) -> Result<BatchSummary> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {:?}", dir))?;

    for outcome in outcomes {
        match outcome {
            BatchOutcome::Report(report) => {
                write_json(report, &output_path(dir, &report.call_id, "json"))?
            }
            BatchOutcome::Failure(failure) => {
                write_json(failure, &output_path(dir, &failure.call_id, "failure.json"))?
            }
        }
    }

    let summary = BatchSummary::from_outcomes(outcomes);
    write_json(&summary, &dir.join("batch_summary.json"))?;
    Ok(summary)
}

fn output_path(dir: &Path, call_id: &str, suffix: &str) -> PathBuf {
    let safe: String = call_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    dir.join(format!("{}.{}", safe, suffix))
}

/// Plain-text rendering of a report for people
pub struct HumanReport<'a> {
    report: &'a AnalysisReport,
}

impl<'a> HumanReport<'a> {
    pub fn new(report: &'a AnalysisReport) -> Self {
        Self { report }
    }

    pub fn format(&self) -> String {
        let report = self.report;
        let metrics = &report.process_metrics;
        let mut output = String::new();

        output.push_str(&format!("Call {}\n", report.call_id));
        output.push_str(&format!(
            "{} utterances ({} agent / {} customer), {:.1} min{}, {} speaker changes\n",
            metrics.utterance_count,
            metrics.agent_utterances,
            metrics.customer_utterances,
            metrics.duration_min,
            if metrics.duration_measured { "" } else { " (estimated)" },
            metrics.interaction_rounds
        ));
        output.push_str(&format!(
            "Hits: {}/{} points, mean confidence {:.2}\n\n",
            report.summary.hit_count, report.summary.point_count, report.summary.overall_confidence
        ));

        for category in &report.categories {
            match &category.failure {
                Some(reason) => output.push_str(&format!(
                    "[{}] not analyzed: {}\n",
                    category.category, reason
                )),
                None => output.push_str(&format!(
                    "[{}] {}/{}\n",
                    category.category,
                    category.hit_count(),
                    category.results.len()
                )),
            }

            for result in category.results.values() {
                let mark = if result.hit { "x" } else { " " };
                output.push_str(&format!(
                    "  [{}] {} ({:.2})\n",
                    mark, result.point_id, result.final_confidence
                ));
                if let Some(span) = result.evidence.first() {
                    let at = span
                        .timestamp
                        .map(|ts| format!("{} ", format_timestamp(ts.start_ms)))
                        .unwrap_or_default();
                    output.push_str(&format!(
                        "      {}#{} \"{}\"\n",
                        at, span.utterance_index, span.quote
                    ));
                }
            }
            output.push('\n');
        }

        output
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;
        write!(file, "{}", self.format())?;
        Ok(())
    }
}

/// Format milliseconds as MM:SS
fn format_timestamp(ms: u64) -> String {
    let seconds = ms / 1000;
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;

    use crate::models::{
        CallMetadata, CategoryResult, DetectionPointConfig, DetectionResult, EvidenceSource,
        EvidenceSpan, FailureKind, FailureRecord, ProcessMetrics, ReportSummary, Speaker,
        Timestamp, Transcript, Utterance,
    };

    fn report() -> AnalysisReport {
        let transcript = Transcript::new(vec![
            Utterance::new(0, Speaker::Agent, "我们是腾讯投资的上市公司").with_timestamp(65_000, 70_000),
        ])
        .unwrap();

        let mut hit = DetectionResult::default_for(&DetectionPointConfig::new(
            "company_background",
            "icebreak",
        ));
        hit.hit = true;
        hit.final_confidence = 0.5;
        hit.evidence_source = EvidenceSource::Rule;
        hit.evidence = vec![EvidenceSpan {
            utterance_index: 0,
            quote: "我们是腾讯投资的上市公司".to_string(),
            timestamp: Some(Timestamp::new(65_000, 70_000)),
            confidence: 1.0,
        }];
        let mut category = CategoryResult::new("icebreak");
        category.results.insert(hit.point_id.clone(), hit);
        let categories = vec![category];

        AnalysisReport {
            call_id: "call-1".to_string(),
            metadata: CallMetadata {
                customer_id: None,
                sales_id: None,
                call_time: None,
                analyzed_at: Utc::now(),
            },
            process_metrics: ProcessMetrics::from_transcript(&transcript),
            summary: ReportSummary::from_categories(&categories),
            categories,
            stage_timings_ms: BTreeMap::new(),
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "00:00");
        assert_eq!(format_timestamp(65_000), "01:05");
        assert_eq!(format_timestamp(3_661_500), "61:01");
    }

    #[test]
    fn test_human_report() {
        let report = report();
        let text = HumanReport::new(&report).format();

        assert!(text.contains("Call call-1"));
        assert!(text.contains("[icebreak] 1/1"));
        assert!(text.contains("[x] company_background (0.50)"));
        assert!(text.contains("01:05 #0 \"我们是腾讯投资的上市公司\""));
    }

    #[test]
    fn test_write_batch_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = vec![
            BatchOutcome::Report(Box::new(report())),
            BatchOutcome::Failure(FailureRecord {
                call_id: "empty".to_string(),
                kind: FailureKind::ParseError,
                reason: "transcript parse error: transcript has no utterances".to_string(),
            }),
        ];

        let summary = write_batch_outputs(&outcomes, dir.path()).unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(dir.path().join("call-1.json").exists());
        assert!(dir.path().join("empty.failure.json").exists());

        let written: BatchSummary = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("batch_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written.total, 2);
        assert_eq!(written.failures[0].kind, FailureKind::ParseError);
    }
}
