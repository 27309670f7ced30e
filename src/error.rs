use std::time::Duration;

/// Hard failures that cross an engine or stage boundary.
///
/// Expected degradation (backend timeouts, unavailable services, rejected
/// evidence) never shows up here; engines report those as `Absent` signals.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Malformed or empty transcript
    #[error("transcript parse error: {0}")]
    Parse(String),

    /// A detection point whose configuration cannot be evaluated
    #[error("malformed detection point {point}: {reason}")]
    MalformedPoint { point: String, reason: String },

    /// A category stage that could not run as a whole
    #[error("category {category} failed: {reason}")]
    CategoryFailure { category: String, reason: String },

    /// The aggregated report broke one of its structural invariants
    #[error("report validation failed: {0}")]
    ReportValidation(String),

    /// The call exceeded the pipeline-wide deadline
    #[error("pipeline timed out after {0:?}")]
    PipelineTimeout(Duration),

    /// Catalog or settings could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl AnalysisError {
    pub fn malformed_point(point: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPoint {
            point: point.into(),
            reason: reason.into(),
        }
    }

    pub fn category_failure(category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CategoryFailure {
            category: category.into(),
            reason: reason.into(),
        }
    }
}
