pub mod error;
pub mod io;
pub mod llm;
pub mod matchers;
pub mod models;
pub mod stages;
pub mod stats;

pub use error::AnalysisError;
pub use io::{HumanReport, read_call_file, write_batch_outputs, write_json};
pub use llm::{AnthropicClient, AnthropicConfig, LlmBackend};
pub use matchers::{Embedder, EmbeddingConfig, HttpEmbedder};
pub use models::{AnalysisReport, BatchOutcome, CallInput, DetectionCatalog};
pub use stages::{PipelineConfig, Workflow, execute_batch};
pub use stats::{PipelineStats, StatsSnapshot};
