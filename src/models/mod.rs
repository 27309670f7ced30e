pub mod catalog;
pub mod metrics;
pub mod report;
pub mod signal;
pub mod transcript;

pub use catalog::*;
pub use metrics::*;
pub use report::*;
pub use signal::*;
pub use transcript::*;
