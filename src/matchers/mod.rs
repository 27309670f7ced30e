pub mod embedding;
pub mod rule;
pub mod semantic;
pub mod text;

pub use embedding::*;
pub use rule::*;
pub use semantic::*;
