pub mod batch;
pub mod category;
pub mod fusion;
pub mod workflow;

pub use batch::*;
pub use category::*;
pub use fusion::*;
pub use workflow::*;
