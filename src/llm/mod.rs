pub mod client;
pub mod prompts;
pub mod retry;
pub mod validation;
pub mod validator;

pub use client::*;
pub use prompts::*;
pub use retry::*;
pub use validation::*;
pub use validator::*;
