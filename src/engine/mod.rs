//! Engine module: planning, task vocabulary, progress, and the CLI surface.

pub mod arg_parser;
pub mod cli;
pub mod planner;
pub mod progress;
pub mod tasks;

// Re-export commonly used items
pub use arg_parser::Cli;
pub use cli::{handle_install, setup_ctrlc_handler};
pub use planner::*;
pub use progress::*;
pub use tasks::*;
