pub mod config;
pub mod free_space;
pub(crate) mod gogdl_toml;
pub mod logger;
pub mod paths;

pub use config::*;
pub use free_space::{available_space, check_free_space};
pub use logger::setup_logging;
pub use paths::*;
