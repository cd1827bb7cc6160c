//! Pipeline components: channels and shared state, scratch pool, and the
//! executor orchestrator.

pub mod context;
pub mod orchestrator;
pub mod scratch;

pub use context::{ExecutorChannels, ExecutorShared, InstallPaths, create_executor_channels};
pub use orchestrator::Executor;
pub use scratch::ScratchPool;
