pub mod capture;
pub mod error;
pub mod limiter;
pub mod memory;
pub mod output;
pub mod paths;
pub mod scheduler;
pub mod screen;
pub mod store;
pub mod term;

pub use capture::{spawn_child, ChildRecord, SpawnContext};
pub use error::FanoutError;
pub use limiter::{Limiter, ENV_CHILD_LIMIT_SOCKET};
pub use memory::{ChildId, MemoryBudget};
pub use output::{ChildOutput, OutputMode};
pub use scheduler::Scheduler;
pub use screen::Screen;
pub use store::{ChunkStore, STDERR_TAG, STDOUT_TAG};
pub use term::TerminalGuard;
