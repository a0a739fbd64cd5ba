//! Chain of trust across tasks
//!
//! - `graph`: the decision task's task graph and build selection
//! - `queue`: task status and definitions
//! - `walker`: node building, chain generation and chain verification

pub mod graph;
pub mod queue;
pub mod walker;

pub use graph::{find_dependent_builds, GraphTask, TaskGraph};
pub use queue::{DirectoryQueue, TaskQueue, TaskStatus};
pub use walker::{ChainNode, ChainWalker};
