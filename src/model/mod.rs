pub mod epic;
pub mod repository;
pub mod task;

pub use epic::{Epic, Story};
pub use repository::{Repository, RepositoryKind};
pub use task::{Continuation, PhaseState, Priority, Task, TaskStatus, Usage};
