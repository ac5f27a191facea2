pub mod registry;
pub mod slots;
pub mod task;

pub use registry::{RegistrySnapshot, TaskRegistry, Transition};
pub use slots::{SlotPool, SlotStatus};
pub use task::{FailureKind, Sample, Task, TaskHandle, TaskState};
