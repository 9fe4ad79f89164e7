pub mod metrics;
pub mod request;
pub mod stage;
pub mod task;

pub use metrics::Metrics;
pub use request::{ObjectLocation, RequestArg, RequestError, Resolved, STORAGE_MARKER};
pub use stage::{InvalidTransition, Stage, StageEvent};
pub use task::{ExecutableKind, FileRef, HandlerInstance, TaskId, TaskOptions, TaskRequest};
