//! Task graph errors

use thiserror::Error;

use crate::graph::TaskId;

/// Task graph result type
pub type Result<T> = std::result::Result<T, Error>;

/// Task graph errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("cycle detected in frame graph: {involved:?}")]
    CycleDetected { involved: Vec<TaskId> },

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("worker task {task} depends on main-thread task {dependency}")]
    MainToWorkerDependency { task: TaskId, dependency: TaskId },
}
