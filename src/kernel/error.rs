//! Task management error types

use std::fmt;

/// Task management result type
pub type TaskResult<T> = Result<T, TaskError>;

/// Recoverable task management errors
///
/// Programmer errors (destroying the running task, blocking a task that is
/// not runnable, ...) are not represented here: they panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Every slot of the task table is in use
    TooManyTasks,
    /// A backing page could not be allocated
    NoMemory,
    /// The operation was refused (root task, dead pager, bad argument)
    InvalidArgument,
    /// Other tasks still use this task as their pager
    StillUsed,
    /// Configuration rejected by validation
    InvalidConfig(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::TooManyTasks => write!(f, "too many tasks"),
            TaskError::NoMemory => write!(f, "out of memory"),
            TaskError::InvalidArgument => write!(f, "invalid argument"),
            TaskError::StillUsed => write!(f, "task is still used"),
            TaskError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::InvalidConfig(e.to_string())
    }
}
