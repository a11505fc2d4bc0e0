//! Errors raised while submitting and awaiting task runs.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum TaskError {
    /// The run reached the `Failed` terminal status.
    #[error("Task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    /// The run reached the `Crashed` terminal status.
    #[error("Task {task} crashed: {message}")]
    TaskCrashed { task: String, message: String },

    /// A `run-command` run finished without a command id.
    #[error("Task {task} did not start the command: {message}")]
    CommandNotStarted { task: String, message: String },

    #[error("Task {task} completed but no output returned")]
    NoOutput { task: String },

    #[error("Task {task} did not reach a terminal status after {attempts} polls")]
    Timeout { task: String, attempts: u32 },

    #[error("Unknown task: {task}")]
    UnknownTask { task: String },

    #[error("Invalid payload for {task}: {message}")]
    InvalidPayload { task: String, message: String },

    /// The task client itself failed (unknown run, bad output shape).
    #[error("Task client error: {message}")]
    Client { message: String },
}

impl TaskError {
    pub(crate) fn task_failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            message: message.into(),
        }
    }

    pub(crate) fn task_crashed(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskCrashed {
            task: task.into(),
            message: message.into(),
        }
    }

    pub(crate) fn command_not_started(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandNotStarted {
            task: task.into(),
            message: message.into(),
        }
    }

    pub(crate) fn no_output(task: impl Into<String>) -> Self {
        Self::NoOutput { task: task.into() }
    }

    pub(crate) fn timeout(task: impl Into<String>, attempts: u32) -> Self {
        Self::Timeout {
            task: task.into(),
            attempts,
        }
    }

    pub(crate) fn unknown_task(task: impl Into<String>) -> Self {
        Self::UnknownTask { task: task.into() }
    }

    pub(crate) fn invalid_payload(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            task: task.into(),
            message: message.into(),
        }
    }

    pub(crate) fn client(message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
        }
    }

    /// Returns true for the two terminal failure statuses.
    pub(crate) fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::TaskFailed { .. } | Self::TaskCrashed { .. })
    }

    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn is_command_not_started(&self) -> bool {
        matches!(self, Self::CommandNotStarted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_task() {
        let err = TaskError::task_failed("run-command", "boom");
        assert_eq!(err.to_string(), "Task run-command failed: boom");
        assert!(err.is_terminal_failure());

        let err = TaskError::timeout("write-files", 1200);
        assert!(err.to_string().contains("write-files"));
        assert!(err.is_timeout());
        assert!(!err.is_terminal_failure());
    }
}
