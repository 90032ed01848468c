use thiserror::Error;

use crate::ident::TableId;

/// Phase of task execution an error occurred in, carried so user-visible
/// messages always name what was running when the driver failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ddl,
    Insert,
    Analyze,
    Tests,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Ddl => "DDL",
            Phase::Insert => "INSERT",
            Phase::Analyze => "ANALYZE",
            Phase::Tests => "tests",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("load error: {0}")]
    Load(String),

    #[error("circular dependencies found: {0}")]
    Cycle(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("task {task} failed during {phase}: {message}")]
    Execution {
        task: TableId,
        phase: Phase,
        message: String,
    },

    #[error("task {task} failed test {name}: {count} offending rows")]
    TestFailure {
        task: TableId,
        name: String,
        count: i64,
    },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Process exit code for this error per the CLI contract: 1 for anything
    /// caught before execution, 2 for execution failures, 130 for an
    /// interrupted run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Load(_) | Error::Cycle(_) | Error::Config(_) => 1,
            Error::Database(_) | Error::Execution { .. } | Error::TestFailure { .. } => 2,
            Error::Cancelled => 130,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
