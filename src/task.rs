use std::fmt;

use crate::ident::TableId;

/// One managed unit of work: a target table with its DDL and INSERT scripts,
/// inferred read set, and declared assertions. Identity fields only; runtime
/// state lives with the scheduler.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TableId,
    pub ddl_sql: String,
    pub insert_sql: String,
    /// Every schema-qualified table the INSERT reads, suite member or not.
    pub reads: Vec<TableId>,
    pub tests: Vec<TestDirective>,
    /// Marked by a leading `--sql-scheduler-incremental` comment.
    pub is_incremental: bool,
    /// Highest `$n` the INSERT script references.
    pub max_param: u32,
}

/// Lifecycle states. Transitions are monotonic:
/// `Pending → Ready → RunningDdl → RunningInsert → RunningTests`
/// ending in one of `Success`, `Failed`, `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    RunningDdl,
    RunningInsert,
    RunningTests,
    Success,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed | TaskState::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::RunningDdl => "running ddl",
            TaskState::RunningInsert => "running insert",
            TaskState::RunningTests => "running tests",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

/// An assertion declared in an INSERT script, run after a successful insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestDirective {
    /// The listed columns form a unique key.
    Granularity { columns: Vec<String> },
    /// None of the listed columns is ever NULL.
    NotNull { columns: Vec<String> },
    /// Every non-NULL value of `column` exists in the foreign column.
    Relationship {
        column: String,
        foreign: TableId,
        foreign_column: String,
    },
}

impl TestDirective {
    /// Short name used in failure reports and logs.
    pub fn name(&self) -> String {
        match self {
            TestDirective::Granularity { columns } => {
                format!("granularity({})", columns.join(","))
            }
            TestDirective::NotNull { columns } => format!("not_null({})", columns.join(",")),
            TestDirective::Relationship {
                column,
                foreign,
                foreign_column,
            } => format!("relationship({} = {}.{})", column, foreign, foreign_column),
        }
    }
}

impl fmt::Display for TestDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestDirective::Granularity { columns } => {
                write!(f, "granularity: {}", columns.join(", "))
            }
            TestDirective::NotNull { columns } => write!(f, "not_null: {}", columns.join(", ")),
            TestDirective::Relationship {
                column,
                foreign,
                foreign_column,
            } => write!(f, "relationship: {} = {}.{}", column, foreign, foreign_column),
        }
    }
}
