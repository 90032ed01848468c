//! A task runner/scheduler for SQL scripts against a Postgres/Redshift
//! database. Each managed table has a DDL script and an INSERT script;
//! dependencies between tasks are inferred from the SQL itself and tasks
//! run concurrently wherever the dependency graph allows.

pub mod assertions;
pub mod config;
pub mod dag;
pub mod db;
pub mod error;
pub mod ident;
pub mod report;
pub mod scheduler;
pub mod sql;
pub mod suite;
pub mod task;

pub use config::{Config, LogFormat, Stage};
pub use dag::Dag;
pub use db::{Database, DbConn, MockDatabase, PostgresPool};
pub use error::{Error, Phase, Result};
pub use ident::TableId;
pub use report::{RunReport, TaskReport};
pub use scheduler::{RunOptions, Scheduler};
pub use suite::load_suite;
pub use task::{Task, TaskState, TestDirective};
