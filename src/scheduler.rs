//! Concurrent DAG execution.
//!
//! The coordinator is a single event loop: it seeds a ready queue with
//! tasks that have no upstream inside the execution set, spawns one worker
//! future per ready task up to the concurrency cap, and reacts to
//! completion events. Workers own one pooled connection each and only ever
//! report events; all task-state bookkeeping happens here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assertions::{assertion_sql, AssertionContext};
use crate::config::{Config, Stage};
use crate::dag::Dag;
use crate::db::{Database, DbConn};
use crate::error::{Error, Phase, Result};
use crate::ident::TableId;
use crate::report::{RunReport, TaskReport};
use crate::sql::{bind_params, rewrite_schemas};
use crate::task::{Task, TaskState};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub stage: Stage,
    pub dev_schema: Option<String>,
    pub targets: Vec<TableId>,
    pub dependencies: bool,
    /// Recreate incremental tables instead of topping them up.
    pub refill: bool,
    /// Values bound into `$n` placeholders of incremental scripts.
    pub params: Vec<String>,
    /// Worker cap; defaults to the execution-set size.
    pub concurrency: Option<usize>,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stage: config.stage,
            dev_schema: config.dev_schema.clone(),
            targets: config.targets.clone(),
            dependencies: config.dependencies,
            refill: config.refill,
            params: config.params.clone(),
            concurrency: config.concurrency,
        }
    }
}

pub struct Scheduler {
    dag: Dag,
}

#[derive(Debug, Default)]
struct Timings {
    script: Option<Duration>,
    tests: Option<Duration>,
}

enum WorkerEvent {
    Progress {
        task: TableId,
        state: TaskState,
    },
    Done {
        task: TableId,
        result: Result<()>,
        timings: Timings,
    },
}

struct WorkerContext {
    db: Arc<dyn Database>,
    stage: Stage,
    dev_schema: Option<String>,
    execution_set: Arc<BTreeSet<TableId>>,
    params: Vec<String>,
    refill: bool,
    cancel: CancellationToken,
    events: mpsc::Sender<WorkerEvent>,
}

impl Scheduler {
    pub fn new(dag: Dag) -> Self {
        Self { dag }
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Runs the execution set to completion (every task `Success`, `Failed`
    /// or `Skipped`). Fails without executing anything on an unknown target
    /// or missing incremental parameters.
    pub async fn run(
        &self,
        db: Arc<dyn Database>,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let execution_set = Arc::new(
            self.dag
                .execution_set(&options.targets, options.dependencies)?,
        );
        self.validate_params(&execution_set, options)?;

        let mut states: BTreeMap<TableId, TaskState> = execution_set
            .iter()
            .map(|id| (id.clone(), TaskState::Pending))
            .collect();
        let mut pending_upstream: BTreeMap<TableId, BTreeSet<TableId>> = execution_set
            .iter()
            .map(|id| {
                let deps: BTreeSet<TableId> = self.dag.upstream(id).map_or_else(BTreeSet::new, |up| {
                    up.iter()
                        .filter(|u| execution_set.contains(*u))
                        .cloned()
                        .collect()
                });
                (id.clone(), deps)
            })
            .collect();

        let mut ready: BTreeSet<TableId> = BTreeSet::new();
        for (id, deps) in &pending_upstream {
            if deps.is_empty() {
                states.insert(id.clone(), TaskState::Ready);
                ready.insert(id.clone());
            }
        }

        let concurrency = options
            .concurrency
            .unwrap_or_else(|| execution_set.len())
            .max(1);
        let (events_tx, mut events_rx) =
            mpsc::channel::<WorkerEvent>(execution_set.len() * 4 + 1);

        let ctx = Arc::new(WorkerContext {
            db,
            stage: options.stage,
            dev_schema: options.dev_schema.clone(),
            execution_set: Arc::clone(&execution_set),
            params: options.params.clone(),
            refill: options.refill,
            cancel: cancel.clone(),
            events: events_tx,
        });

        let mut causes: BTreeMap<TableId, String> = BTreeMap::new();
        let mut timings: BTreeMap<TableId, Timings> = BTreeMap::new();
        let mut start_order: BTreeMap<TableId, usize> = BTreeMap::new();
        let mut in_flight = 0usize;

        loop {
            if !cancel.is_cancelled() {
                while in_flight < concurrency {
                    let Some(id) = ready.iter().next().cloned() else {
                        break;
                    };
                    ready.remove(&id);
                    start_order.insert(id.clone(), start_order.len());
                    let task = Arc::clone(self.dag.task(&id).expect("execution set task"));
                    info!(task = %id, "scheduling task for execution");
                    tokio::spawn(run_worker(task, Arc::clone(&ctx)));
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            let Some(event) = events_rx.recv().await else {
                break;
            };
            match event {
                WorkerEvent::Progress { task, state } => {
                    if !states.get(&task).is_some_and(|s| s.is_terminal()) {
                        states.insert(task, state);
                    }
                }
                WorkerEvent::Done {
                    task,
                    result,
                    timings: task_timings,
                } => {
                    in_flight -= 1;
                    timings.insert(task.clone(), task_timings);
                    match result {
                        Ok(()) => {
                            info!(task = %task, "task complete");
                            states.insert(task.clone(), TaskState::Success);
                            self.release_downstream(
                                &task,
                                &execution_set,
                                &mut states,
                                &mut pending_upstream,
                                &mut ready,
                            );
                        }
                        Err(error) => {
                            warn!(task = %task, error = %error, "task failed");
                            states.insert(task.clone(), TaskState::Failed);
                            causes.insert(task.clone(), cause_of(&error));
                            self.skip_downstream(&task, &execution_set, &mut states, &mut causes);
                        }
                    }
                }
            }
        }

        // Anything the run never reached was cut off by cancellation.
        for (id, state) in states.iter_mut() {
            if !state.is_terminal() {
                *state = TaskState::Failed;
                causes.insert(id.clone(), "cancelled".to_string());
            }
        }

        Ok(RunReport {
            tasks: states
                .into_iter()
                .map(|(id, state)| {
                    let t = timings.remove(&id).unwrap_or_default();
                    TaskReport {
                        cause: causes.remove(&id),
                        script_duration: t.script,
                        test_duration: t.tests,
                        start_order: start_order.get(&id).copied(),
                        id,
                        state,
                    }
                })
                .collect(),
        })
    }

    fn validate_params(
        &self,
        execution_set: &BTreeSet<TableId>,
        options: &RunOptions,
    ) -> Result<()> {
        for id in execution_set {
            let task = self.dag.task(id).expect("execution set task");
            if task.is_incremental && task.max_param as usize > options.params.len() {
                return Err(Error::Config(format!(
                    "incremental task {} references ${} but only {} parameter(s) were supplied",
                    id,
                    task.max_param,
                    options.params.len()
                )));
            }
        }
        Ok(())
    }

    fn release_downstream(
        &self,
        task: &TableId,
        execution_set: &BTreeSet<TableId>,
        states: &mut BTreeMap<TableId, TaskState>,
        pending_upstream: &mut BTreeMap<TableId, BTreeSet<TableId>>,
        ready: &mut BTreeSet<TableId>,
    ) {
        let Some(downstream) = self.dag.downstream(task) else {
            return;
        };
        for d in downstream {
            if !execution_set.contains(d) {
                continue;
            }
            let Some(waiting) = pending_upstream.get_mut(d) else {
                continue;
            };
            waiting.remove(task);
            if waiting.is_empty() && states.get(d) == Some(&TaskState::Pending) {
                states.insert(d.clone(), TaskState::Ready);
                ready.insert(d.clone());
            }
        }
    }

    /// Marks every transitive downstream task of a failure as skipped.
    /// Nothing downstream can be running: it was still waiting on this task.
    fn skip_downstream(
        &self,
        failed: &TableId,
        execution_set: &BTreeSet<TableId>,
        states: &mut BTreeMap<TableId, TaskState>,
        causes: &mut BTreeMap<TableId, String>,
    ) {
        let mut stack = vec![failed.clone()];
        while let Some(id) = stack.pop() {
            let Some(downstream) = self.dag.downstream(&id) else {
                continue;
            };
            for d in downstream {
                if !execution_set.contains(d) {
                    continue;
                }
                if matches!(states.get(d), Some(TaskState::Pending | TaskState::Ready)) {
                    warn!(task = %d, upstream = %failed, "skipping task due to upstream failure");
                    states.insert(d.clone(), TaskState::Skipped);
                    causes.insert(d.clone(), format!("upstream {} failed", failed));
                    stack.push(d.clone());
                }
            }
        }
    }
}

/// Why a task ended up `Failed`, as shown in the report.
fn cause_of(error: &Error) -> String {
    match error {
        Error::Cancelled => "cancelled".to_string(),
        other => other.to_string(),
    }
}

async fn run_worker(task: Arc<Task>, ctx: Arc<WorkerContext>) {
    let mut timings = Timings::default();
    let result = execute_task(&task, &ctx, &mut timings).await;
    let _ = ctx
        .events
        .send(WorkerEvent::Done {
            task: task.id.clone(),
            result,
            timings,
        })
        .await;
}

async fn execute_task(task: &Task, ctx: &WorkerContext, timings: &mut Timings) -> Result<()> {
    let mut conn = tokio::select! {
        conn = ctx.db.acquire() => conn?,
        _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
    };

    let finished = {
        let phases = run_phases(task, conn.as_mut(), ctx, timings);
        tokio::pin!(phases);
        tokio::select! {
            result = &mut phases => Some(result),
            _ = ctx.cancel.cancelled() => None,
        }
    };

    match finished {
        Some(result) => result,
        None => {
            if let Err(e) = conn.cancel().await {
                warn!(task = %task.id, error = %e, "query cancel failed");
            }
            Err(Error::Cancelled)
        }
    }
}

async fn run_phases(
    task: &Task,
    conn: &mut dyn DbConn,
    ctx: &WorkerContext,
    timings: &mut Timings,
) -> Result<()> {
    let assertion_ctx = AssertionContext {
        stage: ctx.stage,
        dev_schema: ctx.dev_schema.as_deref(),
        execution_set: &ctx.execution_set,
    };
    let target = assertion_ctx.resolve(&task.id);
    let (ddl_sql, insert_sql) = prepare_sql(task, ctx)?;

    let script_start = Instant::now();
    progress(ctx, task, TaskState::RunningDdl).await;
    if should_run_ddl(task, conn, ctx, &target).await? {
        conn.batch_execute(&ddl_sql)
            .await
            .map_err(|e| execution_error(task, Phase::Ddl, e))?;
    }

    progress(ctx, task, TaskState::RunningInsert).await;
    conn.batch_execute(&insert_sql)
        .await
        .map_err(|e| execution_error(task, Phase::Insert, e))?;
    conn.batch_execute(&format!("ANALYZE {};", target))
        .await
        .map_err(|e| execution_error(task, Phase::Analyze, e))?;
    timings.script = Some(script_start.elapsed());

    progress(ctx, task, TaskState::RunningTests).await;
    let test_start = Instant::now();
    let mut first_failure: Option<Error> = None;
    for directive in &task.tests {
        let sql = assertion_sql(directive, &task.id, &assertion_ctx);
        let count = conn
            .fetch_count(&sql)
            .await
            .map_err(|e| execution_error(task, Phase::Tests, e))?;
        if count != 0 {
            warn!(task = %task.id, test = %directive.name(), count,
                "test failed");
            first_failure.get_or_insert(Error::TestFailure {
                task: task.id.clone(),
                name: directive.name(),
                count,
            });
        }
    }
    timings.tests = Some(test_start.elapsed());

    match first_failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

/// Binds incremental parameters, then applies the dev rewrite, so parameter
/// values land as string literals the rewriter will not touch.
fn prepare_sql(task: &Task, ctx: &WorkerContext) -> Result<(String, String)> {
    let mut insert = task.insert_sql.clone();
    if task.is_incremental {
        insert = bind_params(&insert, &ctx.params)?;
    }
    let mut ddl = task.ddl_sql.clone();
    if let (Stage::Dev, Some(dev_schema)) = (ctx.stage, ctx.dev_schema.as_deref()) {
        ddl = rewrite_schemas(&ddl, &ctx.execution_set, dev_schema);
        insert = rewrite_schemas(&insert, &ctx.execution_set, dev_schema);
    }
    Ok((ddl, insert))
}

/// Incremental tasks keep their table across runs: without `--refill` the
/// DDL only runs when the target does not exist yet.
async fn should_run_ddl(
    task: &Task,
    conn: &mut dyn DbConn,
    ctx: &WorkerContext,
    target: &str,
) -> Result<bool> {
    if !task.is_incremental || ctx.refill {
        return Ok(true);
    }
    let (schema, table) = target.split_once('.').unwrap_or((target, ""));
    let sql = format!(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = '{}' AND table_name = '{}'",
        schema.replace('\'', "''"),
        table.replace('\'', "''")
    );
    let exists = conn
        .fetch_count(&sql)
        .await
        .map_err(|e| execution_error(task, Phase::Ddl, e))?;
    Ok(exists == 0)
}

fn execution_error(task: &Task, phase: Phase, error: Error) -> Error {
    match error {
        Error::Database(message) => Error::Execution {
            task: task.id.clone(),
            phase,
            message,
        },
        other => other,
    }
}

async fn progress(ctx: &WorkerContext, task: &Task, state: TaskState) {
    let _ = ctx
        .events
        .send(WorkerEvent::Progress {
            task: task.id.clone(),
            state,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockDatabase;
    use crate::suite::load_suite;
    use crate::task::TestDirective;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        ddl: TempDir,
        insert: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ddl: TempDir::new().unwrap(),
                insert: TempDir::new().unwrap(),
            }
        }

        fn add(&self, stem: &str, ddl: &str, insert: &str) {
            fs::write(self.ddl.path().join(format!("{}.sql", stem)), ddl).unwrap();
            fs::write(self.insert.path().join(format!("{}.sql", stem)), insert).unwrap();
        }

        fn scheduler(&self) -> Scheduler {
            let tasks = load_suite(self.ddl.path(), self.insert.path()).unwrap();
            Scheduler::new(Dag::build(tasks).unwrap())
        }
    }

    fn simple_pair(fixture: &Fixture, stem: &str, reads: &[&str]) {
        let from = if reads.is_empty() {
            String::new()
        } else {
            let mut clause = format!(" FROM {}", reads[0]);
            for read in &reads[1..] {
                clause.push_str(&format!(" JOIN {} ON true", read));
            }
            clause
        };
        fixture.add(
            stem,
            &format!("DROP TABLE IF EXISTS {0}; CREATE TABLE {0} (id int);", stem),
            &format!("INSERT INTO {} SELECT 1{};", stem, from),
        );
    }

    async fn run(
        scheduler: &Scheduler,
        db: &MockDatabase,
        options: RunOptions,
    ) -> RunReport {
        scheduler
            .run(Arc::new(db.clone()), &options, CancellationToken::new())
            .await
            .unwrap()
    }

    fn position(log: &[String], needle: &str) -> usize {
        log.iter()
            .position(|sql| sql.contains(needle))
            .unwrap_or_else(|| panic!("{:?} not dispatched in {:#?}", needle, log))
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_total_order() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.a", &[]);
        simple_pair(&fixture, "s.b", &["s.a"]);
        simple_pair(&fixture, "s.c", &["s.b"]);

        let db = MockDatabase::new();
        let report = run(&fixture.scheduler(), &db, RunOptions::default()).await;

        assert!(report.all_succeeded());
        assert_eq!(report.exit_code(), 0);

        let log = db.executed();
        assert!(position(&log, "INSERT INTO s.a") < position(&log, "CREATE TABLE s.b"));
        assert!(position(&log, "INSERT INTO s.b") < position(&log, "CREATE TABLE s.c"));
    }

    #[tokio::test]
    async fn test_task_phases_run_in_order_on_one_connection() {
        let fixture = Fixture::new();
        fixture.add(
            "s.a",
            "DROP TABLE IF EXISTS s.a; CREATE TABLE s.a (id int);",
            "/* granularity: id */\nINSERT INTO s.a SELECT 1;",
        );

        let db = MockDatabase::new();
        run(&fixture.scheduler(), &db, RunOptions::default()).await;

        let log = db.executed();
        let ddl = position(&log, "CREATE TABLE s.a");
        let insert = position(&log, "INSERT INTO s.a");
        let analyze = position(&log, "ANALYZE s.a");
        let test = position(&log, "GROUP BY id");
        assert!(ddl < insert && insert < analyze && analyze < test);
    }

    #[tokio::test]
    async fn test_diamond_dev_rewrites_execution_set_only() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.a", &["raw.x"]);
        simple_pair(&fixture, "s.b", &["raw.x"]);
        simple_pair(&fixture, "s.c", &["s.a"]);
        fixture.add(
            "s.d",
            "DROP TABLE IF EXISTS s.d; CREATE TABLE s.d (id int);",
            "INSERT INTO s.d SELECT 1 FROM s.c JOIN s.b ON true JOIN raw.z ON true;",
        );

        let db = MockDatabase::new();
        let options = RunOptions {
            stage: Stage::Dev,
            dev_schema: Some("dv".to_string()),
            targets: vec![TableId::new("s", "d")],
            dependencies: true,
            ..Default::default()
        };
        let report = run(&fixture.scheduler(), &db, options).await;
        assert!(report.all_succeeded());

        let inserts = db.executed_matching("INSERT INTO dv.d");
        assert_eq!(inserts.len(), 1);
        assert!(inserts[0].contains("FROM dv.c"));
        assert!(inserts[0].contains("JOIN dv.b"));
        assert!(inserts[0].contains("JOIN raw.z"));
    }

    #[tokio::test]
    async fn test_partial_target_without_dependencies_leaves_upstream_alone() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.a", &["raw.x"]);
        simple_pair(&fixture, "s.c", &["s.a"]);

        let db = MockDatabase::new();
        let options = RunOptions {
            stage: Stage::Dev,
            dev_schema: Some("dv".to_string()),
            targets: vec![TableId::new("s", "c")],
            ..Default::default()
        };
        let report = run(&fixture.scheduler(), &db, options).await;
        assert!(report.all_succeeded());

        // s.a is not in the execution set, so the reference stays put.
        let inserts = db.executed_matching("INSERT INTO dv.c");
        assert_eq!(inserts.len(), 1);
        assert!(inserts[0].contains("FROM s.a"));
        assert!(db.executed_matching("CREATE TABLE dv.a").is_empty());
    }

    #[tokio::test]
    async fn test_failed_test_gates_downstream() {
        let fixture = Fixture::new();
        fixture.add(
            "s.a",
            "DROP TABLE IF EXISTS s.a; CREATE TABLE s.a (id int);",
            "/* granularity: id */\nINSERT INTO s.a SELECT 1;",
        );
        simple_pair(&fixture, "s.b", &["s.a"]);

        let db = MockDatabase::new();
        db.count_matching("GROUP BY id", 2);
        let report = run(&fixture.scheduler(), &db, RunOptions::default()).await;

        assert_eq!(report.exit_code(), 2);
        let a = report.tasks.iter().find(|t| t.id.table == "a").unwrap();
        let b = report.tasks.iter().find(|t| t.id.table == "b").unwrap();
        assert_eq!(a.state, TaskState::Failed);
        assert!(a.cause.as_deref().unwrap().contains("granularity(id)"));
        assert_eq!(b.state, TaskState::Skipped);
        assert!(b.cause.as_deref().unwrap().contains("s.a"));
        assert!(db.executed_matching("INSERT INTO s.b").is_empty());
    }

    #[tokio::test]
    async fn test_driver_failure_skips_transitive_downstream_but_not_siblings() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.a", &[]);
        simple_pair(&fixture, "s.b", &["s.a"]);
        simple_pair(&fixture, "s.c", &["s.b"]);
        simple_pair(&fixture, "s.z", &[]);

        let db = MockDatabase::new();
        db.fail_matching("INSERT INTO s.a", "relation is borked");
        let report = run(&fixture.scheduler(), &db, RunOptions::default()).await;

        let state = |table: &str| {
            report
                .tasks
                .iter()
                .find(|t| t.id.table == table)
                .unwrap()
                .state
        };
        assert_eq!(state("a"), TaskState::Failed);
        assert_eq!(state("b"), TaskState::Skipped);
        assert_eq!(state("c"), TaskState::Skipped);
        assert_eq!(state("z"), TaskState::Success);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_incremental_binds_params_on_delete_and_insert() {
        let fixture = Fixture::new();
        fixture.add(
            "s.d",
            "DROP TABLE IF EXISTS s.d; CREATE TABLE s.d (id int, d date);",
            "--sql-scheduler-incremental\nDELETE FROM s.d WHERE d >= $1;\nINSERT INTO s.d SELECT 1, d FROM raw.x WHERE d >= $1 AND d < $2;",
        );

        let db = MockDatabase::new();
        let options = RunOptions {
            params: vec!["2024-01-01".to_string(), "2024-01-31".to_string()],
            refill: true,
            ..Default::default()
        };
        let report = run(&fixture.scheduler(), &db, options).await;
        assert!(report.all_succeeded());

        let script = &db.executed_matching("DELETE FROM s.d")[0];
        assert!(script.contains("d >= '2024-01-01'"));
        assert!(script.contains("d < '2024-01-31'"));
        assert!(!script.contains("$1"));
    }

    #[tokio::test]
    async fn test_incremental_missing_params_fails_before_executing() {
        let fixture = Fixture::new();
        fixture.add(
            "s.d",
            "CREATE TABLE s.d (id int);",
            "--sql-scheduler-incremental\nINSERT INTO s.d SELECT $1;",
        );

        let db = MockDatabase::new();
        let err = fixture
            .scheduler()
            .run(
                Arc::new(db.clone()),
                &RunOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_skips_ddl_when_table_exists() {
        let fixture = Fixture::new();
        fixture.add(
            "s.d",
            "DROP TABLE IF EXISTS s.d; CREATE TABLE s.d (id int);",
            "--sql-scheduler-incremental\nINSERT INTO s.d SELECT 1;",
        );

        let db = MockDatabase::new();
        db.count_matching("information_schema.tables", 1);
        let report = run(&fixture.scheduler(), &db, RunOptions::default()).await;
        assert!(report.all_succeeded());
        assert!(db.executed_matching("CREATE TABLE s.d").is_empty());
        assert_eq!(db.executed_matching("INSERT INTO s.d").len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_runs_ddl_when_table_missing() {
        let fixture = Fixture::new();
        fixture.add(
            "s.d",
            "DROP TABLE IF EXISTS s.d; CREATE TABLE s.d (id int);",
            "--sql-scheduler-incremental\nINSERT INTO s.d SELECT 1;",
        );

        let db = MockDatabase::new();
        let report = run(&fixture.scheduler(), &db, RunOptions::default()).await;
        assert!(report.all_succeeded());
        assert_eq!(db.executed_matching("CREATE TABLE s.d").len(), 1);
    }

    #[tokio::test]
    async fn test_refill_recreates_incremental_table_without_existence_check() {
        let fixture = Fixture::new();
        fixture.add(
            "s.d",
            "DROP TABLE IF EXISTS s.d; CREATE TABLE s.d (id int);",
            "--sql-scheduler-incremental\nINSERT INTO s.d SELECT 1;",
        );

        let db = MockDatabase::new();
        let options = RunOptions {
            refill: true,
            ..Default::default()
        };
        run(&fixture.scheduler(), &db, options).await;
        assert!(db.executed_matching("information_schema.tables").is_empty());
        assert_eq!(db.executed_matching("CREATE TABLE s.d").len(), 1);
    }

    #[tokio::test]
    async fn test_relationship_foreign_rewritten_in_dev_when_in_execution_set() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.b", &[]);
        fixture.add(
            "s.a",
            "DROP TABLE IF EXISTS s.a; CREATE TABLE s.a (b_id int);",
            "/* relationship: b_id = s.b.id */\nINSERT INTO s.a SELECT 1 FROM s.b;",
        );

        let db = MockDatabase::new();
        let options = RunOptions {
            stage: Stage::Dev,
            dev_schema: Some("dv".to_string()),
            ..Default::default()
        };
        let report = run(&fixture.scheduler(), &db, options).await;
        assert!(report.all_succeeded());

        let tests = db.executed_matching("NOT IN");
        assert_eq!(tests.len(), 1);
        assert!(tests[0].contains("FROM dv.a"));
        assert!(tests[0].ends_with("(SELECT id FROM dv.b)"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_marks_everything_failed() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.a", &[]);
        simple_pair(&fixture, "s.b", &["s.a"]);

        let db = MockDatabase::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = fixture
            .scheduler()
            .run(Arc::new(db.clone()), &RunOptions::default(), cancel)
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 130);
        for task in &report.tasks {
            assert_eq!(task.state, TaskState::Failed);
            assert_eq!(task.cause.as_deref(), Some("cancelled"));
        }
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_one_serializes_independent_tasks() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.a", &[]);
        simple_pair(&fixture, "s.b", &[]);
        simple_pair(&fixture, "s.c", &[]);

        let db = MockDatabase::new();
        let options = RunOptions {
            concurrency: Some(1),
            ..Default::default()
        };
        let report = run(&fixture.scheduler(), &db, options).await;
        assert!(report.all_succeeded());

        // With one worker the ready queue drains in id order, so whole task
        // blocks appear back to back.
        let log = db.executed();
        assert!(position(&log, "ANALYZE s.a") < position(&log, "CREATE TABLE s.b"));
        assert!(position(&log, "ANALYZE s.b") < position(&log, "CREATE TABLE s.c"));
    }

    #[tokio::test]
    async fn test_unknown_target_fails_before_executing() {
        let fixture = Fixture::new();
        simple_pair(&fixture, "s.a", &[]);

        let db = MockDatabase::new();
        let options = RunOptions {
            targets: vec![TableId::new("s", "missing")],
            ..Default::default()
        };
        let err = fixture
            .scheduler()
            .run(Arc::new(db.clone()), &options, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("s.missing"));
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_tests_run_in_directive_order_and_all_are_dispatched() {
        let fixture = Fixture::new();
        fixture.add(
            "s.a",
            "DROP TABLE IF EXISTS s.a; CREATE TABLE s.a (id int);",
            "/*\ngranularity: id\nnot_null: id\n*/\nINSERT INTO s.a SELECT 1;",
        );

        let db = MockDatabase::new();
        db.count_matching("GROUP BY id", 1);
        let report = run(&fixture.scheduler(), &db, RunOptions::default()).await;

        // The granularity failure does not stop the not_null test.
        let log = db.executed();
        assert!(position(&log, "GROUP BY id") < position(&log, "IS NULL"));
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_report_cause_names_failing_test_directive() {
        let fixture = Fixture::new();
        fixture.add(
            "s.a",
            "CREATE TABLE s.a (id int);",
            "/* not_null: id */\nINSERT INTO s.a SELECT 1;",
        );

        let db = MockDatabase::new();
        db.count_matching("IS NULL", 7);
        let report = run(&fixture.scheduler(), &db, RunOptions::default()).await;

        let a = &report.tasks[0];
        assert_eq!(a.state, TaskState::Failed);
        let cause = a.cause.as_deref().unwrap();
        assert!(cause.contains("not_null(id)"));
        assert!(cause.contains('7'));
    }

    #[test]
    fn test_run_options_from_config_roundtrip() {
        let dirs = TempDir::new().unwrap();
        let config = Config {
            ddl_directory: dirs.path().to_path_buf(),
            insert_directory: dirs.path().to_path_buf(),
            dsn: "postgres://u@localhost/db".to_string(),
            stage: Stage::Dev,
            dev_schema: Some("dv".to_string()),
            targets: vec![TableId::new("s", "a")],
            dependencies: true,
            check: false,
            refill: true,
            params: vec!["p".to_string()],
            concurrency: Some(3),
            log_format: crate::config::LogFormat::Text,
        };
        let options = RunOptions::from_config(&config);
        assert_eq!(options.stage, Stage::Dev);
        assert_eq!(options.dev_schema.as_deref(), Some("dv"));
        assert_eq!(options.targets, vec![TableId::new("s", "a")]);
        assert!(options.dependencies);
        assert!(options.refill);
        assert_eq!(options.params, vec!["p".to_string()]);
        assert_eq!(options.concurrency, Some(3));
    }

    #[test]
    fn test_directive_name_in_cause_is_stable() {
        let d = TestDirective::Granularity {
            columns: vec!["id".into()],
        };
        assert_eq!(d.name(), "granularity(id)");
    }
}
