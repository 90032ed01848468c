//! Post-run summary: one row per task ordered by start time, then the
//! failure lists a user actually scans for.

use std::time::Duration;

use crate::ident::TableId;
use crate::task::TaskState;

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: TableId,
    pub state: TaskState,
    /// Why the task failed or was skipped.
    pub cause: Option<String>,
    /// DDL + INSERT (+ ANALYZE) wall time.
    pub script_duration: Option<Duration>,
    pub test_duration: Option<Duration>,
    /// Position in the run's start order; `None` for tasks that never ran.
    pub start_order: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Success)
    }

    pub fn cancelled(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| t.cause.as_deref() == Some("cancelled"))
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled() {
            130
        } else if self.all_succeeded() {
            0
        } else {
            2
        }
    }

    pub fn render(&self) -> String {
        let mut ran: Vec<&TaskReport> = self
            .tasks
            .iter()
            .filter(|t| t.start_order.is_some())
            .collect();
        ran.sort_by_key(|t| t.start_order);

        let rows: Vec<[String; 4]> = ran
            .iter()
            .map(|t| {
                [
                    t.id.to_string(),
                    t.state.to_string(),
                    render_duration(t.script_duration),
                    render_duration(t.test_duration),
                ]
            })
            .collect();
        let mut out = render_table(
            ["task_id", "state", "script (s)", "tests (s)"],
            &rows,
        );

        let failed: Vec<&TaskReport> = self
            .sorted_by_id()
            .into_iter()
            .filter(|t| t.state == TaskState::Failed)
            .collect();
        if !failed.is_empty() {
            out.push_str(&format!("\n{} task(s) failed:\n", failed.len()));
            for t in failed {
                out.push_str(&format!(
                    " - {}: {}\n",
                    t.id,
                    t.cause.as_deref().unwrap_or("unknown")
                ));
            }
        }

        let skipped: Vec<&TaskReport> = self
            .sorted_by_id()
            .into_iter()
            .filter(|t| t.state == TaskState::Skipped)
            .collect();
        if !skipped.is_empty() {
            out.push_str("\nTasks not run because of upstream failures:\n");
            for t in skipped {
                out.push_str(&format!(" - {}\n", t.id));
            }
        }

        if self.all_succeeded() {
            out.push_str(&format!(
                "\nAll {} task(s) run successfully.\n",
                self.tasks.len()
            ));
        }

        out
    }

    fn sorted_by_id(&self) -> Vec<&TaskReport> {
        let mut tasks: Vec<&TaskReport> = self.tasks.iter().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

fn render_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => format!("{:.1}", d.as_secs_f64()),
        None => "-".to_string(),
    }
}

fn render_table<const N: usize>(header: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths: [usize; N] = [0; N];
    for (i, h) in header.iter().enumerate() {
        widths[i] = h.len();
    }
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    let render_row = |cells: &[String; N]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };

    let header_cells: [String; N] = header.map(|h| h.to_string());
    out.push_str(&render_row(&header_cells));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("|-{}-|\n", rule.join("-|-")));
    for row in rows {
        out.push_str(&render_row(row));
    }
    out
}
