//! Turns in-script test directives into COUNT queries. Every generated
//! query returns a single integer; anything non-zero fails the test.

use std::collections::BTreeSet;

use crate::config::Stage;
use crate::ident::TableId;
use crate::task::TestDirective;

/// Where a run's assertions should point: in dev stage the target table —
/// and any foreign table participating in the run — lives under the dev
/// schema instead of its own.
pub struct AssertionContext<'a> {
    pub stage: Stage,
    pub dev_schema: Option<&'a str>,
    pub execution_set: &'a BTreeSet<TableId>,
}

impl<'a> AssertionContext<'a> {
    /// The schema-qualified name a suite table resolves to in this run.
    pub fn resolve(&self, id: &TableId) -> String {
        match (self.stage, self.dev_schema) {
            (Stage::Dev, Some(dev)) if self.execution_set.contains(id) => {
                format!("{}.{}", dev, id.table)
            }
            _ => id.qualified(),
        }
    }
}

pub fn assertion_sql(directive: &TestDirective, target: &TableId, ctx: &AssertionContext) -> String {
    // The target itself always resolves through the run context; it is in
    // the execution set by construction.
    let table = ctx.resolve(target);
    match directive {
        TestDirective::Granularity { columns } => {
            let cols = columns.join(", ");
            format!(
                "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {} HAVING COUNT(*) > 1) s",
                table, cols
            )
        }
        TestDirective::NotNull { columns } => {
            let clauses: Vec<String> = columns.iter().map(|c| format!("({} IS NULL)", c)).collect();
            format!(
                "SELECT COUNT(*) FROM {} WHERE {}",
                table,
                clauses.join(" OR ")
            )
        }
        TestDirective::Relationship {
            column,
            foreign,
            foreign_column,
        } => {
            let foreign_table = ctx.resolve(foreign);
            format!(
                "SELECT COUNT(*) FROM {} WHERE {} IS NOT NULL AND {} NOT IN (SELECT {} FROM {})",
                table, column, column, foreign_column, foreign_table
            )
        }
    }
}
