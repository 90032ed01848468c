//! Task graph construction and validation.
//!
//! Edges come from intersecting each task's read set with the suite's ids;
//! references to tables outside the suite stay on the task but carry no
//! edge. The graph must be acyclic before anything executes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ident::TableId;
use crate::task::Task;

#[derive(Debug)]
pub struct Dag {
    tasks: BTreeMap<TableId, Arc<Task>>,
    upstream: BTreeMap<TableId, BTreeSet<TableId>>,
    downstream: BTreeMap<TableId, BTreeSet<TableId>>,
}

impl Dag {
    /// Builds and validates the graph. Fails on any cycle, reporting every
    /// cycle found as an ordered id list.
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let ids: BTreeSet<TableId> = tasks.iter().map(|t| t.id.clone()).collect();
        if ids.len() != tasks.len() {
            // load_suite already rejects duplicates; this guards direct users
            return Err(Error::Load("duplicate task ids in suite".to_string()));
        }

        let mut upstream: BTreeMap<TableId, BTreeSet<TableId>> = BTreeMap::new();
        let mut downstream: BTreeMap<TableId, BTreeSet<TableId>> = BTreeMap::new();
        for task in &tasks {
            let deps: BTreeSet<TableId> = task
                .reads
                .iter()
                .filter(|r| ids.contains(*r) && **r != task.id)
                .cloned()
                .collect();
            for dep in &deps {
                downstream
                    .entry(dep.clone())
                    .or_default()
                    .insert(task.id.clone());
            }
            downstream.entry(task.id.clone()).or_default();
            upstream.insert(task.id.clone(), deps);
        }

        let dag = Self {
            tasks: tasks
                .into_iter()
                .map(|t| (t.id.clone(), Arc::new(t)))
                .collect(),
            upstream,
            downstream,
        };

        let cycles = dag.find_cycles();
        if !cycles.is_empty() {
            let rendered: Vec<String> = cycles
                .iter()
                .map(|c| {
                    let names: Vec<String> = c.iter().map(|id| id.to_string()).collect();
                    format!("[{}]", names.join(", "))
                })
                .collect();
            return Err(Error::Cycle(rendered.join("; ")));
        }

        Ok(dag)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TableId> {
        self.tasks.keys()
    }

    pub fn task(&self, id: &TableId) -> Option<&Arc<Task>> {
        self.tasks.get(id)
    }

    pub fn upstream(&self, id: &TableId) -> Option<&BTreeSet<TableId>> {
        self.upstream.get(id)
    }

    pub fn downstream(&self, id: &TableId) -> Option<&BTreeSet<TableId>> {
        self.downstream.get(id)
    }

    /// Every distinct dependency cycle, each as an ordered path closed by
    /// repeating its first id (`[s.a, s.b, s.a]`).
    pub fn find_cycles(&self) -> Vec<Vec<TableId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let mut colors: BTreeMap<&TableId, Color> =
            self.tasks.keys().map(|id| (id, Color::White)).collect();
        let mut seen: HashSet<Vec<TableId>> = HashSet::new();
        let mut cycles = Vec::new();

        for start in self.tasks.keys() {
            if colors[start] != Color::White {
                continue;
            }
            // Iterative DFS; the stack mirrors the current path so a back
            // edge can be unwound into the cycle it closes.
            let mut stack: Vec<(&TableId, Vec<&TableId>)> =
                vec![(start, self.upstream[start].iter().collect())];
            colors.insert(start, Color::Grey);

            while !stack.is_empty() {
                let next = stack.last_mut().and_then(|(_, pending)| pending.pop());
                let Some(next) = next else {
                    let (node, _) = stack.pop().expect("stack is non-empty");
                    colors.insert(node, Color::Black);
                    continue;
                };
                match colors[next] {
                    Color::White => {
                        colors.insert(next, Color::Grey);
                        stack.push((next, self.upstream[next].iter().collect()));
                    }
                    Color::Grey => {
                        let from = stack
                            .iter()
                            .position(|(n, _)| *n == next)
                            .expect("grey node is on the path");
                        let mut cycle: Vec<TableId> =
                            stack[from..].iter().map(|(n, _)| (*n).clone()).collect();
                        cycle.push(next.clone());
                        if seen.insert(normalize_cycle(&cycle)) {
                            cycles.push(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        cycles
    }

    /// The set of tasks a run will schedule: all of them, the explicit
    /// targets, or the targets closed under upstream when `dependencies`.
    pub fn execution_set(
        &self,
        targets: &[TableId],
        dependencies: bool,
    ) -> Result<BTreeSet<TableId>> {
        if targets.is_empty() {
            return Ok(self.tasks.keys().cloned().collect());
        }

        for target in targets {
            if !self.tasks.contains_key(target) {
                return Err(Error::Config(format!("unknown target {}", target)));
            }
        }

        let mut set: BTreeSet<TableId> = targets.iter().cloned().collect();
        if dependencies {
            let mut stack: Vec<TableId> = targets.to_vec();
            while let Some(id) = stack.pop() {
                for dep in &self.upstream[&id] {
                    if set.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }
        Ok(set)
    }
}

/// Rotation-invariant key for cycle deduplication: the same loop entered at
/// a different node is still one cycle.
fn normalize_cycle(cycle: &[TableId]) -> Vec<TableId> {
    let ring = &cycle[..cycle.len() - 1];
    let min = ring
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut normalized = Vec::with_capacity(ring.len());
    normalized.extend_from_slice(&ring[min..]);
    normalized.extend_from_slice(&ring[..min]);
    normalized
}
