//! Dependency graph over backlog tasks: blocker resolution, cycle detection,
//! downstream chains and bottleneck ranking.
//!
//! The graph is rebuilt from a task snapshot on every call site and never
//! cached, so readiness decisions always see the current edges.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tiller_core::{Task, TaskId, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("task id is empty (title: {title:?})")]
    EmptyTaskId { title: String },
    #[error("task id {task_id} appears more than once in the backlog")]
    DuplicateTask { task_id: TaskId },
    #[error("dependency cycle: {}", format_path(path))]
    Cycle { path: Vec<TaskId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub id: TaskId,
    pub status: TaskStatus,
    pub blocked_by: Vec<TaskId>,
    pub prd: Option<String>,
    pub epic: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<TaskId>,
    pub tasks: HashMap<TaskId, TaskNode>,
    /// Inverse edges: blocker id to the tasks it blocks, in insertion order.
    pub blocks: HashMap<TaskId, Vec<TaskId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainPath {
    /// Number of nodes on the chain, including its start.
    pub length: usize,
    pub path: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpactScore {
    pub task_id: TaskId,
    pub direct_dependents: usize,
    pub longest_chain: usize,
    pub score: usize,
}

pub fn build_graph(tasks: &[Task]) -> Result<DependencyGraph, GraphError> {
    let mut graph = DependencyGraph::default();

    for task in tasks {
        if task.id.0.trim().is_empty() {
            return Err(GraphError::EmptyTaskId {
                title: task.title.clone(),
            });
        }
        if graph.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask {
                task_id: task.id.clone(),
            });
        }
        let mut blocked_by: Vec<TaskId> = Vec::new();
        for blocker in &task.blocked_by {
            if !blocked_by.contains(blocker) {
                blocked_by.push(blocker.clone());
            }
        }
        graph.order.push(task.id.clone());
        graph.tasks.insert(
            task.id.clone(),
            TaskNode {
                id: task.id.clone(),
                status: task.status,
                blocked_by,
                prd: task.parent.prd.clone(),
                epic: task.parent.epic.clone(),
            },
        );
    }

    for id in &graph.order {
        let Some(node) = graph.tasks.get(id) else {
            continue;
        };
        for blocker in &node.blocked_by {
            graph
                .blocks
                .entry(blocker.clone())
                .or_default()
                .push(id.clone());
        }
    }

    Ok(graph)
}

impl DependencyGraph {
    /// Task ids in backlog order.
    pub fn ids(&self) -> &[TaskId] {
        &self.order
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    pub fn dependents(&self, id: &TaskId) -> &[TaskId] {
        self.blocks.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks belonging to `epic_id`, in backlog order.
    pub fn epic_members(&self, epic_id: &str) -> Vec<&TaskNode> {
        self.nodes()
            .filter(|node| node.epic.as_deref() == Some(epic_id))
            .collect()
    }

    /// Blockers of `node` that do not resolve to a terminal task.
    ///
    /// An id that names an epic resolves once the epic has tasks and all of
    /// them are terminal. Ids that match nothing stay unresolved.
    pub fn unresolved_blockers(&self, node: &TaskNode) -> Vec<TaskId> {
        node.blocked_by
            .iter()
            .filter(|blocker| !self.blocker_resolved(blocker))
            .cloned()
            .collect()
    }

    pub fn blockers_resolved(&self, node: &TaskNode) -> bool {
        node.blocked_by
            .iter()
            .all(|blocker| self.blocker_resolved(blocker))
    }

    fn blocker_resolved(&self, blocker: &TaskId) -> bool {
        if let Some(task) = self.tasks.get(blocker) {
            return task.status.is_terminal();
        }
        let members = self.epic_members(&blocker.0);
        !members.is_empty() && members.iter().all(|member| member.status.is_terminal())
    }

    /// Every dependency cycle, each reported as the closed path
    /// `[a, b, ..., a]` following `blocked_by` edges.
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut cycles = Vec::new();
        let mut done = HashSet::new();
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();

        for id in &self.order {
            if !done.contains(id) {
                self.visit_for_cycles(id, &mut done, &mut stack, &mut on_stack, &mut cycles);
            }
        }
        cycles
    }

    fn visit_for_cycles(
        &self,
        id: &TaskId,
        done: &mut HashSet<TaskId>,
        stack: &mut Vec<TaskId>,
        on_stack: &mut HashSet<TaskId>,
        cycles: &mut Vec<Vec<TaskId>>,
    ) {
        stack.push(id.clone());
        on_stack.insert(id.clone());

        if let Some(node) = self.tasks.get(id) {
            for blocker in &node.blocked_by {
                if on_stack.contains(blocker) {
                    if let Some(start) = stack.iter().position(|entry| entry == blocker) {
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(blocker.clone());
                        cycles.push(cycle);
                    }
                } else if self.tasks.contains_key(blocker) && !done.contains(blocker) {
                    self.visit_for_cycles(blocker, done, stack, on_stack, cycles);
                }
            }
        }

        stack.pop();
        on_stack.remove(id);
        done.insert(id.clone());
    }

    /// The first cycle that passes through `id`, if any.
    pub fn cycle_through(&self, id: &TaskId) -> Option<Vec<TaskId>> {
        self.detect_cycles()
            .into_iter()
            .find(|cycle| cycle.contains(id))
    }

    pub fn validate_acyclic(&self) -> Result<(), GraphError> {
        match self.detect_cycles().into_iter().next() {
            Some(path) => Err(GraphError::Cycle { path }),
            None => Ok(()),
        }
    }

    /// Longest chain of dependents reachable from `id`. Nodes already on the
    /// current chain are skipped, so cyclic input terminates.
    pub fn longest_path(&self, id: &TaskId) -> ChainPath {
        if !self.tasks.contains_key(id) {
            return ChainPath {
                length: 0,
                path: Vec::new(),
            };
        }
        let mut memo = HashMap::new();
        let mut on_path = HashSet::new();
        let path = self.longest_from(id, &mut memo, &mut on_path);
        ChainPath {
            length: path.len(),
            path,
        }
    }

    fn longest_from(
        &self,
        id: &TaskId,
        memo: &mut HashMap<TaskId, Vec<TaskId>>,
        on_path: &mut HashSet<TaskId>,
    ) -> Vec<TaskId> {
        if let Some(cached) = memo.get(id) {
            return cached.clone();
        }
        on_path.insert(id.clone());

        let mut best: Vec<TaskId> = Vec::new();
        for dependent in self.dependents(id) {
            if on_path.contains(dependent) {
                continue;
            }
            let candidate = self.longest_from(dependent, memo, on_path);
            if candidate.len() > best.len() {
                best = candidate;
            }
        }

        on_path.remove(id);
        let mut path = Vec::with_capacity(best.len() + 1);
        path.push(id.clone());
        path.extend(best);
        memo.insert(id.clone(), path.clone());
        path
    }

    /// Everything `id` transitively waits on, nearest first.
    pub fn ancestors(&self, id: &TaskId) -> Vec<TaskId> {
        self.closure(id, |node_id| {
            self.tasks
                .get(node_id)
                .map(|node| node.blocked_by.clone())
                .unwrap_or_default()
        })
    }

    /// Everything transitively waiting on `id`, nearest first.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        self.closure(id, |node_id| self.dependents(node_id).to_vec())
    }

    fn closure<F>(&self, id: &TaskId, next: F) -> Vec<TaskId>
    where
        F: Fn(&TaskId) -> Vec<TaskId>,
    {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id.clone()]);
        let mut queue = VecDeque::from([id.clone()]);

        while let Some(current) = queue.pop_front() {
            for neighbour in next(&current) {
                if seen.insert(neighbour.clone()) {
                    out.push(neighbour.clone());
                    queue.push_back(neighbour);
                }
            }
        }
        out
    }

    /// Open tasks that finishing `id` eventually unblocks.
    pub fn count_total_unblocked(&self, id: &TaskId) -> usize {
        self.descendants(id)
            .iter()
            .filter_map(|descendant| self.tasks.get(descendant))
            .filter(|node| !node.status.is_terminal())
            .count()
    }

    /// Open tasks with at least one dependent, ranked by
    /// `direct dependents * longest downstream chain`. Ties keep backlog order.
    pub fn impact_ranking(&self) -> Vec<ImpactScore> {
        let mut scores: Vec<ImpactScore> = self
            .nodes()
            .filter(|node| !node.status.is_terminal())
            .filter_map(|node| {
                let direct_dependents = self.dependents(&node.id).len();
                if direct_dependents == 0 {
                    return None;
                }
                let longest_chain = self.longest_path(&node.id).length;
                Some(ImpactScore {
                    task_id: node.id.clone(),
                    direct_dependents,
                    longest_chain,
                    score: direct_dependents * longest_chain,
                })
            })
            .collect();
        scores.sort_by(|a, b| b.score.cmp(&a.score));
        scores
    }

    /// Not-yet-started tasks whose blockers are all resolved, in backlog order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.nodes()
            .filter(|node| matches!(node.status, TaskStatus::NotStarted | TaskStatus::Blocked))
            .filter(|node| self.blockers_resolved(node))
            .map(|node| node.id.clone())
            .collect()
    }
}

pub fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<TaskId> {
        values.iter().map(|value| TaskId::new(*value)).collect()
    }

    fn chain() -> Vec<Task> {
        vec![
            Task::new("T1", "schema"),
            Task::new("T2", "api").with_blockers(["T1"]),
            Task::new("T3", "ui").with_blockers(["T2"]),
            Task::new("T4", "docs").with_blockers(["T1"]),
        ]
    }

    #[test]
    fn blocks_index_mirrors_blocked_by() {
        let graph = build_graph(&chain()).expect("graph");
        assert_eq!(graph.dependents(&TaskId::new("T1")), ids(&["T2", "T4"]).as_slice());
        for (blocker, dependents) in &graph.blocks {
            for dependent in dependents {
                let node = graph.node(dependent).expect("dependent exists");
                assert!(node.blocked_by.contains(blocker));
            }
        }
    }

    #[test]
    fn duplicate_and_empty_ids_are_rejected() {
        let err = build_graph(&[Task::new("T1", "a"), Task::new("T1", "b")]).expect_err("dup");
        assert!(matches!(err, GraphError::DuplicateTask { task_id } if task_id.0 == "T1"));

        let err = build_graph(&[Task::new(" ", "blank")]).expect_err("empty");
        assert!(matches!(err, GraphError::EmptyTaskId { .. }));
    }

    #[test]
    fn readiness_requires_terminal_blockers_and_fails_closed() {
        let tasks = vec![
            Task::new("T1", "done").with_status(TaskStatus::Done),
            Task::new("T2", "cancelled").with_status(TaskStatus::Cancelled),
            Task::new("T3", "open"),
            Task::new("A", "ok").with_blockers(["T1", "T2"]),
            Task::new("B", "waits").with_blockers(["T1", "T3"]),
            Task::new("C", "ghost").with_blockers(["T404"]),
        ];
        let graph = build_graph(&tasks).expect("graph");
        let node = |id: &str| graph.node(&TaskId::new(id)).expect("node").clone();

        assert!(graph.blockers_resolved(&node("A")));
        assert!(!graph.blockers_resolved(&node("B")));
        assert_eq!(graph.unresolved_blockers(&node("B")), ids(&["T3"]));
        assert!(!graph.blockers_resolved(&node("C")));
        assert_eq!(graph.unresolved_blockers(&node("C")), ids(&["T404"]));
    }

    #[test]
    fn epic_blocker_resolves_when_all_members_are_terminal() {
        let mut tasks = vec![
            Task::new("E1-a", "a")
                .with_parent(Some("P1"), Some("E1"))
                .with_status(TaskStatus::Done),
            Task::new("E1-b", "b")
                .with_parent(Some("P1"), Some("E1"))
                .with_status(TaskStatus::InProgress),
            Task::new("T9", "after epic").with_blockers(["E1"]),
        ];
        let graph = build_graph(&tasks).expect("graph");
        let node = graph.node(&TaskId::new("T9")).expect("node");
        assert!(!graph.blockers_resolved(node));

        tasks[1].status = TaskStatus::AutoDone;
        let graph = build_graph(&tasks).expect("graph");
        let node = graph.node(&TaskId::new("T9")).expect("node");
        assert!(graph.blockers_resolved(node));
    }

    #[test]
    fn detects_two_node_cycle_with_exact_path() {
        let tasks = vec![
            Task::new("A", "a").with_blockers(["B"]),
            Task::new("B", "b").with_blockers(["A"]),
            Task::new("C", "c").with_blockers(["A"]),
        ];
        let graph = build_graph(&tasks).expect("graph");
        let cycles = graph.detect_cycles();
        assert_eq!(cycles, vec![ids(&["A", "B", "A"])]);
        assert!(graph.cycle_through(&TaskId::new("B")).is_some());
        assert!(graph.cycle_through(&TaskId::new("C")).is_none());
        assert!(matches!(
            graph.validate_acyclic(),
            Err(GraphError::Cycle { path }) if format_path(&path) == "A -> B -> A"
        ));
    }

    #[test]
    fn acyclic_graph_reports_no_cycles() {
        let graph = build_graph(&chain()).expect("graph");
        assert!(graph.detect_cycles().is_empty());
        assert!(graph.validate_acyclic().is_ok());
    }

    #[test]
    fn self_blocking_task_is_a_cycle() {
        let graph = build_graph(&[Task::new("A", "a").with_blockers(["A"])]).expect("graph");
        assert_eq!(graph.detect_cycles(), vec![ids(&["A", "A"])]);
    }

    #[test]
    fn longest_path_follows_dependents() {
        let graph = build_graph(&chain()).expect("graph");
        let longest = graph.longest_path(&TaskId::new("T1"));
        assert_eq!(longest.length, 3);
        assert_eq!(longest.path, ids(&["T1", "T2", "T3"]));

        let leaf = graph.longest_path(&TaskId::new("T3"));
        assert_eq!(leaf.length, 1);
        assert_eq!(graph.longest_path(&TaskId::new("nope")).length, 0);
    }

    #[test]
    fn closures_terminate_on_cycles() {
        let tasks = vec![
            Task::new("A", "a").with_blockers(["C"]),
            Task::new("B", "b").with_blockers(["A"]),
            Task::new("C", "c").with_blockers(["B"]),
        ];
        let graph = build_graph(&tasks).expect("graph");
        assert_eq!(graph.ancestors(&TaskId::new("A")), ids(&["C", "B"]));
        assert_eq!(graph.descendants(&TaskId::new("A")), ids(&["B", "C"]));
        assert_eq!(graph.longest_path(&TaskId::new("A")).length, 3);
        assert_eq!(graph.count_total_unblocked(&TaskId::new("A")), 2);
    }

    #[test]
    fn count_total_unblocked_skips_terminal_descendants() {
        let mut tasks = chain();
        tasks[3].status = TaskStatus::Cancelled;
        let graph = build_graph(&tasks).expect("graph");
        assert_eq!(graph.count_total_unblocked(&TaskId::new("T1")), 2);
    }

    #[test]
    fn impact_ranking_orders_by_score_then_backlog_order() {
        let tasks = vec![
            Task::new("X", "x"),
            Task::new("T1", "root"),
            Task::new("T2", "mid").with_blockers(["T1"]),
            Task::new("T3", "leaf").with_blockers(["T2"]),
            Task::new("T4", "leaf").with_blockers(["T1"]),
            Task::new("Y", "y"),
            Task::new("Y1", "y1").with_blockers(["Y"]),
            Task::new("Z", "z"),
            Task::new("Z1", "z1").with_blockers(["Z"]),
        ];
        let graph = build_graph(&tasks).expect("graph");
        let ranking = graph.impact_ranking();
        let order: Vec<&str> = ranking.iter().map(|s| s.task_id.0.as_str()).collect();
        assert_eq!(order, vec!["T1", "T2", "Y", "Z"]);
        assert_eq!(ranking[0].direct_dependents, 2);
        assert_eq!(ranking[0].longest_chain, 3);
        assert_eq!(ranking[0].score, 6);
        assert_eq!(ranking[1].score, 2);
    }

    #[test]
    fn ready_tasks_lists_unblocked_open_work() {
        let mut tasks = chain();
        tasks[0].status = TaskStatus::Done;
        let graph = build_graph(&tasks).expect("graph");
        assert_eq!(graph.ready_tasks(), ids(&["T2", "T4"]));
    }
}
