//! Forward (ASAP) scheduling of backlog tasks and the Gantt metrics derived
//! from it. All metrics are computed from the schedule map itself.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tiller_core::{effort_hours, EffortConfig, GanttConfig, Task, TaskId, TaskStatus};

use crate::dependency_graph::{build_graph, DependencyGraph, GraphError};

/// Hours relative to the schedule epoch `t0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TaskSchedule {
    pub start_hour: f64,
    pub end_hour: f64,
    pub duration_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GanttMetrics {
    pub task_count: usize,
    pub min_start_hour: f64,
    pub max_end_hour: f64,
    pub real_span_hours: f64,
    pub display_span_hours: f64,
    /// Effort hours along the longest blocking chain.
    pub critical_timespan_hours: f64,
    pub critical_path: Vec<TaskId>,
    /// How far the real span runs past the critical timespan.
    pub overflow_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrdSchedule {
    pub prd_id: String,
    pub t0: DateTime<Utc>,
    pub schedules: BTreeMap<TaskId, TaskSchedule>,
    pub metrics: GanttMetrics,
}

/// Schedule epoch: the earliest `started_at` truncated to the start of its
/// day, or `now` when nothing has started.
pub fn compute_t0(tasks: &[Task], now: DateTime<Utc>) -> DateTime<Utc> {
    tasks
        .iter()
        .filter_map(|task| task.started_at)
        .min()
        .map(start_of_day)
        .unwrap_or(now)
}

fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(at)
}

pub fn hours_since(t0: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (at - t0).num_milliseconds() as f64 / 3_600_000.0
}

pub fn get_task_schedules(
    tasks: &[Task],
    effort: &EffortConfig,
    t0: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<BTreeMap<TaskId, TaskSchedule>, GraphError> {
    let graph = build_graph(tasks)?;
    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|task| (&task.id, task)).collect();
    let mut planner = Planner {
        graph: &graph,
        by_id: &by_id,
        effort,
        t0,
        now_hour: hours_since(t0, now),
        done: HashMap::new(),
        visiting: HashSet::new(),
    };

    let mut schedules = BTreeMap::new();
    for id in graph.ids() {
        let schedule = planner.schedule(id);
        schedules.insert(id.clone(), schedule);
    }
    Ok(schedules)
}

struct Planner<'a> {
    graph: &'a DependencyGraph,
    by_id: &'a HashMap<&'a TaskId, &'a Task>,
    effort: &'a EffortConfig,
    t0: DateTime<Utc>,
    now_hour: f64,
    done: HashMap<TaskId, TaskSchedule>,
    visiting: HashSet<TaskId>,
}

impl Planner<'_> {
    fn schedule(&mut self, id: &TaskId) -> TaskSchedule {
        if let Some(schedule) = self.done.get(id) {
            return *schedule;
        }
        let Some(task) = self.by_id.get(id).copied() else {
            return TaskSchedule {
                start_hour: 0.0,
                end_hour: 0.0,
                duration_hours: 0.0,
            };
        };
        self.visiting.insert(id.clone());

        let ready_hour = self.ready_hour(task);
        let started_hour = task
            .started_at
            .filter(|_| task.status.has_started())
            .map(|at| hours_since(self.t0, at));

        let start_hour = match started_hour {
            Some(hour) => hour,
            None if task.status.is_terminal() => ready_hour,
            None => ready_hour.max(self.now_hour),
        };
        let duration_hours = self.duration(task);
        let schedule = TaskSchedule {
            start_hour,
            end_hour: start_hour + duration_hours,
            duration_hours,
        };

        self.visiting.remove(id);
        self.done.insert(id.clone(), schedule);
        schedule
    }

    /// Latest end among known blockers; epic blockers end with their last task.
    fn ready_hour(&mut self, task: &Task) -> f64 {
        let mut ready: f64 = 0.0;
        for blocker in &task.blocked_by {
            let members: Vec<TaskId> = if self.graph.node(blocker).is_some() {
                vec![blocker.clone()]
            } else {
                self.graph
                    .epic_members(&blocker.0)
                    .into_iter()
                    .map(|node| node.id.clone())
                    .collect()
            };
            for member in members {
                if self.visiting.contains(&member) {
                    continue;
                }
                ready = ready.max(self.schedule(&member).end_hour);
            }
        }
        ready
    }

    fn duration(&self, task: &Task) -> f64 {
        match task.status {
            TaskStatus::Cancelled => 0.0,
            TaskStatus::Done | TaskStatus::AutoDone => match (task.started_at, task.done_at) {
                (Some(started), Some(finished)) => hours_since(started, finished).max(0.0),
                _ => effort_hours(task.effort.as_deref(), self.effort),
            },
            _ => effort_hours(task.effort.as_deref(), self.effort),
        }
    }
}

/// Metrics over an already computed schedule. `max_end_hour` is always the
/// maximum over `schedules`, never tracked separately.
pub fn metrics_from_schedules(
    tasks: &[Task],
    schedules: &BTreeMap<TaskId, TaskSchedule>,
    effort: &EffortConfig,
    gantt: &GanttConfig,
) -> Result<GanttMetrics, GraphError> {
    let (min_start_hour, max_end_hour) = if schedules.is_empty() {
        (0.0, 0.0)
    } else {
        schedules.values().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(min_start, max_end), schedule| {
                (
                    min_start.min(schedule.start_hour),
                    max_end.max(schedule.end_hour),
                )
            },
        )
    };
    let real_span_hours = (max_end_hour - min_start_hour).max(0.0);
    let (critical_timespan_hours, critical_path) = critical_chain(tasks, effort)?;

    Ok(GanttMetrics {
        task_count: schedules.len(),
        min_start_hour,
        max_end_hour,
        real_span_hours,
        display_span_hours: display_span(real_span_hours, gantt),
        critical_timespan_hours,
        critical_path,
        overflow_hours: (real_span_hours - critical_timespan_hours).max(0.0),
    })
}

pub fn calculate_gantt_metrics(
    tasks: &[Task],
    effort: &EffortConfig,
    gantt: &GanttConfig,
    t0: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<GanttMetrics, GraphError> {
    let schedules = get_task_schedules(tasks, effort, t0, now)?;
    metrics_from_schedules(tasks, &schedules, effort, gantt)
}

/// Presentation only: padding plus min/max clamps around the real span.
pub fn display_span(real_span_hours: f64, gantt: &GanttConfig) -> f64 {
    let mut span = (real_span_hours + gantt.display_padding_hours).max(gantt.display_min_hours);
    if let Some(max) = gantt.display_max_hours {
        span = span.min(max);
    }
    span
}

/// Longest blocking chain weighted by effort hours (cancelled tasks weigh 0).
pub fn critical_chain(
    tasks: &[Task],
    effort: &EffortConfig,
) -> Result<(f64, Vec<TaskId>), GraphError> {
    let graph = build_graph(tasks)?;
    let weights: HashMap<&TaskId, f64> = tasks
        .iter()
        .map(|task| {
            let hours = if task.status == TaskStatus::Cancelled {
                0.0
            } else {
                effort_hours(task.effort.as_deref(), effort)
            };
            (&task.id, hours)
        })
        .collect();

    let mut memo: HashMap<TaskId, (f64, Vec<TaskId>)> = HashMap::new();
    let mut best = (0.0, Vec::new());
    for id in graph.ids() {
        let mut on_path = HashSet::new();
        let candidate = weighted_chain(&graph, &weights, id, &mut memo, &mut on_path);
        if candidate.0 > best.0 {
            best = candidate;
        }
    }
    Ok(best)
}

fn weighted_chain(
    graph: &DependencyGraph,
    weights: &HashMap<&TaskId, f64>,
    id: &TaskId,
    memo: &mut HashMap<TaskId, (f64, Vec<TaskId>)>,
    on_path: &mut HashSet<TaskId>,
) -> (f64, Vec<TaskId>) {
    if let Some(cached) = memo.get(id) {
        return cached.clone();
    }
    on_path.insert(id.clone());

    let mut tail = (0.0, Vec::new());
    for dependent in graph.dependents(id) {
        if on_path.contains(dependent) {
            continue;
        }
        let candidate = weighted_chain(graph, weights, dependent, memo, on_path);
        if candidate.0 > tail.0 {
            tail = candidate;
        }
    }

    on_path.remove(id);
    let mut path = vec![id.clone()];
    path.extend(tail.1);
    let result = (weights.get(id).copied().unwrap_or(0.0) + tail.0, path);
    memo.insert(id.clone(), result.clone());
    result
}

/// Tasks of one PRD, scheduled from that PRD's own epoch.
pub fn schedule_for_prd(
    tasks: &[Task],
    prd_id: &str,
    effort: &EffortConfig,
    gantt: &GanttConfig,
    now: DateTime<Utc>,
) -> Result<PrdSchedule, GraphError> {
    let scoped: Vec<Task> = tasks
        .iter()
        .filter(|task| task.parent.prd.as_deref() == Some(prd_id))
        .cloned()
        .collect();
    let t0 = compute_t0(&scoped, now);
    let schedules = get_task_schedules(&scoped, effort, t0, now)?;
    let metrics = metrics_from_schedules(&scoped, &schedules, effort, gantt)?;
    Ok(PrdSchedule {
        prd_id: prd_id.to_string(),
        t0,
        schedules,
        metrics,
    })
}

/// Wall-clock instant for an hour offset, for rendering. Offsets beyond the
/// representable range render as `t0`.
pub fn hour_to_time(t0: DateTime<Utc>, hour: f64) -> DateTime<Utc> {
    Duration::try_milliseconds((hour * 3_600_000.0).round() as i64)
        .and_then(|offset| t0.checked_add_signed(offset))
        .unwrap_or(t0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).single().expect("valid date")
    }

    fn at_hour(hour: i64) -> DateTime<Utc> {
        epoch() + Duration::hours(hour)
    }

    fn schedule_of(map: &BTreeMap<TaskId, TaskSchedule>, id: &str) -> TaskSchedule {
        *map.get(&TaskId::new(id)).expect("scheduled")
    }

    fn two_task_scenario() -> Vec<Task> {
        vec![
            Task::new("T1", "first")
                .with_effort("1h")
                .with_status(TaskStatus::Done)
                .with_started_at(epoch())
                .with_done_at(at_hour(1)),
            Task::new("T2", "second").with_effort("2h").with_blockers(["T1"]),
        ]
    }

    #[test]
    fn blocker_end_bounds_dependent_start() {
        let tasks = two_task_scenario();
        let effort = EffortConfig::default();
        let schedules = get_task_schedules(&tasks, &effort, epoch(), epoch()).expect("schedule");

        let t1 = schedule_of(&schedules, "T1");
        assert_eq!((t1.start_hour, t1.end_hour, t1.duration_hours), (0.0, 1.0, 1.0));
        let t2 = schedule_of(&schedules, "T2");
        assert_eq!((t2.start_hour, t2.end_hour, t2.duration_hours), (1.0, 3.0, 2.0));

        let metrics =
            metrics_from_schedules(&tasks, &schedules, &effort, &GanttConfig::default())
                .expect("metrics");
        assert_eq!(metrics.critical_timespan_hours, 3.0);
        assert_eq!(
            metrics.critical_path,
            vec![TaskId::new("T1"), TaskId::new("T2")]
        );
    }

    #[test]
    fn max_end_hour_matches_schedule_maximum() {
        let tasks = vec![
            Task::new("A", "a").with_effort("3h"),
            Task::new("B", "b").with_effort("30m").with_blockers(["A"]),
            Task::new("C", "c")
                .with_effort("M")
                .with_status(TaskStatus::InProgress)
                .with_started_at(at_hour(2)),
            Task::new("D", "d").with_effort("1d").with_blockers(["C", "B"]),
        ];
        let effort = EffortConfig::default();
        let now = at_hour(1);
        let schedules = get_task_schedules(&tasks, &effort, epoch(), now).expect("schedule");
        let metrics =
            calculate_gantt_metrics(&tasks, &effort, &GanttConfig::default(), epoch(), now)
                .expect("metrics");

        let independent_max = schedules
            .values()
            .map(|s| s.end_hour)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(metrics.max_end_hour, independent_max);
        for schedule in schedules.values() {
            assert!((schedule.end_hour - schedule.start_hour - schedule.duration_hours).abs() < 1e-9);
        }
        assert_eq!(
            metrics.real_span_hours,
            metrics.max_end_hour - metrics.min_start_hour
        );
    }

    #[test]
    fn in_progress_task_uses_started_at() {
        let tasks = vec![Task::new("A", "a")
            .with_effort("2h")
            .with_status(TaskStatus::InProgress)
            .with_started_at(at_hour(5))];
        let schedules =
            get_task_schedules(&tasks, &EffortConfig::default(), epoch(), at_hour(9))
                .expect("schedule");
        assert_eq!(schedule_of(&schedules, "A").start_hour, 5.0);
    }

    #[test]
    fn in_progress_without_started_at_falls_back_to_computed_start() {
        let tasks = vec![Task::new("A", "a")
            .with_effort("2h")
            .with_status(TaskStatus::InProgress)];
        let schedules =
            get_task_schedules(&tasks, &EffortConfig::default(), epoch(), at_hour(4))
                .expect("schedule");
        assert_eq!(schedule_of(&schedules, "A").start_hour, 4.0);
    }

    #[test]
    fn unstarted_tasks_start_no_earlier_than_now() {
        let tasks = vec![Task::new("A", "a").with_effort("1h")];
        let schedules =
            get_task_schedules(&tasks, &EffortConfig::default(), epoch(), at_hour(6))
                .expect("schedule");
        let a = schedule_of(&schedules, "A");
        assert_eq!((a.start_hour, a.end_hour), (6.0, 7.0));
    }

    #[test]
    fn epic_blocker_waits_for_last_member() {
        let tasks = vec![
            Task::new("E-a", "a").with_effort("1h").with_parent(None, Some("E1")),
            Task::new("E-b", "b")
                .with_effort("4h")
                .with_parent(None, Some("E1"))
                .with_blockers(["E-a"]),
            Task::new("After", "after").with_effort("1h").with_blockers(["E1"]),
        ];
        let schedules =
            get_task_schedules(&tasks, &EffortConfig::default(), epoch(), epoch())
                .expect("schedule");
        assert_eq!(schedule_of(&schedules, "After").start_hour, 5.0);
    }

    #[test]
    fn cyclic_input_still_produces_a_schedule() {
        let tasks = vec![
            Task::new("A", "a").with_effort("1h").with_blockers(["B"]),
            Task::new("B", "b").with_effort("1h").with_blockers(["A"]),
        ];
        let schedules =
            get_task_schedules(&tasks, &EffortConfig::default(), epoch(), epoch())
                .expect("schedule");
        assert_eq!(schedules.len(), 2);
        let (hours, path) = critical_chain(&tasks, &EffortConfig::default()).expect("chain");
        assert_eq!(hours, 2.0);
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn t0_is_day_start_of_earliest_start() {
        let tasks = vec![
            Task::new("A", "a").with_started_at(at_hour(30)),
            Task::new("B", "b").with_started_at(at_hour(27)),
            Task::new("C", "c"),
        ];
        assert_eq!(compute_t0(&tasks, at_hour(100)), at_hour(24));
        assert_eq!(compute_t0(&[Task::new("C", "c")], at_hour(100)), at_hour(100));
    }

    #[test]
    fn display_span_applies_padding_and_clamps() {
        let gantt = GanttConfig {
            display_padding_hours: 2.0,
            display_min_hours: 8.0,
            display_max_hours: Some(40.0),
        };
        assert_eq!(display_span(1.0, &gantt), 8.0);
        assert_eq!(display_span(10.0, &gantt), 12.0);
        assert_eq!(display_span(100.0, &gantt), 40.0);
    }

    #[test]
    fn schedule_for_prd_scopes_tasks_and_epoch() {
        let tasks = vec![
            Task::new("P1-a", "a")
                .with_parent(Some("P1"), None)
                .with_effort("2h")
                .with_status(TaskStatus::InProgress)
                .with_started_at(at_hour(3)),
            Task::new("P2-a", "other prd").with_parent(Some("P2"), None),
        ];
        let prd = schedule_for_prd(
            &tasks,
            "P1",
            &EffortConfig::default(),
            &GanttConfig::default(),
            at_hour(4),
        )
        .expect("prd schedule");
        assert_eq!(prd.t0, epoch());
        assert_eq!(prd.schedules.len(), 1);
        assert_eq!(prd.metrics.max_end_hour, 5.0);
        assert_eq!(hour_to_time(prd.t0, 5.0), at_hour(5));
    }

    #[test]
    fn absurd_effort_renders_without_overflow() {
        let tasks = vec![Task::new("T1", "forever")
            .with_parent(Some("P1"), None)
            .with_effort("99999999999999d")];
        let prd = schedule_for_prd(
            &tasks,
            "P1",
            &EffortConfig::default(),
            &GanttConfig::default(),
            epoch(),
        )
        .expect("prd schedule");
        let end = prd.schedules[&TaskId::new("T1")].end_hour;
        assert!(end > 1.0e12);
        assert_eq!(hour_to_time(prd.t0, end), prd.t0);
        assert_eq!(hour_to_time(prd.t0, f64::NAN), prd.t0);
    }
}
