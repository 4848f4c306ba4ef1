//! Dependency-aware task scheduling
//!
//! [`TaskScheduler`] keeps a dependents index and a count of unmet
//! dependencies per task, so each completion touches only the tasks that
//! depend on it. When nothing is runnable but work remains it reports why
//! instead of spinning.

use keel_core::{Priority, Task, TaskId, TaskStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Tasks that are pending and whose dependencies are all in `completed`
///
/// One pass over the tasks; the scheduler below is the incremental form used
/// across a run.
pub fn compute_available<'a, C>(tasks: &'a [Task], completed: &C) -> Vec<&'a Task>
where
    C: ContainsId,
{
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.dependencies.iter().all(|d| completed.contains_id(d)))
        .collect()
}

/// Set of completed task ids
pub trait ContainsId {
    fn contains_id(&self, id: &str) -> bool;
}

impl ContainsId for BTreeSet<TaskId> {
    fn contains_id(&self, id: &str) -> bool {
        self.contains(id)
    }
}

impl ContainsId for HashSet<TaskId> {
    fn contains_id(&self, id: &str) -> bool {
        self.contains(id)
    }
}

/// Every dependency cycle, each reported as a closed path (`[A, B, A]`)
///
/// Edges point from a task to its dependencies; dependencies on ids that are
/// not in `tasks` are ignored. Iterative DFS with an explicit recursion stack.
pub fn detect_cycles(tasks: &[Task]) -> Vec<Vec<TaskId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let edges: Vec<Vec<usize>> = tasks
        .iter()
        .map(|t| {
            t.dependencies
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; tasks.len()];
    let mut cycles = Vec::new();

    for start in 0..tasks.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::OnStack;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(&(node, next)) = stack.last() {
            if next < edges[node].len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let dep = edges[node][next];
                match marks[dep] {
                    Mark::OnStack => {
                        let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            stack[from..].iter().map(|(n, _)| tasks[*n].id.clone()).collect();
                        cycle.push(tasks[dep].id.clone());
                        cycles.push(cycle);
                    }
                    Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }

    cycles
}

/// Why no task can run although work remains
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stall {
    /// Genuine dependency cycles
    Cycle(Vec<Vec<TaskId>>),
    /// Remaining tasks depend (transitively) on tasks that were given up on
    BlockedByFailure {
        failed: Vec<TaskId>,
        blocked: Vec<TaskId>,
    },
    /// Remaining tasks depend on ids that are not in the plan
    MissingDependencies(BTreeMap<TaskId, Vec<TaskId>>),
}

impl std::fmt::Display for Stall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stall::Cycle(cycles) => {
                let paths: Vec<String> = cycles.iter().map(|c| c.join(" -> ")).collect();
                write!(f, "dependency cycle: {}", paths.join("; "))
            }
            Stall::BlockedByFailure { failed, blocked } => write!(
                f,
                "tasks {} are blocked by failed tasks {}",
                blocked.join(", "),
                failed.join(", ")
            ),
            Stall::MissingDependencies(missing) => {
                let parts: Vec<String> = missing
                    .iter()
                    .map(|(task, deps)| format!("{} needs {}", task, deps.join(", ")))
                    .collect();
                write!(f, "unknown dependencies: {}", parts.join("; "))
            }
        }
    }
}

/// Scheduler state after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// At least one task can be selected
    Ready,
    /// Nothing selectable, but selected tasks are still running
    Waiting,
    /// No work remains
    Done,
    /// Nothing can ever run again without intervention
    Blocked(Stall),
}

/// Selection order: priority, then lower complexity, then plan order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Priority,
    complexity_millis: u32,
    plan_index: usize,
}

/// Incremental scheduler over a snapshot of the task list
pub struct TaskScheduler {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    dependents: HashMap<TaskId, Vec<usize>>,
    unmet: Vec<usize>,
    ready: BTreeSet<ReadyKey>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    in_flight: HashSet<TaskId>,
}

impl TaskScheduler {
    /// Build from a snapshot. `InProgress` tasks are treated as pending, so
    /// work interrupted by a crash is selected again.
    pub fn new(tasks: &[Task], completed: &BTreeSet<TaskId>) -> Self {
        let tasks = tasks.to_vec();
        let index: HashMap<TaskId, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let mut done: HashSet<TaskId> = completed.iter().cloned().collect();
        done.extend(tasks.iter().filter(|t| t.is_complete()).map(|t| t.id.clone()));
        let failed: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .map(|t| t.id.clone())
            .collect();

        let mut dependents: HashMap<TaskId, Vec<usize>> = HashMap::new();
        let mut unmet = vec![0; tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                if !done.contains(dep) {
                    unmet[i] += 1;
                    dependents.entry(dep.clone()).or_default().push(i);
                }
            }
        }

        let mut scheduler = Self {
            tasks,
            index,
            dependents,
            unmet,
            ready: BTreeSet::new(),
            completed: done,
            failed,
            in_flight: HashSet::new(),
        };
        for i in 0..scheduler.tasks.len() {
            if scheduler.is_open(i) && scheduler.unmet[i] == 0 {
                scheduler.ready.insert(scheduler.key(i));
            }
        }
        scheduler
    }

    fn key(&self, i: usize) -> ReadyKey {
        let task = &self.tasks[i];
        ReadyKey {
            priority: task.priority,
            complexity_millis: task.complexity.total_millis(),
            plan_index: i,
        }
    }

    /// Neither completed, given up on, nor running
    fn is_open(&self, i: usize) -> bool {
        let id = &self.tasks[i].id;
        !self.completed.contains(id) && !self.failed.contains(id) && !self.in_flight.contains(id)
    }

    /// Runnable tasks in selection order
    pub fn available(&self) -> Vec<&Task> {
        self.ready.iter().map(|k| &self.tasks[k.plan_index]).collect()
    }

    /// Take up to `max` runnable tasks and mark them in flight
    ///
    /// A batch never contains a task together with one of its dependencies,
    /// since every selected task already has all dependencies completed.
    pub fn next_batch(&mut self, max: usize) -> Vec<Task> {
        let mut batch = Vec::new();
        while batch.len() < max.max(1) {
            let Some(key) = self.ready.pop_first() else {
                break;
            };
            let task = self.tasks[key.plan_index].clone();
            self.in_flight.insert(task.id.clone());
            batch.push(task);
        }
        debug!(batch = ?batch.iter().map(|t| &t.id).collect::<Vec<_>>(), "selected tasks");
        batch
    }

    /// Record a completion and release dependents whose last dependency it was
    pub fn mark_completed(&mut self, id: &str) {
        self.in_flight.remove(id);
        if !self.completed.insert(id.to_string()) {
            return;
        }
        if let Some(&i) = self.index.get(id) {
            self.ready.remove(&self.key(i));
        }
        let Some(dependents) = self.dependents.get(id).cloned() else {
            return;
        };
        for i in dependents {
            self.unmet[i] = self.unmet[i].saturating_sub(1);
            if self.unmet[i] == 0 && self.is_open(i) {
                self.ready.insert(self.key(i));
            }
        }
    }

    /// Give up on a task; its dependents can never run
    pub fn mark_failed(&mut self, id: &str) {
        self.in_flight.remove(id);
        if let Some(&i) = self.index.get(id) {
            self.ready.remove(&self.key(i));
        }
        self.failed.insert(id.to_string());
    }

    /// Return an in-flight task to the runnable set
    pub fn requeue(&mut self, id: &str) {
        if !self.in_flight.remove(id) {
            return;
        }
        if let Some(&i) = self.index.get(id) {
            if self.unmet[i] == 0 && self.is_open(i) {
                self.ready.insert(self.key(i));
            }
        }
    }

    pub fn poll(&self) -> Signal {
        if !self.ready.is_empty() {
            return Signal::Ready;
        }
        if !self.in_flight.is_empty() {
            return Signal::Waiting;
        }

        let remaining: Vec<&Task> = (0..self.tasks.len())
            .filter(|&i| self.is_open(i))
            .map(|i| &self.tasks[i])
            .collect();
        if remaining.is_empty() {
            return Signal::Done;
        }

        Signal::Blocked(self.classify_stall(&remaining))
    }

    fn classify_stall(&self, remaining: &[&Task]) -> Stall {
        let open: Vec<Task> = remaining.iter().map(|t| (*t).clone()).collect();
        let cycles = detect_cycles(&open);
        if !cycles.is_empty() {
            return Stall::Cycle(cycles);
        }

        // Walk dependents outward from the failed tasks
        let mut blocked = BTreeSet::new();
        let mut frontier: Vec<&TaskId> = self.failed.iter().collect();
        while let Some(id) = frontier.pop() {
            for &i in self.dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                let dependent = &self.tasks[i].id;
                if self.is_open(i) && blocked.insert(dependent.clone()) {
                    frontier.push(dependent);
                }
            }
        }
        if !blocked.is_empty() {
            let mut failed: Vec<TaskId> = self.failed.iter().cloned().collect();
            failed.sort();
            return Stall::BlockedByFailure {
                failed,
                blocked: blocked.into_iter().collect(),
            };
        }

        let missing = remaining
            .iter()
            .filter_map(|t| {
                let unknown: Vec<TaskId> = t
                    .dependencies
                    .iter()
                    .filter(|d| !self.index.contains_key(*d) && !self.completed.contains(*d))
                    .cloned()
                    .collect();
                (!unknown.is_empty()).then(|| (t.id.clone(), unknown))
            })
            .collect();
        Stall::MissingDependencies(missing)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ComplexityScore;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, format!("task {}", id)).with_dependencies(deps.iter().copied())
    }

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn test_compute_available_scenario() {
        let mut tasks = vec![task("A", &[]), task("B", &["A"]), task("C", &["A", "B"])];
        tasks[0].status = TaskStatus::Completed;
        let completed: BTreeSet<TaskId> = ["A".to_string()].into_iter().collect();

        let available = compute_available(&tasks, &completed);
        assert_eq!(ids(&available), vec!["B"]);
        for t in &available {
            assert!(t.dependencies.iter().all(|d| completed.contains(d)));
        }
    }

    #[test]
    fn test_detect_two_node_cycle() {
        let tasks = vec![task("A", &["B"]), task("B", &["A"])];
        assert_eq!(
            detect_cycles(&tasks),
            vec![vec!["A".to_string(), "B".to_string(), "A".to_string()]]
        );
    }

    #[test]
    fn test_detect_no_cycle_in_dag_and_ignores_unknown_ids() {
        let tasks = vec![
            task("A", &[]),
            task("B", &["A", "ghost"]),
            task("C", &["A", "B"]),
            task("D", &["C", "B"]),
        ];
        assert!(detect_cycles(&tasks).is_empty());
    }

    #[test]
    fn test_detect_self_loop_and_long_cycle() {
        let tasks = vec![
            task("S", &["S"]),
            task("A", &["C"]),
            task("B", &["A"]),
            task("C", &["B"]),
        ];
        let cycles = detect_cycles(&tasks);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0], vec!["S".to_string(), "S".to_string()]);
        assert_eq!(cycles[1].first(), cycles[1].last());
        assert_eq!(cycles[1].len(), 4);
    }

    #[test]
    fn test_scheduler_refuses_cycle() {
        let tasks = vec![task("A", &["B"]), task("B", &["A"])];
        let scheduler = TaskScheduler::new(&tasks, &BTreeSet::new());

        assert!(scheduler.available().is_empty());
        match scheduler.poll() {
            Signal::Blocked(Stall::Cycle(cycles)) => {
                assert_eq!(cycles, vec![vec!["A", "B", "A"]]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_selection_order() {
        let tasks = vec![
            task("low", &[]).with_priority(Priority::Low),
            task("crit-hard", &[])
                .with_priority(Priority::Critical)
                .with_complexity(ComplexityScore::new(1.0, 0.0, 0.0, 0.0, 0.0)),
            task("crit-easy", &[]).with_priority(Priority::Critical),
            task("med-1", &[]),
            task("med-2", &[]),
        ];
        let mut scheduler = TaskScheduler::new(&tasks, &BTreeSet::new());
        let batch: Vec<String> = scheduler.next_batch(10).into_iter().map(|t| t.id).collect();
        assert_eq!(batch, vec!["crit-easy", "crit-hard", "med-1", "med-2", "low"]);
    }

    #[test]
    fn test_incremental_release() {
        let tasks = vec![task("A", &[]), task("B", &["A"]), task("C", &["A", "B"])];
        let mut scheduler = TaskScheduler::new(&tasks, &BTreeSet::new());

        let first = scheduler.next_batch(4);
        assert_eq!(first.len(), 1);
        assert_eq!(scheduler.poll(), Signal::Waiting);

        scheduler.mark_completed("A");
        assert_eq!(ids(&scheduler.available()), vec!["B"]);
        scheduler.next_batch(4);
        scheduler.mark_completed("B");
        assert_eq!(ids(&scheduler.available()), vec!["C"]);
        scheduler.next_batch(4);
        scheduler.mark_completed("C");
        assert_eq!(scheduler.poll(), Signal::Done);
        assert_eq!(scheduler.completed_count(), 3);
    }

    #[test]
    fn test_blocked_by_failure_is_distinct_from_cycle() {
        let tasks = vec![task("A", &[]), task("B", &["A"]), task("C", &["B"]), task("D", &[])];
        let mut scheduler = TaskScheduler::new(&tasks, &BTreeSet::new());

        let batch = scheduler.next_batch(4);
        assert_eq!(batch.len(), 2);
        scheduler.mark_failed("A");
        scheduler.mark_completed("D");

        assert_eq!(
            scheduler.poll(),
            Signal::Blocked(Stall::BlockedByFailure {
                failed: vec!["A".to_string()],
                blocked: vec!["B".to_string(), "C".to_string()],
            })
        );
    }

    #[test]
    fn test_missing_dependency_stall() {
        let tasks = vec![task("A", &["nope"])];
        let scheduler = TaskScheduler::new(&tasks, &BTreeSet::new());
        match scheduler.poll() {
            Signal::Blocked(Stall::MissingDependencies(missing)) => {
                assert_eq!(missing["A"], vec!["nope".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resume_treats_in_progress_as_runnable() {
        let mut tasks = vec![task("A", &[]), task("B", &["A"])];
        tasks[0].status = TaskStatus::Completed;
        tasks[1].status = TaskStatus::InProgress;
        let completed: BTreeSet<TaskId> = ["A".to_string()].into_iter().collect();

        let mut scheduler = TaskScheduler::new(&tasks, &completed);
        assert_eq!(ids(&scheduler.available()), vec!["B"]);
        scheduler.next_batch(1);
        scheduler.requeue("B");
        assert_eq!(scheduler.poll(), Signal::Ready);
    }

    #[test]
    fn test_many_tasks_chain() {
        let mut tasks = vec![task("t0", &[])];
        for i in 1..500 {
            let prev = format!("t{}", i - 1);
            tasks.push(task(&format!("t{}", i), &[prev.as_str()]));
        }
        assert!(detect_cycles(&tasks).is_empty());

        let mut scheduler = TaskScheduler::new(&tasks, &BTreeSet::new());
        let mut order = Vec::new();
        while scheduler.poll() == Signal::Ready {
            for t in scheduler.next_batch(8) {
                order.push(t.id.clone());
                scheduler.mark_completed(&t.id);
            }
        }
        assert_eq!(order.len(), 500);
        assert_eq!(scheduler.poll(), Signal::Done);
    }
}
