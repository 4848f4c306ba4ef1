//! Complexity-based task splitting
//!
//! A pending task whose score reaches the threshold is split along its
//! dominant dimension. Children take the parent's dependencies, and every task
//! that depended on the parent depends on all of its children instead, so the
//! split keeps the parent's position in the graph.

use keel_core::{ComplexityDimension, Task, TaskId, TaskStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// How a task is cut into children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    /// One child per directory in the file scope
    ByDirectory,
    /// One child per architectural layer, chained data to tests
    ByLayer,
    /// One child per acceptance criterion, chained in order
    ByCriterion,
}

impl SplitStrategy {
    pub fn for_dimension(dimension: ComplexityDimension) -> Self {
        match dimension {
            ComplexityDimension::FileScope => Self::ByDirectory,
            ComplexityDimension::CrossFileCoupling => Self::ByLayer,
            ComplexityDimension::SemanticDifficulty => Self::ByCriterion,
        }
    }
}

impl std::fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByDirectory => write!(f, "by_directory"),
            Self::ByLayer => write!(f, "by_layer"),
            Self::ByCriterion => write!(f, "by_criterion"),
        }
    }
}

/// A decided split
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPlan {
    pub parent: TaskId,
    pub strategy: SplitStrategy,
    pub children: Vec<Task>,
}

impl SplitPlan {
    pub fn child_ids(&self) -> Vec<TaskId> {
        self.children.iter().map(|c| c.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Layer {
    Data,
    Service,
    Interface,
    Tests,
}

impl Layer {
    fn name(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Service => "service",
            Self::Interface => "interface",
            Self::Tests => "tests",
        }
    }

    fn classify(text: &str) -> Layer {
        let lower = text.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(&["test", "spec"]) {
            Layer::Tests
        } else if has(&[
            "model",
            "schema",
            "migration",
            "entity",
            "repository",
            "store",
            "database",
            "db/",
        ]) {
            Layer::Data
        } else if has(&[
            "api",
            "route",
            "handler",
            "controller",
            "endpoint",
            "cli",
            "view",
            "ui/",
        ]) {
            Layer::Interface
        } else {
            Layer::Service
        }
    }
}

#[derive(Default)]
struct Group {
    files: Vec<String>,
    criteria: Vec<String>,
}

impl Group {
    fn weight(&self) -> usize {
        self.files.len() + self.criteria.len()
    }
}

/// Decide whether and how `task` splits
///
/// Returns `None` for tasks under the threshold, tasks that are themselves
/// split children, tasks that already started, and tasks whose dominant
/// dimension yields fewer than two groups.
pub fn plan_split(task: &Task, threshold: f64) -> Option<SplitPlan> {
    if task.split_from.is_some() || task.status != TaskStatus::Pending {
        return None;
    }
    if task.complexity.total() < threshold {
        return None;
    }

    let strategy = SplitStrategy::for_dimension(task.complexity.dominant());
    let (groups, chained) = match strategy {
        SplitStrategy::ByDirectory => (group_by_directory(task), false),
        SplitStrategy::ByLayer => (group_by_layer(task), true),
        SplitStrategy::ByCriterion => (group_by_criterion(task), true),
    };
    if groups.len() < 2 {
        debug!(task_id = %task.id, %strategy, "too few groups to split");
        return None;
    }

    let total: usize = groups.iter().map(|(_, g)| g.weight()).sum();
    let mut children: Vec<Task> = Vec::with_capacity(groups.len());
    for (n, (label, group)) in groups.into_iter().enumerate() {
        let share = group.weight() as f64 / total.max(1) as f64;
        let mut dependencies = task.dependencies.clone();
        if chained {
            if let Some(previous) = children.last() {
                dependencies.push(previous.id.clone());
            }
        }
        children.push(Task {
            id: format!("{}.{}", task.id, n + 1),
            title: format!("{} ({})", task.title, label),
            dependencies,
            status: TaskStatus::Pending,
            priority: task.priority,
            complexity: task.complexity.scaled(share),
            file_scope: group.files,
            acceptance_criteria: group.criteria,
            split_from: Some(task.id.clone()),
        });
    }

    Some(SplitPlan {
        parent: task.id.clone(),
        strategy,
        children,
    })
}

fn group_by_directory(task: &Task) -> Vec<(String, Group)> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for pattern in &task.file_scope {
        let dir = Path::new(pattern)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        groups.entry(dir).or_default().files.push(pattern.clone());
    }
    // Every directory child keeps the full criteria list
    groups
        .into_iter()
        .map(|(dir, mut group)| {
            group.criteria = task.acceptance_criteria.clone();
            (dir, group)
        })
        .collect()
}

fn group_by_layer(task: &Task) -> Vec<(String, Group)> {
    let mut groups: BTreeMap<Layer, Group> = BTreeMap::new();
    for pattern in &task.file_scope {
        groups
            .entry(Layer::classify(pattern))
            .or_default()
            .files
            .push(pattern.clone());
    }
    for criterion in &task.acceptance_criteria {
        groups
            .entry(Layer::classify(criterion))
            .or_default()
            .criteria
            .push(criterion.clone());
    }
    groups
        .into_iter()
        .map(|(layer, group)| (layer.name().to_string(), group))
        .collect()
}

fn group_by_criterion(task: &Task) -> Vec<(String, Group)> {
    task.acceptance_criteria
        .iter()
        .enumerate()
        .map(|(i, criterion)| {
            (
                format!("criterion {}", i + 1),
                Group {
                    files: task.file_scope.clone(),
                    criteria: vec![criterion.clone()],
                },
            )
        })
        .collect()
}

/// Split every qualifying task and rewire dependents
///
/// Children take their parent's place in plan order. A split whose child ids
/// would collide with existing task ids is skipped.
pub fn apply_splits(tasks: Vec<Task>, threshold: f64) -> (Vec<Task>, Vec<SplitPlan>) {
    let existing: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
    let mut plans = Vec::new();
    let mut result = Vec::with_capacity(tasks.len());

    for task in tasks {
        let plan = plan_split(&task, threshold)
            .filter(|plan| plan.children.iter().all(|c| !existing.contains(&c.id)));
        match plan {
            Some(plan) => {
                info!(
                    task_id = %plan.parent,
                    strategy = %plan.strategy,
                    children = plan.children.len(),
                    complexity = task.complexity.total(),
                    "splitting task"
                );
                result.extend(plan.children.iter().cloned());
                plans.push(plan);
            }
            None => result.push(task),
        }
    }

    let replacements: HashMap<&str, Vec<TaskId>> = plans
        .iter()
        .map(|plan| (plan.parent.as_str(), plan.child_ids()))
        .collect();
    if !replacements.is_empty() {
        for task in &mut result {
            if !task
                .dependencies
                .iter()
                .any(|d| replacements.contains_key(d.as_str()))
            {
                continue;
            }
            let mut rewired: Vec<TaskId> = Vec::new();
            for dep in &task.dependencies {
                let targets = match replacements.get(dep.as_str()) {
                    Some(children) => children.clone(),
                    None => vec![dep.clone()],
                };
                for target in targets {
                    if !rewired.contains(&target) {
                        rewired.push(target);
                    }
                }
            }
            task.dependencies = rewired;
        }
    }

    (result, plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::detect_cycles;
    use keel_core::ComplexityScore;

    fn heavy(dimension: ComplexityDimension) -> ComplexityScore {
        match dimension {
            ComplexityDimension::FileScope => ComplexityScore::new(1.0, 0.4, 0.4, 0.5, 0.5),
            ComplexityDimension::CrossFileCoupling => ComplexityScore::new(0.4, 1.0, 0.4, 0.5, 0.5),
            ComplexityDimension::SemanticDifficulty => {
                ComplexityScore::new(0.4, 0.4, 1.0, 0.5, 0.5)
            }
        }
    }

    #[test]
    fn test_below_threshold_is_not_split() {
        let task = Task::new("T", "small")
            .with_complexity(ComplexityScore::new(0.2, 0.2, 0.2, 0.0, 0.0))
            .with_file_scope(["a/x.rs", "b/y.rs"]);
        assert!(plan_split(&task, 5.0).is_none());
    }

    #[test]
    fn test_split_by_directory() {
        let task = Task::new("T", "wide change")
            .with_complexity(heavy(ComplexityDimension::FileScope))
            .with_file_scope(["src/auth/login.rs", "src/auth/token.rs", "src/db/users.rs"])
            .with_acceptance_criteria(["login works"]);

        let plan = plan_split(&task, 5.0).unwrap();
        assert_eq!(plan.strategy, SplitStrategy::ByDirectory);
        assert_eq!(plan.child_ids(), vec!["T.1", "T.2"]);
        assert_eq!(
            plan.children[0].file_scope,
            vec!["src/auth/login.rs", "src/auth/token.rs"]
        );
        assert_eq!(plan.children[1].file_scope, vec!["src/db/users.rs"]);
        assert!(plan.children.iter().all(|c| c.split_from.as_deref() == Some("T")));
        assert!(plan.children[0].complexity.total() < task.complexity.total());
        // Directory children are independent of each other
        assert!(plan.children[1].dependencies.is_empty());
    }

    #[test]
    fn test_split_by_layer_chains_children() {
        let task = Task::new("T", "user feature")
            .with_complexity(heavy(ComplexityDimension::CrossFileCoupling))
            .with_file_scope(["src/api/users.rs", "src/models/user.rs", "tests/users.rs"])
            .with_acceptance_criteria(["endpoint returns 201"]);

        let plan = plan_split(&task, 5.0).unwrap();
        assert_eq!(plan.strategy, SplitStrategy::ByLayer);
        let titles: Vec<&str> = plan.children.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["user feature (data)", "user feature (interface)", "user feature (tests)"]
        );
        assert_eq!(plan.children[1].dependencies, vec!["T.1"]);
        assert_eq!(plan.children[2].dependencies, vec!["T.2"]);
    }

    #[test]
    fn test_split_by_criterion() {
        let task = Task::new("T", "parser")
            .with_complexity(heavy(ComplexityDimension::SemanticDifficulty))
            .with_dependencies(["S"])
            .with_acceptance_criteria(["parses literals", "reports errors", "handles unicode"]);

        let plan = plan_split(&task, 5.0).unwrap();
        assert_eq!(plan.strategy, SplitStrategy::ByCriterion);
        assert_eq!(plan.children.len(), 3);
        assert_eq!(plan.children[0].dependencies, vec!["S"]);
        assert_eq!(plan.children[2].dependencies, vec!["S", "T.2"]);
        assert_eq!(plan.children[1].acceptance_criteria, vec!["reports errors"]);
    }

    #[test]
    fn test_single_group_is_not_split() {
        let task = Task::new("T", "one dir")
            .with_complexity(heavy(ComplexityDimension::FileScope))
            .with_file_scope(["src/a.rs", "src/b.rs"]);
        assert!(plan_split(&task, 5.0).is_none());
    }

    #[test]
    fn test_apply_splits_rewires_dependents() {
        let tasks = vec![
            Task::new("S", "setup"),
            Task::new("T", "parser")
                .with_complexity(heavy(ComplexityDimension::SemanticDifficulty))
                .with_dependencies(["S"])
                .with_acceptance_criteria(["a", "b"]),
            Task::new("U", "consumer").with_dependencies(["T", "S"]),
        ];

        let (tasks, plans) = apply_splits(tasks, 5.0);
        assert_eq!(plans.len(), 1);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["S", "T.1", "T.2", "U"]);
        assert_eq!(tasks[3].dependencies, vec!["T.1", "T.2", "S"]);
        assert!(detect_cycles(&tasks).is_empty());
    }

    #[test]
    fn test_split_children_are_never_split_again() {
        let task = Task::new("T.1", "child")
            .with_complexity(heavy(ComplexityDimension::SemanticDifficulty))
            .with_acceptance_criteria(["a", "b"]);
        let mut child = task;
        child.split_from = Some("T".to_string());
        assert!(plan_split(&child, 5.0).is_none());
    }

    #[test]
    fn test_colliding_child_ids_skip_split() {
        let tasks = vec![
            Task::new("T", "parser")
                .with_complexity(heavy(ComplexityDimension::SemanticDifficulty))
                .with_acceptance_criteria(["a", "b"]),
            Task::new("T.1", "unrelated"),
        ];
        let (tasks, plans) = apply_splits(tasks, 5.0);
        assert!(plans.is_empty());
        assert_eq!(tasks.len(), 2);
    }
}
