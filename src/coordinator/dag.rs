//! Task dependency DAG, scoped to one phase's task list rather than
//! phase-to-phase dependencies, using a Kahn's-algorithm cycle check.

use std::collections::{HashMap, HashSet};

use crate::errors::CoreError;
use crate::model::TaskSpec;

pub type TaskIndex = usize;

/// A dependency graph over one phase's task list.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<TaskSpec>,
    index_of: HashMap<String, TaskIndex>,
    forward_edges: Vec<Vec<TaskIndex>>,
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn task(&self, index: TaskIndex) -> &TaskSpec {
        &self.tasks[index]
    }

    pub fn index_of_id(&self, task_id: &str) -> Option<TaskIndex> {
        self.index_of.get(task_id).copied()
    }

    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks whose dependencies are all in `completed` and which are not
    /// themselves already in `completed`.
    pub fn ready_set(&self, completed: &HashSet<String>) -> Vec<&TaskSpec> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(i, t)| {
                !completed.contains(&t.task_id) && self.dependencies(*i).iter().all(|d| completed.contains(&self.tasks[*d].task_id))
            })
            .map(|(_, t)| t)
            .collect()
    }

    /// Topological layering ("waves"): wave 0 has no dependencies, wave k
    /// depends only on tasks in waves `< k`. The iterative/partial
    /// parallelism modes reuse this to fan out each wave together.
    pub fn waves(&self) -> Vec<Vec<TaskIndex>> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|d| d.len()).collect();
        let mut remaining: HashSet<TaskIndex> = (0..self.tasks.len()).collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let wave: Vec<TaskIndex> = remaining
                .iter()
                .copied()
                .filter(|i| in_degree[*i] == 0)
                .collect();
            if wave.is_empty() {
                break;
            }
            for &i in &wave {
                remaining.remove(&i);
                for &dependent in self.dependents(i) {
                    in_degree[dependent] = in_degree[dependent].saturating_sub(1);
                }
            }
            waves.push(wave);
        }

        waves
    }
}

/// Builds a `TaskGraph` from one phase's task list, rejecting cycles.
pub fn build_task_graph(tasks: Vec<TaskSpec>) -> Result<TaskGraph, CoreError> {
    let mut index_of = HashMap::new();
    for task in &tasks {
        if index_of.insert(task.task_id.clone(), index_of.len()).is_some() {
            return Err(CoreError::Fatal(crate::errors::FatalError::InvariantViolation(
                format!("duplicate task id {}", task.task_id),
            )));
        }
    }

    let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];
    let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];

    for (to_idx, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            let from_idx = *index_of
                .get(dep)
                .ok_or_else(|| CoreError::MissingInput(dep.clone()))?;
            forward_edges[from_idx].push(to_idx);
            reverse_edges[to_idx].push(from_idx);
        }
    }

    let graph = TaskGraph {
        tasks,
        index_of,
        forward_edges,
        reverse_edges,
    };

    validate_no_cycles(&graph)?;
    Ok(graph)
}

fn validate_no_cycles(graph: &TaskGraph) -> Result<(), CoreError> {
    let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|d| d.len()).collect();
    let mut queue: Vec<TaskIndex> = in_degree.iter().enumerate().filter(|&(_, d)| *d == 0).map(|(i, _)| i).collect();
    let mut processed = 0;

    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in graph.dependents(node) {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if processed != graph.len() {
        let cyclic: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, d)| *d > 0)
            .map(|(i, _)| graph.task(i).task_id.clone())
            .collect();
        return Err(CoreError::CyclicDependency(cyclic));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Budget, PriorityClass, TaskType};
    use chrono::Utc;

    fn task(id: &str, deps: Vec<&str>) -> TaskSpec {
        TaskSpec::new(
            id.into(),
            "build".into(),
            TaskType::Agent,
            "agent.x".into(),
            serde_json::json!({}),
            Budget::new(1.0, 100, 3),
            deps.into_iter().map(String::from).collect(),
            Utc::now(),
        )
        .with_priority(PriorityClass::P2)
    }

    #[test]
    fn waves_respect_dependency_order() {
        let graph = build_task_graph(vec![
            task("a", vec![]),
            task("b", vec!["a"]),
            task("c", vec!["a"]),
            task("d", vec!["b", "c"]),
        ])
        .unwrap();
        let waves = graph.waves();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec![0]);
        let mut wave1 = waves[1].clone();
        wave1.sort();
        assert_eq!(wave1, vec![1, 2]);
        assert_eq!(waves[2], vec![3]);
    }

    #[test]
    fn cycle_is_rejected() {
        let result = build_task_graph(vec![task("a", vec!["b"]), task("b", vec!["a"])]);
        assert!(matches!(result, Err(CoreError::CyclicDependency(_))));
    }

    #[test]
    fn missing_dependency_is_missing_input() {
        let result = build_task_graph(vec![task("a", vec!["ghost"])]);
        assert!(matches!(result, Err(CoreError::MissingInput(_))));
    }

    #[test]
    fn ready_set_only_returns_tasks_with_satisfied_dependencies() {
        let graph = build_task_graph(vec![task("a", vec![]), task("b", vec!["a"])]).unwrap();
        let completed = HashSet::new();
        let ready: Vec<&str> = graph.ready_set(&completed).iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        let mut completed = HashSet::new();
        completed.insert("a".to_string());
        let ready: Vec<&str> = graph.ready_set(&completed).iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn empty_graph_has_no_waves() {
        let graph = build_task_graph(vec![]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.waves().is_empty());
    }
}
