//! Frame graph
//!
//! Represents one frame's work as a DAG with topological levels. Nodes carry
//! explicit dependency edges and a thread affinity; nodes within one level
//! have no dependencies between them and may run in parallel.

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Unique identifier for a task within one frame graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which thread a task is allowed to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// May run on any worker thread
    Worker,
    /// Must run on the designated main (game) thread
    Main,
}

/// The work a task performs
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// A node in the frame graph
pub struct TaskNode {
    pub id: TaskId,
    pub affinity: Affinity,
    pub deps: Vec<TaskId>,
    pub work: Work,
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("affinity", &self.affinity)
            .field("deps", &self.deps)
            .finish()
    }
}

/// A topological level - tasks that can execute in parallel
pub struct Level {
    pub nodes: Vec<TaskNode>,
}

/// An executable frame graph, leveled and cycle-free
pub struct FrameGraph {
    pub levels: Vec<Level>,
}

impl FrameGraph {
    /// Total number of tasks
    pub fn task_count(&self) -> usize {
        self.levels.iter().map(|l| l.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Builder for constructing a frame graph from dependency information
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<TaskNode>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task with explicit dependencies
    pub fn add_task<F>(
        &mut self,
        id: impl Into<TaskId>,
        affinity: Affinity,
        deps: Vec<TaskId>,
        work: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.nodes.push(TaskNode {
            id: id.into(),
            affinity,
            deps,
            work: Box::new(work),
        });
    }

    /// Build the graph with topological leveling
    pub fn build(self) -> Result<FrameGraph> {
        validate(&self.nodes)?;
        let levels = topological_levels(self.nodes)?;
        Ok(FrameGraph { levels })
    }
}

fn validate(nodes: &[TaskNode]) -> Result<()> {
    let mut affinities: IndexMap<&TaskId, Affinity> = IndexMap::new();
    for node in nodes {
        if affinities.insert(&node.id, node.affinity).is_some() {
            return Err(Error::DuplicateTask(node.id.clone()));
        }
    }
    for node in nodes {
        for dep in &node.deps {
            let Some(dep_affinity) = affinities.get(dep) else {
                return Err(Error::UnknownDependency {
                    task: node.id.clone(),
                    dependency: dep.clone(),
                });
            };
            // Main-thread work is drained after the worker side of a frame
            // completes, so a worker task can never be ordered after it.
            if node.affinity == Affinity::Worker && *dep_affinity == Affinity::Main {
                return Err(Error::MainToWorkerDependency {
                    task: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Compute topological levels using Kahn's algorithm
fn topological_levels(nodes: Vec<TaskNode>) -> Result<Vec<Level>> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut in_degree: IndexMap<TaskId, usize> = IndexMap::new();
    let mut dependents: IndexMap<TaskId, Vec<TaskId>> = IndexMap::new();

    for node in &nodes {
        in_degree.insert(node.id.clone(), node.deps.len());
        for dep in &node.deps {
            dependents.entry(dep.clone()).or_default().push(node.id.clone());
        }
    }

    let mut remaining: IndexMap<TaskId, TaskNode> = nodes
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect();

    let mut levels = Vec::new();
    let mut current: Vec<TaskId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut processed = 0;

    while !current.is_empty() {
        // Sort for determinism
        current.sort_by(|a, b| a.0.cmp(&b.0));

        let mut next = Vec::new();
        for id in &current {
            if let Some(deps) = dependents.get(id) {
                for dep in deps {
                    let degree = in_degree.get_mut(dep).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dep.clone());
                    }
                }
            }
        }

        let level = Level {
            nodes: current
                .iter()
                .map(|id| remaining.shift_remove(id).unwrap())
                .collect(),
        };
        processed += level.nodes.len();
        levels.push(level);
        current = next;
    }

    if processed != in_degree.len() {
        let involved: Vec<TaskId> = remaining.keys().cloned().collect();
        return Err(Error::CycleDetected { involved });
    }

    Ok(levels)
}
