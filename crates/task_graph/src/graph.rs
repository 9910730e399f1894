use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use thiserror::Error;

use crate::task::{TaskHandle, TaskId};

#[derive(Debug, Clone)]
pub struct TaskGraphNode {
    pub task: TaskHandle,
    pub priority: u32,
}

/// `dependent` becomes ready only after `dependency` has finished running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskGraphEdge {
    pub dependency: TaskId,
    pub dependent: TaskId,
}

/// A whole scheduling round for one namespace. Node order is significant:
/// among ready tasks of equal priority the one inserted first runs first.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    pub nodes: Vec<TaskGraphNode>,
    pub edges: Vec<TaskGraphEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskGraphError {
    #[error("task graph contains a dependency cycle through task {}", task.raw())]
    CyclicGraph { task: TaskId },
    #[error("task {} appears more than once in the task graph", task.raw())]
    DuplicateTask { task: TaskId },
    #[error("task graph edge references task {} which is not a node of the graph", task.raw())]
    UnknownEdgeEndpoint { task: TaskId },
    #[error("task {} is still scheduled in namespace {namespace}", task.raw())]
    TaskInOtherNamespace { task: TaskId, namespace: u64 },
    #[error("namespace {namespace} was not issued by this task graph runner")]
    UnknownNamespace { namespace: u64 },
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.nodes.iter().any(|node| node.task.id() == task)
    }

    /// Duplicates are only detected by [`Self::validate`].
    pub fn insert_node(&mut self, task: TaskHandle, priority: u32) {
        self.nodes.push(TaskGraphNode { task, priority });
    }

    pub fn add_edge(&mut self, dependency: TaskId, dependent: TaskId) {
        self.edges.push(TaskGraphEdge {
            dependency,
            dependent,
        });
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }

    /// Rejects graphs the runner cannot execute: duplicated nodes, edges to
    /// tasks outside the graph and dependency cycles.
    pub fn validate(&self) -> Result<(), TaskGraphError> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let mut dependency_graph = DiGraphMap::<TaskId, ()>::with_capacity(
            self.nodes.len(),
            self.edges.len(),
        );
        for node in &self.nodes {
            let task = node.task.id();
            if !seen.insert(task) {
                return Err(TaskGraphError::DuplicateTask { task });
            }
            dependency_graph.add_node(task);
        }
        for edge in &self.edges {
            for task in [edge.dependency, edge.dependent] {
                if !seen.contains(&task) {
                    return Err(TaskGraphError::UnknownEdgeEndpoint { task });
                }
            }
            if edge.dependency == edge.dependent {
                return Err(TaskGraphError::CyclicGraph {
                    task: edge.dependency,
                });
            }
            dependency_graph.add_edge(edge.dependency, edge.dependent, ());
        }
        toposort(&dependency_graph, None)
            .map(|_| ())
            .map_err(|cycle| TaskGraphError::CyclicGraph {
                task: cycle.node_id(),
            })
    }
}
