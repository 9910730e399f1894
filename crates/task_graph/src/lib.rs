//! Dependency-graph task scheduling over a fixed pool of worker threads.
//!
//! Clients obtain a [`NamespaceToken`] from a shared [`TaskGraphRunner`], then
//! repeatedly submit a whole [`TaskGraph`] for that namespace and collect the
//! tasks that completed since the previous collection. Submitting a new graph
//! supersedes the tasks of the previous one that have not started yet.

mod graph;
mod runner;
mod task;

pub use graph::{TaskGraph, TaskGraphEdge, TaskGraphError, TaskGraphNode};
pub use runner::{
    NamespaceToken, TaskGraphRunner, TaskGraphRunnerConfig, TaskGraphRunnerCreateError,
};
pub use task::{Task, TaskHandle, TaskId};
