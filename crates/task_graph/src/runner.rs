use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};
use slotmap::SlotMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::graph::{TaskGraph, TaskGraphError};
use crate::task::{TaskHandle, TaskId};

/// Scopes a client's tasks inside a shared runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceToken(u64);

impl NamespaceToken {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGraphRunnerConfig {
    pub num_threads: usize,
    pub thread_name_prefix: String,
}

impl Default for TaskGraphRunnerConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            thread_name_prefix: "CompositorRaster".to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskGraphRunnerCreateError {
    #[error("task graph runner needs at least one worker thread")]
    NoWorkerThreads,
    #[error("failed to spawn task graph worker thread {index}")]
    SpawnWorker {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

slotmap::new_key_type! {
    struct NodeKey;
}

struct ScheduledNode {
    task: TaskHandle,
    priority: u32,
    sequence: u64,
    unsatisfied_dependencies: u32,
    dependents: SmallVec<[NodeKey; 4]>,
    running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyTask {
    priority: u32,
    sequence: u64,
    key: NodeKey,
}

impl ReadyTask {
    fn rank(&self) -> (u32, u64) {
        (self.priority, self.sequence)
    }
}

// `BinaryHeap` is a max-heap; the lowest (priority, sequence) must pop first.
impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TaskNamespace {
    nodes: SlotMap<NodeKey, ScheduledNode>,
    keys_by_task: HashMap<TaskId, NodeKey>,
    ready_to_run: BinaryHeap<ReadyTask>,
    running: Vec<TaskHandle>,
    completed: Vec<TaskHandle>,
}

impl TaskNamespace {
    fn has_finished_running_tasks(&self) -> bool {
        self.nodes.is_empty() && self.running.is_empty()
    }

    fn is_running(&self, task: TaskId) -> bool {
        self.running.iter().any(|running| running.id() == task)
    }

    /// Scheduled and not yet finished, or still executing.
    fn holds(&self, task: TaskId) -> bool {
        self.keys_by_task.contains_key(&task) || self.is_running(task)
    }

    fn push_ready(&mut self, key: NodeKey) {
        let node = &self.nodes[key];
        self.ready_to_run.push(ReadyTask {
            priority: node.priority,
            sequence: node.sequence,
            key,
        });
    }
}

#[derive(Default)]
struct RunnerState {
    namespaces: HashMap<NamespaceToken, TaskNamespace>,
    next_namespace_id: u64,
    next_sequence: u64,
    shutdown: bool,
}

impl RunnerState {
    /// Pops the best ready task across all namespaces and claims it.
    fn take_next_ready_task(&mut self) -> Option<(NamespaceToken, TaskHandle)> {
        loop {
            let token = self
                .namespaces
                .iter()
                .filter_map(|(token, namespace)| {
                    namespace.ready_to_run.peek().map(|ready| (ready.rank(), *token))
                })
                .min()
                .map(|(_, token)| token)?;
            let namespace = self.namespaces.get_mut(&token)?;
            let ready = namespace.ready_to_run.pop()?;
            let Some(node) = namespace.nodes.get_mut(ready.key) else {
                continue;
            };
            if node.running {
                continue;
            }
            let claimed = node.task.try_begin_running();
            assert!(
                claimed,
                "task {} was claimed outside of its namespace",
                node.task.id().raw()
            );
            node.running = true;
            let task = node.task.clone();
            namespace.running.push(task.clone());
            return Some((token, task));
        }
    }

    /// Returns true when new tasks became ready.
    fn finish_task(&mut self, token: NamespaceToken, task: TaskHandle) -> bool {
        let namespace = self
            .namespaces
            .get_mut(&token)
            .expect("namespace with a running task must stay registered");
        namespace.running.retain(|running| running.id() != task.id());

        let mut became_ready = false;
        if let Some(key) = namespace.keys_by_task.remove(&task.id()) {
            let node = namespace.nodes.remove(key).expect("task key maps to a live node");
            for dependent in node.dependents {
                let Some(dependent_node) = namespace.nodes.get_mut(dependent) else {
                    continue;
                };
                assert!(
                    dependent_node.unsatisfied_dependencies > 0,
                    "dependency count underflow for task {}",
                    dependent_node.task.id().raw()
                );
                dependent_node.unsatisfied_dependencies -= 1;
                if dependent_node.unsatisfied_dependencies == 0 && !dependent_node.running {
                    namespace.push_ready(dependent);
                    became_ready = true;
                }
            }
        }
        namespace.completed.push(task);
        became_ready
    }
}

struct RunnerShared {
    state: Mutex<RunnerState>,
    has_ready_to_run_tasks: Condvar,
    has_namespaces_with_finished_running_tasks: Condvar,
}

/// Fixed pool of worker threads executing the task graphs of any number of
/// independent namespaces.
///
/// The runner is created once and handed to its clients (usually behind an
/// `Arc`). Dropping it stops the workers after the tasks that are ready or
/// become ready have run.
pub struct TaskGraphRunner {
    shared: Arc<RunnerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskGraphRunner {
    pub fn new(config: TaskGraphRunnerConfig) -> Result<Self, TaskGraphRunnerCreateError> {
        if config.num_threads == 0 {
            return Err(TaskGraphRunnerCreateError::NoWorkerThreads);
        }
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState::default()),
            has_ready_to_run_tasks: Condvar::new(),
            has_namespaces_with_finished_running_tasks: Condvar::new(),
        });
        let mut runner = Self {
            shared,
            workers: Vec::with_capacity(config.num_threads),
        };
        for index in 0..config.num_threads {
            let worker_shared = Arc::clone(&runner.shared);
            let join_handle = std::thread::Builder::new()
                .name(format!("{}Worker{}", config.thread_name_prefix, index + 1))
                .spawn(move || worker_loop(worker_shared, index))
                .map_err(|source| TaskGraphRunnerCreateError::SpawnWorker { index, source })?;
            runner.workers.push(join_handle);
        }
        tracing::debug!(num_threads = config.num_threads, "task graph runner started");
        Ok(runner)
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn namespace_token(&self) -> NamespaceToken {
        let mut state = self.shared.state.lock();
        state.next_namespace_id += 1;
        NamespaceToken(state.next_namespace_id)
    }

    /// Replaces the graph of `namespace`.
    ///
    /// Tasks of the previous graph that have not started and are absent from
    /// `graph` are handed back as cancelled through
    /// [`Self::collect_completed_tasks`]. Tasks that are running keep running;
    /// their dependents in `graph` wait for them.
    pub fn schedule(
        &self,
        namespace: NamespaceToken,
        graph: &TaskGraph,
    ) -> Result<(), TaskGraphError> {
        let _span = tracing::trace_span!(
            "task_graph_runner.schedule",
            namespace = namespace.raw(),
            nodes = graph.nodes.len()
        )
        .entered();
        graph.validate()?;

        let mut state = self.shared.state.lock();
        if namespace.0 == 0 || namespace.0 > state.next_namespace_id {
            return Err(TaskGraphError::UnknownNamespace {
                namespace: namespace.raw(),
            });
        }
        for graph_node in &graph.nodes {
            let task = graph_node.task.id();
            let owner = state
                .namespaces
                .iter()
                .find(|(token, other)| **token != namespace && other.holds(task));
            if let Some((owner, _)) = owner {
                return Err(TaskGraphError::TaskInOtherNamespace {
                    task,
                    namespace: owner.raw(),
                });
            }
        }
        let sequence_base = state.next_sequence;
        state.next_sequence += graph.nodes.len() as u64;

        let task_namespace = state.namespaces.entry(namespace).or_default();
        let mut nodes = SlotMap::with_capacity_and_key(graph.nodes.len());
        let mut keys_by_task = HashMap::with_capacity(graph.nodes.len());
        for (index, graph_node) in graph.nodes.iter().enumerate() {
            let task = &graph_node.task;
            if task.has_finished_running() {
                continue;
            }
            let key = nodes.insert(ScheduledNode {
                task: task.clone(),
                priority: graph_node.priority,
                sequence: sequence_base + index as u64,
                unsatisfied_dependencies: 0,
                dependents: SmallVec::new(),
                running: task_namespace.is_running(task.id()),
            });
            keys_by_task.insert(task.id(), key);
        }
        for edge in &graph.edges {
            let (Some(&dependency), Some(&dependent)) = (
                keys_by_task.get(&edge.dependency),
                keys_by_task.get(&edge.dependent),
            ) else {
                // One side already finished running; nothing to wait for.
                continue;
            };
            nodes[dependency].dependents.push(dependent);
            nodes[dependent].unsatisfied_dependencies += 1;
        }

        let previous_nodes = std::mem::replace(&mut task_namespace.nodes, nodes);
        task_namespace.keys_by_task = keys_by_task;
        let mut cancelled = 0usize;
        for (_, previous) in previous_nodes {
            if previous.running
                || previous.task.has_finished_running()
                || task_namespace.keys_by_task.contains_key(&previous.task.id())
            {
                continue;
            }
            task_namespace.completed.push(previous.task);
            cancelled += 1;
        }

        task_namespace.ready_to_run.clear();
        let ready_keys: Vec<NodeKey> = task_namespace
            .nodes
            .iter()
            .filter(|(_, node)| node.unsatisfied_dependencies == 0 && !node.running)
            .map(|(key, _)| key)
            .collect();
        for key in ready_keys {
            task_namespace.push_ready(key);
        }
        if cancelled > 0 {
            tracing::debug!(
                namespace = namespace.raw(),
                cancelled,
                "superseded graph dropped tasks that had not started"
            );
        }
        let finished = task_namespace.has_finished_running_tasks();
        drop(state);

        self.shared.has_ready_to_run_tasks.notify_all();
        if finished {
            self.shared
                .has_namespaces_with_finished_running_tasks
                .notify_all();
        }
        Ok(())
    }

    /// Blocks until every task scheduled for `namespace` has run and no worker
    /// is executing one of them.
    pub fn wait_for_tasks_to_finish_running(&self, namespace: NamespaceToken) {
        let _span = tracing::trace_span!(
            "task_graph_runner.wait_for_tasks_to_finish_running",
            namespace = namespace.raw()
        )
        .entered();
        let mut state = self.shared.state.lock();
        loop {
            let finished = state
                .namespaces
                .get(&namespace)
                .is_none_or(TaskNamespace::has_finished_running_tasks);
            if finished {
                return;
            }
            self.shared
                .has_namespaces_with_finished_running_tasks
                .wait(&mut state);
        }
    }

    /// Moves every task of `namespace` that finished, or was cancelled by a
    /// graph replacement, since the last call into `completed_tasks`.
    pub fn collect_completed_tasks(
        &self,
        namespace: NamespaceToken,
        completed_tasks: &mut Vec<TaskHandle>,
    ) {
        let mut state = self.shared.state.lock();
        let Some(task_namespace) = state.namespaces.get_mut(&namespace) else {
            return;
        };
        completed_tasks.append(&mut task_namespace.completed);
        if task_namespace.has_finished_running_tasks() {
            state.namespaces.remove(&namespace);
        }
    }
}

impl Drop for TaskGraphRunner {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.has_ready_to_run_tasks.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("task graph worker thread panicked outside of a task");
            }
        }
    }
}

fn worker_loop(shared: Arc<RunnerShared>, thread_index: usize) {
    let mut state = shared.state.lock();
    loop {
        if let Some((namespace, task)) = state.take_next_ready_task() {
            run_task(&shared, &mut state, thread_index, namespace, task);
            continue;
        }
        if state.shutdown {
            break;
        }
        shared.has_ready_to_run_tasks.wait(&mut state);
    }
}

fn run_task(
    shared: &RunnerShared,
    state: &mut MutexGuard<'_, RunnerState>,
    thread_index: usize,
    namespace: NamespaceToken,
    task: TaskHandle,
) {
    MutexGuard::unlocked(state, || task.run(thread_index));

    let became_ready = state.finish_task(namespace, task);
    if became_ready {
        shared.has_ready_to_run_tasks.notify_all();
    }
    let finished = state
        .namespaces
        .get(&namespace)
        .is_some_and(TaskNamespace::has_finished_running_tasks);
    if finished {
        shared.has_namespaces_with_finished_running_tasks.notify_all();
    }
}
