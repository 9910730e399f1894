use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use task_graph::{
    NamespaceToken, Task, TaskGraph, TaskGraphError, TaskGraphRunner, TaskHandle, TaskId,
};
use thiserror::Error;

use crate::canvas::{CanvasBroker, RasterCanvasError, ScopedRasterCanvas, SurfaceProvider};
use crate::queue::RasterTaskQueue;
use crate::task::{ImageDecodeTask, RasterTask, RasterTaskOutcome};

pub const RASTER_REQUIRED_FOR_ACTIVATION_FINISHED_TASK_PRIORITY: u32 = 1;
pub const RASTER_FINISHED_TASK_PRIORITY: u32 = 2;
pub const RASTER_TASK_PRIORITY_BASE: u32 = 3;

#[derive(Debug, Error)]
pub enum RasterWorkerPoolError {
    #[error("raster worker pool has been shut down")]
    ShutDown,
    #[error("raster task graph was rejected")]
    Graph(#[from] TaskGraphError),
}

/// Sent from a worker when a barrier task runs. Receiving one means
/// [`RasterWorkerPool::check_for_completed_tasks`] has something to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterCompletionSignal {
    RasterFinished,
    RasterRequiredForActivationFinished,
}

/// Receives the results of a [`RasterWorkerPool`] on the origin thread.
pub trait RasterWorkerPoolClient {
    fn did_finish_running_tasks(&mut self);
    fn did_finish_running_tasks_required_for_activation(&mut self);

    fn did_complete_raster_task(&mut self, _task: &RasterTask, _outcome: &RasterTaskOutcome) {}

    fn did_complete_image_decode_task(&mut self, _task: &ImageDecodeTask, _was_canceled: bool) {}
}

struct RasterFinishedTask {
    signal: RasterCompletionSignal,
    sender: Sender<RasterCompletionSignal>,
}

impl Task for RasterFinishedTask {
    fn run_on_worker_thread(&self, _thread_index: usize) {
        // The pool may be gone already; nobody is waiting then.
        let _ = self.sender.send(self.signal);
    }
}

enum WorkerPoolTask {
    Raster(RasterTask),
    ImageDecode(ImageDecodeTask),
    Barrier,
}

/// Client-facing adapter that compiles raster submissions into task graphs for
/// a shared [`TaskGraphRunner`].
///
/// All methods are meant to be called from one origin thread; only task bodies
/// run on workers.
pub struct RasterWorkerPool {
    runner: Arc<TaskGraphRunner>,
    namespace: NamespaceToken,
    canvas_broker: Arc<CanvasBroker>,
    completion_sender: Sender<RasterCompletionSignal>,
    completion_receiver: Receiver<RasterCompletionSignal>,
    scheduled_tasks: HashMap<TaskId, WorkerPoolTask>,
    raster_finished_task: Option<TaskHandle>,
    raster_required_for_activation_finished_task: Option<TaskHandle>,
    graph: TaskGraph,
    completed_tasks: Vec<TaskHandle>,
    is_shutdown: bool,
}

impl RasterWorkerPool {
    pub fn new(runner: Arc<TaskGraphRunner>, surface_provider: Arc<dyn SurfaceProvider>) -> Self {
        let namespace = runner.namespace_token();
        let (completion_sender, completion_receiver) = crossbeam_channel::unbounded();
        Self {
            runner,
            namespace,
            canvas_broker: Arc::new(CanvasBroker::new(surface_provider)),
            completion_sender,
            completion_receiver,
            scheduled_tasks: HashMap::new(),
            raster_finished_task: None,
            raster_required_for_activation_finished_task: None,
            graph: TaskGraph::new(),
            completed_tasks: Vec::new(),
            is_shutdown: false,
        }
    }

    pub fn namespace(&self) -> NamespaceToken {
        self.namespace
    }

    /// Wakeup channel for hosts that block instead of polling.
    pub fn completion_signals(&self) -> Receiver<RasterCompletionSignal> {
        self.completion_receiver.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Number of tasks handed to the runner and not yet reported back.
    pub fn pending_task_count(&self) -> usize {
        self.scheduled_tasks.len()
    }

    /// Surfaces currently held by running raster tasks or by the client.
    pub fn held_canvas_count(&self) -> usize {
        self.canvas_broker.held_count()
    }

    /// Replaces the current submission with the contents of `queue`.
    ///
    /// The queue is consumed. Raster tasks of the previous submission that are
    /// missing from `queue` and have not started are reported back as
    /// [`RasterTaskOutcome::Canceled`].
    pub fn schedule_tasks(
        &mut self,
        queue: &mut RasterTaskQueue,
    ) -> Result<(), RasterWorkerPoolError> {
        let _span = tracing::debug_span!(
            "raster_worker_pool.schedule_tasks",
            tasks = queue.len(),
            required_for_activation = queue.required_for_activation_count()
        )
        .entered();
        if self.is_shutdown {
            return Err(RasterWorkerPoolError::ShutDown);
        }

        let raster_finished_task = TaskHandle::new(RasterFinishedTask {
            signal: RasterCompletionSignal::RasterFinished,
            sender: self.completion_sender.clone(),
        });
        let required_for_activation_finished_task = TaskHandle::new(RasterFinishedTask {
            signal: RasterCompletionSignal::RasterRequiredForActivationFinished,
            sender: self.completion_sender.clone(),
        });

        self.graph.clear();
        let mut raster_tasks: Vec<RasterTask> = Vec::with_capacity(queue.len());
        let mut decode_tasks: Vec<ImageDecodeTask> = Vec::new();
        let mut inserted: HashSet<TaskId> = HashSet::with_capacity(queue.len());
        for item in queue.iter() {
            let raster_task = &item.task;
            assert!(
                !raster_task.has_completed(),
                "raster task {} was already completed",
                raster_task.id().raw()
            );
            if !inserted.insert(raster_task.id()) {
                tracing::warn!(
                    task = raster_task.id().raw(),
                    "raster task queued twice; keeping the first entry"
                );
                continue;
            }
            let priority = RASTER_TASK_PRIORITY_BASE.saturating_add(item.priority);
            for decode_task in raster_task.dependencies() {
                if decode_task.has_completed() {
                    continue;
                }
                if inserted.insert(decode_task.id()) {
                    self.graph.insert_node(decode_task.handle().clone(), priority);
                    decode_tasks.push(decode_task.clone());
                }
                self.graph.add_edge(decode_task.id(), raster_task.id());
            }
            raster_task.bind_canvas_broker(&self.canvas_broker);
            self.graph.insert_node(raster_task.handle().clone(), priority);
            self.graph.add_edge(raster_task.id(), raster_finished_task.id());
            if item.required_for_activation {
                self.graph.add_edge(
                    raster_task.id(),
                    required_for_activation_finished_task.id(),
                );
            }
            raster_tasks.push(raster_task.clone());
        }
        self.graph.insert_node(
            required_for_activation_finished_task.clone(),
            RASTER_REQUIRED_FOR_ACTIVATION_FINISHED_TASK_PRIORITY,
        );
        self.graph
            .insert_node(raster_finished_task.clone(), RASTER_FINISHED_TASK_PRIORITY);

        self.runner.schedule(self.namespace, &self.graph)?;

        // Tasks carried over from the previous submission stay scheduled.
        for decode_task in decode_tasks {
            if !decode_task.has_been_scheduled() {
                decode_task.schedule_on_origin_thread();
            }
            self.scheduled_tasks
                .insert(decode_task.id(), WorkerPoolTask::ImageDecode(decode_task));
        }
        for raster_task in raster_tasks {
            if !raster_task.has_been_scheduled() {
                raster_task.schedule_on_origin_thread();
            }
            self.scheduled_tasks
                .insert(raster_task.id(), WorkerPoolTask::Raster(raster_task));
        }
        self.scheduled_tasks
            .insert(raster_finished_task.id(), WorkerPoolTask::Barrier);
        self.scheduled_tasks.insert(
            required_for_activation_finished_task.id(),
            WorkerPoolTask::Barrier,
        );
        self.raster_finished_task = Some(raster_finished_task);
        self.raster_required_for_activation_finished_task =
            Some(required_for_activation_finished_task);
        queue.reset();
        tracing::debug!(namespace = self.namespace.raw(), "raster tasks scheduled");
        Ok(())
    }

    /// Reports every task that completed or was cancelled since the previous
    /// call, then fires the barrier notifications of the current submission.
    pub fn check_for_completed_tasks(&mut self, client: &mut dyn RasterWorkerPoolClient) {
        let _span =
            tracing::trace_span!("raster_worker_pool.check_for_completed_tasks").entered();
        self.runner
            .collect_completed_tasks(self.namespace, &mut self.completed_tasks);

        let mut required_for_activation_finished = false;
        let mut raster_finished = false;
        for handle in self.completed_tasks.drain(..) {
            let Some(task) = self.scheduled_tasks.remove(&handle.id()) else {
                tracing::warn!(task = handle.id().raw(), "completed task was never scheduled");
                continue;
            };
            match task {
                WorkerPoolTask::Raster(raster_task) => {
                    let outcome = raster_task.complete_on_origin_thread();
                    client.did_complete_raster_task(&raster_task, &outcome);
                }
                WorkerPoolTask::ImageDecode(decode_task) => {
                    let was_canceled = decode_task.complete_on_origin_thread();
                    client.did_complete_image_decode_task(&decode_task, was_canceled);
                }
                WorkerPoolTask::Barrier => {
                    if !handle.has_finished_running() {
                        continue;
                    }
                    if self.raster_finished_task.as_ref() == Some(&handle) {
                        raster_finished = true;
                    } else if self.raster_required_for_activation_finished_task.as_ref()
                        == Some(&handle)
                    {
                        required_for_activation_finished = true;
                    }
                }
            }
        }

        if required_for_activation_finished {
            self.raster_required_for_activation_finished_task = None;
            client.did_finish_running_tasks_required_for_activation();
        }
        if raster_finished {
            self.raster_finished_task = None;
            client.did_finish_running_tasks();
        }
    }

    /// Holds the destination surface of `task` until the returned guard drops.
    pub fn acquire_canvas_for_raster(
        &self,
        task: &RasterTask,
    ) -> Result<ScopedRasterCanvas, RasterCanvasError> {
        self.canvas_broker.acquire(task.resource())
    }

    pub fn release_canvas_for_raster(&self, canvas: ScopedRasterCanvas) {
        drop(canvas);
    }

    /// Cancels everything that has not started and waits for running tasks.
    /// Completed and cancelled tasks can still be collected afterwards.
    pub fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _span = tracing::debug_span!(
            "raster_worker_pool.shutdown",
            namespace = self.namespace.raw()
        )
        .entered();
        self.graph.clear();
        if let Err(error) = self.runner.schedule(self.namespace, &self.graph) {
            tracing::error!(%error, "failed to cancel raster tasks on shutdown");
        }
        self.runner.wait_for_tasks_to_finish_running(self.namespace);
        self.raster_finished_task = None;
        self.raster_required_for_activation_finished_task = None;
        self.is_shutdown = true;
    }
}

impl Drop for RasterWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        // Releases the namespace inside the runner.
        self.runner
            .collect_completed_tasks(self.namespace, &mut self.completed_tasks);
    }
}
