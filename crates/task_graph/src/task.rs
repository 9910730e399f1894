use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// A unit of work executed by a worker thread of a [`crate::TaskGraphRunner`].
///
/// The runner has no notion of task failure: whatever the body decides about
/// success has to be recorded inside the task itself and inspected by the
/// client after collection.
pub trait Task: Send + Sync + 'static {
    fn run_on_worker_thread(&self, thread_index: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

const RUN_STATE_PENDING: u8 = 0;
const RUN_STATE_RUNNING: u8 = 1;
const RUN_STATE_FINISHED: u8 = 2;

struct TaskCell {
    id: TaskId,
    run_state: AtomicU8,
    body: Arc<dyn Task>,
}

/// Shared identity of a task. Clones refer to the same task instance and the
/// body of that instance runs at most once, across every graph it is part of.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskCell>,
}

impl TaskHandle {
    pub fn new(task: impl Task) -> Self {
        Self::from_arc(Arc::new(task))
    }

    pub fn from_arc(body: Arc<dyn Task>) -> Self {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        assert!(id != u64::MAX, "task id space exhausted");
        Self {
            inner: Arc::new(TaskCell {
                id: TaskId(id),
                run_state: AtomicU8::new(RUN_STATE_PENDING),
                body,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// True once the body has returned (or unwound) on a worker thread.
    pub fn has_finished_running(&self) -> bool {
        self.inner.run_state.load(Ordering::Acquire) == RUN_STATE_FINISHED
    }

    pub fn is_running(&self) -> bool {
        self.inner.run_state.load(Ordering::Acquire) == RUN_STATE_RUNNING
    }

    /// Claims the task for execution. Fails when another worker already
    /// claimed it or it has already run.
    pub(crate) fn try_begin_running(&self) -> bool {
        self.inner
            .run_state
            .compare_exchange(
                RUN_STATE_PENDING,
                RUN_STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn run(&self, thread_index: usize) {
        debug_assert!(self.is_running(), "task must be claimed before running");
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.inner.body.run_on_worker_thread(thread_index)
        }));
        if outcome.is_err() {
            tracing::error!(
                task = self.id().raw(),
                thread_index,
                "task panicked on worker thread; reporting it as completed"
            );
        }
        self.inner
            .run_state
            .store(RUN_STATE_FINISHED, Ordering::Release);
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("run_state", &self.inner.run_state.load(Ordering::Relaxed))
            .finish()
    }
}
