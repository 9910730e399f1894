use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use task_graph::{Task, TaskHandle, TaskId};
use thiserror::Error;

use crate::canvas::{CanvasBroker, RasterCanvasError, RasterSurface};

/// Destination texture of a raster task. Ownership of the texture memory
/// lives outside of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterResource {
    pub id: ResourceId,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// What to paint: the layer region and scale a rasterizer replays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentDescriptor {
    pub layer_id: u64,
    pub tile_id: u64,
    pub content_rect: ContentRect,
    pub contents_scale: f32,
    pub source_frame_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RasterError {
    #[error("content rect {width}x{height} does not fit the {surface_width}x{surface_height} surface")]
    ContentExceedsSurface {
        width: u32,
        height: u32,
        surface_width: u32,
        surface_height: u32,
    },
    #[error("rasterization backend failed: {0}")]
    Backend(String),
}

/// Paints content into a held surface. Called on worker threads only.
pub trait Rasterizer: Send + Sync {
    fn rasterize(
        &self,
        surface: &mut RasterSurface,
        content: &ContentDescriptor,
    ) -> Result<(), RasterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterTaskOutcome {
    Rasterized,
    RasterFailed(RasterError),
    CanvasUnavailable(RasterCanvasError),
    /// Superseded by a later submission before it started.
    Canceled,
}

/// Scheduled/completed bookkeeping shared by raster and decode tasks.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    did_schedule: bool,
    did_complete: bool,
}

impl Lifecycle {
    fn schedule(&mut self) {
        assert!(!self.did_complete, "completed task scheduled again");
        assert!(!self.did_schedule, "task scheduled twice without completing");
        self.did_schedule = true;
    }

    fn complete(&mut self) {
        assert!(self.did_schedule, "task completed without being scheduled");
        assert!(!self.did_complete, "task completed twice");
        self.did_schedule = false;
        self.did_complete = true;
    }
}

struct RasterTaskState {
    resource: RasterResource,
    content: ContentDescriptor,
    rasterizer: Arc<dyn Rasterizer>,
    dependencies: Vec<ImageDecodeTask>,
    canvas_broker: OnceLock<Arc<CanvasBroker>>,
    outcome: Mutex<Option<RasterTaskOutcome>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Task for RasterTaskState {
    fn run_on_worker_thread(&self, thread_index: usize) {
        let _span = tracing::trace_span!(
            "raster_task.run",
            thread_index,
            layer_id = self.content.layer_id,
            tile_id = self.content.tile_id
        )
        .entered();
        let broker = self
            .canvas_broker
            .get()
            .expect("raster task runs only after being scheduled by a pool");
        let outcome = match broker.acquire(&self.resource) {
            Ok(mut canvas) => {
                match self.rasterizer.rasterize(canvas.surface_mut(), &self.content) {
                    Ok(()) => RasterTaskOutcome::Rasterized,
                    Err(error) => {
                        tracing::debug!(%error, tile_id = self.content.tile_id, "raster failed");
                        RasterTaskOutcome::RasterFailed(error)
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "raster task could not acquire a canvas");
                RasterTaskOutcome::CanvasUnavailable(error)
            }
        };
        *self.outcome.lock() = Some(outcome);
    }
}

/// Paints one tile into its destination resource.
///
/// Clones share the task; the body runs at most once.
#[derive(Clone)]
pub struct RasterTask {
    state: Arc<RasterTaskState>,
    handle: TaskHandle,
}

impl RasterTask {
    pub fn new(
        resource: RasterResource,
        content: ContentDescriptor,
        rasterizer: Arc<dyn Rasterizer>,
        dependencies: Vec<ImageDecodeTask>,
    ) -> Self {
        let state = Arc::new(RasterTaskState {
            resource,
            content,
            rasterizer,
            dependencies,
            canvas_broker: OnceLock::new(),
            outcome: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
        });
        let handle = TaskHandle::from_arc(state.clone());
        Self { state, handle }
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn resource(&self) -> &RasterResource {
        &self.state.resource
    }

    pub fn content(&self) -> &ContentDescriptor {
        &self.state.content
    }

    pub fn dependencies(&self) -> &[ImageDecodeTask] {
        &self.state.dependencies
    }

    pub fn has_finished_running(&self) -> bool {
        self.handle.has_finished_running()
    }

    pub fn has_completed(&self) -> bool {
        self.state.lifecycle.lock().did_complete
    }

    /// Result recorded by the worker, `None` until the body has run.
    pub fn outcome(&self) -> Option<RasterTaskOutcome> {
        self.state.outcome.lock().clone()
    }

    pub(crate) fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Must happen before the task can reach a worker.
    pub(crate) fn bind_canvas_broker(&self, broker: &Arc<CanvasBroker>) {
        let bound = self.state.canvas_broker.get_or_init(|| Arc::clone(broker));
        assert!(
            Arc::ptr_eq(bound, broker),
            "raster task scheduled on two different pools"
        );
    }

    pub(crate) fn has_been_scheduled(&self) -> bool {
        self.state.lifecycle.lock().did_schedule
    }

    pub(crate) fn schedule_on_origin_thread(&self) {
        self.state.lifecycle.lock().schedule();
    }

    pub(crate) fn complete_on_origin_thread(&self) -> RasterTaskOutcome {
        self.state.lifecycle.lock().complete();
        if !self.handle.has_finished_running() {
            return RasterTaskOutcome::Canceled;
        }
        self.outcome()
            .expect("finished raster task always records an outcome")
    }
}

impl fmt::Debug for RasterTask {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RasterTask")
            .field("id", &self.id())
            .field("resource", &self.state.resource)
            .field("content", &self.state.content)
            .finish()
    }
}

/// Forces decoding of image pixels a raster task depends on.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self);
}

struct ImageDecodeTaskState {
    decoder: Arc<dyn ImageDecoder>,
    lifecycle: Mutex<Lifecycle>,
}

impl Task for ImageDecodeTaskState {
    fn run_on_worker_thread(&self, thread_index: usize) {
        let _span = tracing::trace_span!("image_decode_task.run", thread_index).entered();
        self.decoder.decode();
    }
}

/// Decode work shared by every raster task that lists it as a dependency.
#[derive(Clone)]
pub struct ImageDecodeTask {
    state: Arc<ImageDecodeTaskState>,
    handle: TaskHandle,
}

impl ImageDecodeTask {
    pub fn new(decoder: Arc<dyn ImageDecoder>) -> Self {
        let state = Arc::new(ImageDecodeTaskState {
            decoder,
            lifecycle: Mutex::new(Lifecycle::default()),
        });
        let handle = TaskHandle::from_arc(state.clone());
        Self { state, handle }
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn has_finished_running(&self) -> bool {
        self.handle.has_finished_running()
    }

    pub fn has_completed(&self) -> bool {
        self.state.lifecycle.lock().did_complete
    }

    pub(crate) fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub(crate) fn has_been_scheduled(&self) -> bool {
        self.state.lifecycle.lock().did_schedule
    }

    pub(crate) fn schedule_on_origin_thread(&self) {
        self.state.lifecycle.lock().schedule();
    }

    /// Returns whether the decode was canceled before it ran.
    pub(crate) fn complete_on_origin_thread(&self) -> bool {
        self.state.lifecycle.lock().complete();
        !self.handle.has_finished_running()
    }
}

impl fmt::Debug for ImageDecodeTask {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ImageDecodeTask")
            .field("id", &self.id())
            .finish()
    }
}
