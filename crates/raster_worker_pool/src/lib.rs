//! Raster work scheduling on top of [`task_graph`].
//!
//! A [`RasterWorkerPool`] turns a prioritized [`RasterTaskQueue`] into a task
//! graph with two barrier tasks and reports back to a
//! [`RasterWorkerPoolClient`] once all raster work, and separately all work
//! required for activation, has finished.

mod canvas;
mod pool;
mod queue;
mod task;

pub use canvas::{RasterCanvasError, RasterSurface, ScopedRasterCanvas, SurfaceProvider};
pub use pool::{
    RASTER_FINISHED_TASK_PRIORITY, RASTER_REQUIRED_FOR_ACTIVATION_FINISHED_TASK_PRIORITY,
    RASTER_TASK_PRIORITY_BASE, RasterCompletionSignal, RasterWorkerPool, RasterWorkerPoolClient, RasterWorkerPoolError,
};
pub use queue::{QueuedRasterTask, RasterTaskQueue};
pub use task::{
    ContentDescriptor, ContentRect, ImageDecodeTask, ImageDecoder, RasterError, RasterResource,
    RasterTask, RasterTaskOutcome, Rasterizer, ResourceId,
};

#[cfg(test)]
mod tests;
